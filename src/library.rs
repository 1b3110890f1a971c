//! Filesystem media listing for the local-folder variant of the backend.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::model::Post;

pub const FILE_ROUTE: &str = "/api/media/file/";

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov"];

/// One directory scan plus when it was taken.
#[derive(Debug, Clone)]
pub struct ScanCache {
    pub data: Arc<Vec<Post>>,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl ScanCache {
    pub fn is_stale(&self, now: Instant) -> bool {
        is_stale(self.fetched_at, self.ttl, now)
    }
}

pub fn is_stale(fetched_at: Instant, ttl: Duration, now: Instant) -> bool {
    now.saturating_duration_since(fetched_at) >= ttl
}

#[derive(Debug, Clone)]
pub struct MediaPage {
    pub records: Vec<Post>,
    pub has_more: bool,
    pub total: usize,
}

pub struct Library {
    root: PathBuf,
    ttl: Duration,
    cache: Mutex<Option<ScanCache>>,
}

impl Library {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::Configuration(format!(
                "media directory {} does not exist",
                root.display()
            )));
        }
        Ok(Self {
            root,
            ttl,
            cache: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 1-based page of records, newest files first.
    pub fn page(&self, page: usize, limit: usize) -> Result<MediaPage> {
        if page == 0 || limit == 0 {
            return Err(Error::InvalidRequest(
                "page and limit must be positive".into(),
            ));
        }
        let records = self.records(Instant::now());
        let start = (page - 1).saturating_mul(limit).min(records.len());
        let end = start.saturating_add(limit).min(records.len());
        Ok(MediaPage {
            records: records[start..end].to_vec(),
            has_more: end < records.len(),
            total: records.len(),
        })
    }

    /// Maps a record id (optionally carrying its file extension) back to a
    /// file under the root.
    pub fn resolve(&self, id: &str) -> Result<PathBuf> {
        let encoded = id.split('.').next().unwrap_or_default();
        let relative = decode_id(encoded).ok_or_else(|| Error::NotFound(format!("media {id}")))?;
        let relative = Path::new(&relative);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(Error::NotFound(format!("media {id}")));
        }
        let path = self.root.join(relative);
        if !path.is_file() {
            return Err(Error::NotFound(format!("media {id}")));
        }
        Ok(path)
    }

    pub fn invalidate(&self) {
        self.cache.lock().take();
    }

    fn records(&self, now: Instant) -> Arc<Vec<Post>> {
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.as_ref() {
            if !existing.is_stale(now) {
                return existing.data.clone();
            }
        }
        let data = Arc::new(self.scan());
        info!(root = %self.root.display(), files = data.len(), "media library scanned");
        *cache = Some(ScanCache {
            data: data.clone(),
            fetched_at: now,
            ttl: self.ttl,
        });
        data
    }

    fn scan(&self) -> Vec<Post> {
        let mut found: Vec<(u64, Post)> = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable entry: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(ext) = media_extension(entry.path()) else {
                continue;
            };
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let modified = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|age| age.as_secs())
                .unwrap_or(0);
            found.push((modified, record_for(relative, &ext, modified)));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        debug!(count = found.len(), "scan complete");
        found.into_iter().map(|(_, post)| post).collect()
    }
}

fn media_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) || VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(ext)
    } else {
        None
    }
}

fn record_for(relative: &Path, ext: &str, modified: u64) -> Post {
    let id = encode_id(relative);
    let title = relative
        .file_stem()
        .map(|stem| stem.to_string_lossy().replace(['_', '-'], " "))
        .unwrap_or_default();
    let group = relative
        .parent()
        .and_then(|parent| parent.components().next())
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .unwrap_or_else(|| "library".to_string());
    let is_video = VIDEO_EXTENSIONS.contains(&ext);
    Post {
        name: relative.to_string_lossy().into_owned(),
        url: format!("{FILE_ROUTE}{id}.{ext}"),
        permalink: format!("{FILE_ROUTE}{id}.{ext}"),
        title,
        subreddit: group,
        author: "local".to_string(),
        domain: "local".to_string(),
        created_utc: modified as f64,
        post_hint: if is_video { "hosted:video" } else { "image" }.to_string(),
        is_video,
        id,
        ..Post::default()
    }
}

pub fn encode_id(relative: &Path) -> String {
    let normalized = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    URL_SAFE_NO_PAD.encode(normalized.as_bytes())
}

pub fn decode_id(id: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(id.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

//! Media resolution for listing records.
//!
//! A record is mapped to a renderable descriptor by walking [`RULES`] in
//! order and taking the first rule that produces something. Several rules can
//! match the same post (an `i.redd.it` link with a `.gif` extension, say), so
//! the order of the table is the behavior.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{Post, RedditVideo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Gif,
    Embeddable,
    Unresolvable,
}

/// Closed classification used by the media-type filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Gif,
}

impl MediaType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" | "images" => Some(MediaType::Image),
            "video" | "videos" => Some(MediaType::Video),
            "gif" | "gifs" => Some(MediaType::Gif),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolved {
    pub kind: MediaKind,
    pub primary_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_thumbnail: Option<String>,
}

impl Resolved {
    fn new(kind: MediaKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            primary_url: url.into(),
            embed_url: None,
            provider: None,
            fallback_thumbnail: None,
        }
    }

    pub fn media_type(&self) -> Option<MediaType> {
        match self.kind {
            MediaKind::Image => Some(MediaType::Image),
            MediaKind::Video => Some(MediaType::Video),
            MediaKind::Gif | MediaKind::Embeddable => Some(MediaType::Gif),
            MediaKind::Unresolvable => None,
        }
    }
}

pub struct Rule {
    pub name: &'static str,
    resolve: fn(&Post) -> Option<Resolved>,
}

pub static RULES: &[Rule] = &[
    Rule {
        name: "extension",
        resolve: by_extension,
    },
    Rule {
        name: "native-video",
        resolve: by_native_video,
    },
    Rule {
        name: "embed-provider",
        resolve: by_embed_provider,
    },
    Rule {
        name: "image-host",
        resolve: by_image_host,
    },
    Rule {
        name: "hint-or-cdn",
        resolve: by_hint_or_cdn,
    },
    Rule {
        name: "preview",
        resolve: by_preview,
    },
    Rule {
        name: "thumbnail",
        resolve: by_thumbnail,
    },
];

pub fn resolve(post: &Post) -> Resolved {
    resolve_with_rule(post).1
}

/// Same as [`resolve`], also naming the rule that fired (`"link"` when none).
pub fn resolve_with_rule(post: &Post) -> (&'static str, Resolved) {
    for rule in RULES {
        if let Some(resolved) = (rule.resolve)(post) {
            return (rule.name, resolved);
        }
    }
    let mut link = Resolved::new(MediaKind::Unresolvable, post.url.clone());
    link.fallback_thumbnail = usable_thumbnail(post);
    ("link", link)
}

pub fn classify(post: &Post) -> Option<MediaType> {
    resolve(post).media_type()
}

/// Provider-side filter: keep only submissions that look like media.
pub fn is_displayable(post: &Post) -> bool {
    if post.title.trim().is_empty() {
        return false;
    }
    let url = post.url.as_str();
    post.is_video
        || post.post_hint == "image"
        || extension_kind(url).is_some()
        || DISPLAYABLE_HOSTS.iter().any(|host| url.contains(host))
}

const DISPLAYABLE_HOSTS: &[&str] = &["imgur.com", "gfycat.com", "redgifs.com", "i.redd.it"];

static EXTENSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.(jpe?g|png|webp|gif|gifv|mp4|webm|mov)$").expect("valid extension regex")
});

struct Provider {
    name: &'static str,
    host: &'static str,
    pattern: &'static Lazy<Regex>,
    build: fn(&str) -> Resolved,
}

static REDGIFS_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"redgifs\.com/(?:watch/|ifr/)?([A-Za-z0-9]+)").expect("valid redgifs regex")
});

static GFYCAT_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"gfycat\.com/(?:ifr/|gifs/detail/)?([A-Za-z]+)").expect("valid gfycat regex")
});

static PROVIDERS: &[Provider] = &[
    Provider {
        name: "redgifs",
        host: "redgifs.com",
        pattern: &REDGIFS_ID,
        build: redgifs_embed,
    },
    Provider {
        name: "gfycat",
        host: "gfycat.com",
        pattern: &GFYCAT_ID,
        build: gfycat_video,
    },
];

fn redgifs_embed(id: &str) -> Resolved {
    Resolved {
        kind: MediaKind::Embeddable,
        primary_url: format!("https://redgifs.com/watch/{id}"),
        embed_url: Some(format!("https://redgifs.com/ifr/{id}")),
        provider: Some("redgifs"),
        fallback_thumbnail: None,
    }
}

fn gfycat_video(id: &str) -> Resolved {
    Resolved {
        kind: MediaKind::Video,
        primary_url: format!("https://giant.gfycat.com/{id}.mp4"),
        embed_url: None,
        provider: Some("gfycat"),
        fallback_thumbnail: None,
    }
}

fn extension_kind(url: &str) -> Option<(MediaKind, String)> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let caps = EXTENSION.captures(path)?;
    let ext = caps.get(1)?.as_str().to_ascii_lowercase();
    match ext.as_str() {
        "gif" => Some((MediaKind::Gif, url.to_string())),
        "gifv" => Some((MediaKind::Video, format!("{}.mp4", &path[..path.len() - 5]))),
        "mp4" | "webm" | "mov" => Some((MediaKind::Video, url.to_string())),
        _ => Some((MediaKind::Image, url.to_string())),
    }
}

fn by_extension(post: &Post) -> Option<Resolved> {
    let (kind, url) = extension_kind(&post.url)?;
    Some(Resolved::new(kind, url))
}

fn by_native_video(post: &Post) -> Option<Resolved> {
    let video = post
        .media
        .as_ref()
        .and_then(|media| media.reddit_video.as_ref())
        .or_else(|| {
            post.secure_media
                .as_ref()
                .and_then(|media| media.reddit_video.as_ref())
        })
        .or(post.preview.reddit_video_preview.as_ref())?;
    let url = playback_url(video)?;
    let kind = if video.is_gif {
        MediaKind::Gif
    } else {
        MediaKind::Video
    };
    let mut resolved = Resolved::new(kind, url);
    resolved.fallback_thumbnail = usable_thumbnail(post);
    Some(resolved)
}

fn playback_url(video: &RedditVideo) -> Option<String> {
    [&video.fallback_url, &video.hls_url, &video.dash_url]
        .into_iter()
        .map(|url| sanitize_url(url))
        .find(|url| !url.is_empty())
}

fn by_embed_provider(post: &Post) -> Option<Resolved> {
    let url = post.url.as_str();
    let provider = PROVIDERS
        .iter()
        .find(|provider| url.contains(provider.host) || post.domain == provider.host)?;
    let id = provider
        .pattern
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().split('-').next().unwrap_or_default().to_string())
        .filter(|id| !id.is_empty() && id != "watch" && id != "ifr");

    match id {
        Some(id) => {
            let mut resolved = (provider.build)(&id);
            resolved.fallback_thumbnail = usable_thumbnail(post);
            Some(resolved)
        }
        None => {
            let mut link = Resolved::new(MediaKind::Unresolvable, url);
            link.provider = Some(provider.name);
            link.fallback_thumbnail = usable_thumbnail(post);
            Some(link)
        }
    }
}

fn by_image_host(post: &Post) -> Option<Resolved> {
    if !post.url.contains("imgur.com") {
        return None;
    }
    let base = post.url.trim_end_matches('/');
    Some(Resolved::new(MediaKind::Image, format!("{base}.jpg")))
}

fn by_hint_or_cdn(post: &Post) -> Option<Resolved> {
    if post.post_hint == "image" || post.url.contains("i.redd.it") || post.domain == "i.redd.it" {
        return Some(Resolved::new(MediaKind::Image, post.url.clone()));
    }
    None
}

fn by_preview(post: &Post) -> Option<Resolved> {
    let source = &post.preview.images.first()?.source;
    let url = sanitize_url(&source.url);
    if url.is_empty() {
        return None;
    }
    Some(Resolved::new(MediaKind::Image, url))
}

fn by_thumbnail(post: &Post) -> Option<Resolved> {
    usable_thumbnail(post).map(|url| Resolved::new(MediaKind::Image, url))
}

fn usable_thumbnail(post: &Post) -> Option<String> {
    let thumb = post.thumbnail.trim();
    match thumb {
        "" | "default" | "self" | "nsfw" | "spoiler" | "image" => None,
        _ if thumb.starts_with("http") => Some(sanitize_url(thumb)),
        _ => None,
    }
}

fn sanitize_url(raw: &str) -> String {
    raw.trim().replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PostMedia, PreviewImage, PreviewSource};

    fn post(url: &str) -> Post {
        Post {
            id: "p".into(),
            title: "Sample".into(),
            url: url.into(),
            ..Post::default()
        }
    }

    #[test]
    fn extension_wins_over_cdn_hint() {
        let mut p = post("https://i.redd.it/abc.gif");
        p.post_hint = "image".into();
        let (rule, resolved) = resolve_with_rule(&p);
        assert_eq!(rule, "extension");
        assert_eq!(resolved.kind, MediaKind::Gif);
    }

    #[test]
    fn gifv_is_rewritten_to_mp4() {
        let resolved = resolve(&post("https://i.imgur.com/xyz.gifv"));
        assert_eq!(resolved.kind, MediaKind::Video);
        assert_eq!(resolved.primary_url, "https://i.imgur.com/xyz.mp4");
    }

    #[test]
    fn native_video_prefers_fallback_and_decodes_entities() {
        let mut p = post("https://v.redd.it/abc");
        p.is_video = true;
        p.media = Some(PostMedia {
            reddit_video: Some(RedditVideo {
                fallback_url: "https://v.redd.it/abc/DASH_720.mp4?source=fallback&amp;x=1".into(),
                hls_url: "https://v.redd.it/abc/HLSPlaylist.m3u8".into(),
                ..RedditVideo::default()
            }),
        });
        let resolved = resolve(&p);
        assert_eq!(resolved.kind, MediaKind::Video);
        assert_eq!(
            resolved.primary_url,
            "https://v.redd.it/abc/DASH_720.mp4?source=fallback&x=1"
        );
    }

    #[test]
    fn video_preview_counts_as_native_video() {
        let mut p = post("https://example.com/clip");
        p.preview.reddit_video_preview = Some(RedditVideo {
            hls_url: "https://v.redd.it/x/HLS.m3u8".into(),
            is_gif: true,
            ..RedditVideo::default()
        });
        let resolved = resolve(&p);
        assert_eq!(resolved.kind, MediaKind::Gif);
        assert_eq!(resolved.primary_url, "https://v.redd.it/x/HLS.m3u8");
    }

    #[test]
    fn redgifs_watch_url_becomes_embed() {
        let resolved = resolve(&post("https://www.redgifs.com/watch/brightcalmotter?ref=x"));
        assert_eq!(resolved.kind, MediaKind::Embeddable);
        assert_eq!(
            resolved.embed_url.as_deref(),
            Some("https://redgifs.com/ifr/brightcalmotter")
        );
        assert_eq!(resolved.media_type(), Some(MediaType::Gif));
    }

    #[test]
    fn redgifs_without_id_is_link_out() {
        let resolved = resolve(&post("https://redgifs.com/"));
        assert_eq!(resolved.kind, MediaKind::Unresolvable);
        assert_eq!(resolved.provider, Some("redgifs"));
    }

    #[test]
    fn gfycat_id_is_cut_at_dash() {
        let resolved = resolve(&post("https://gfycat.com/SomeAnimal-funny-clip"));
        assert_eq!(resolved.kind, MediaKind::Video);
        assert_eq!(resolved.primary_url, "https://giant.gfycat.com/SomeAnimal.mp4");
    }

    #[test]
    fn imgur_without_extension_gets_jpg() {
        let resolved = resolve(&post("https://imgur.com/AbCdEf"));
        assert_eq!(resolved.kind, MediaKind::Image);
        assert_eq!(resolved.primary_url, "https://imgur.com/AbCdEf.jpg");
    }

    #[test]
    fn preview_then_thumbnail_then_link() {
        let mut p = post("https://example.com/article");
        p.preview.images.push(PreviewImage {
            source: PreviewSource {
                url: "https://preview.redd.it/a.jpg?w=1&amp;s=2".into(),
                ..PreviewSource::default()
            },
            ..PreviewImage::default()
        });
        assert_eq!(resolve(&p).primary_url, "https://preview.redd.it/a.jpg?w=1&s=2");

        let mut p = post("https://example.com/article");
        p.thumbnail = "https://b.thumbs.redditmedia.com/t.jpg".into();
        let (rule, resolved) = resolve_with_rule(&p);
        assert_eq!(rule, "thumbnail");
        assert_eq!(resolved.kind, MediaKind::Image);

        let mut p = post("https://example.com/article");
        p.thumbnail = "self".into();
        let (rule, resolved) = resolve_with_rule(&p);
        assert_eq!(rule, "link");
        assert_eq!(resolved.kind, MediaKind::Unresolvable);
        assert!(resolved.fallback_thumbnail.is_none());
    }

    #[test]
    fn displayable_requires_title_and_media_signal() {
        assert!(is_displayable(&post("https://i.redd.it/a.png")));
        assert!(is_displayable(&post("https://imgur.com/a/xyz")));
        assert!(!is_displayable(&post("https://example.com/article")));

        let mut comment = post("https://i.redd.it/a.png");
        comment.title.clear();
        assert!(!is_displayable(&comment));
    }

    #[test]
    fn library_file_urls_classify_by_extension() {
        assert_eq!(
            classify(&post("/api/media/file/Zm9vL2Jhci5tcDQ.mp4")),
            Some(MediaType::Video)
        );
    }
}

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;

const DEFAULT_ENV_PREFIX: &str = "GALLERY";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reddit: RedditConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub gallery: GalleryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// The backend cannot exchange codes without both halves of the app
    /// credentials.
    pub fn require_reddit_credentials(&self) -> Result<(), Error> {
        let mut missing = Vec::new();
        if self.reddit.client_id.trim().is_empty() {
            missing.push("REDDIT_CLIENT_ID");
        }
        if self.reddit.client_secret.trim().is_empty() {
            missing.push("REDDIT_CLIENT_SECRET");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(format!(
                "missing {}",
                missing.join(" and ")
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_server_workers")]
    pub workers: usize,
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: default_server_workers(),
            backend_url: default_backend_url(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:4000".into()
}

fn default_server_workers() -> usize {
    4
}

fn default_backend_url() -> String {
    "http://localhost:4000".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedditConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            user_agent: default_user_agent(),
            scopes: default_scopes(),
            redirect_uri: default_redirect_uri(),
            page_limit: default_page_limit(),
        }
    }
}

fn default_user_agent() -> String {
    "web:reddit-saved-gallery:v1.0".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["history".into(), "identity".into(), "save".into()]
}

fn default_redirect_uri() -> String {
    "http://localhost:3000/auth-callback".into()
}

fn default_page_limit() -> u32 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub cache_ttl: Duration,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: None,
            cache_ttl: default_cache_ttl(),
            page_size: default_page_size(),
        }
    }
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_page_size() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GalleryConfig {
    #[serde(default = "default_lookahead")]
    pub lookahead: usize,
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,
    #[serde(default = "default_random_order")]
    pub random_order: bool,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            lookahead: default_lookahead(),
            debounce: default_debounce(),
            random_order: default_random_order(),
        }
    }
}

fn default_lookahead() -> usize {
    3
}

fn default_debounce() -> Duration {
    Duration::from_millis(150)
}

fn default_random_order() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix, env::vars());

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.server.bind.is_empty() {
        base.server.bind = other.server.bind;
    }
    if other.server.workers != 0 {
        base.server.workers = other.server.workers;
    }
    if !other.server.backend_url.is_empty() {
        base.server.backend_url = other.server.backend_url;
    }

    if !other.reddit.client_id.is_empty() {
        base.reddit.client_id = other.reddit.client_id;
    }
    if !other.reddit.client_secret.is_empty() {
        base.reddit.client_secret = other.reddit.client_secret;
    }
    if !other.reddit.user_agent.is_empty() {
        base.reddit.user_agent = other.reddit.user_agent;
    }
    if !other.reddit.scopes.is_empty() {
        base.reddit.scopes = other.reddit.scopes;
    }
    if !other.reddit.redirect_uri.is_empty() {
        base.reddit.redirect_uri = other.reddit.redirect_uri;
    }
    if other.reddit.page_limit != 0 {
        base.reddit.page_limit = other.reddit.page_limit;
    }

    if other.library.root.is_some() {
        base.library.root = other.library.root;
    }
    base.library.cache_ttl = other.library.cache_ttl;
    if other.library.page_size != 0 {
        base.library.page_size = other.library.page_size;
    }

    base.gallery.lookahead = other.gallery.lookahead;
    base.gallery.debounce = other.gallery.debounce;
    base.gallery.random_order = other.gallery.random_order;

    if other.storage.path.is_some() {
        base.storage.path = other.storage.path;
    }

    base
}

/// Prefixed variables (`GALLERY_SECTION__KEY`) win over the plain names the
/// original deployment used.
fn apply_env<I>(cfg: &mut Config, prefix: &str, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    let mut plain: Vec<(String, String)> = Vec::new();

    for (key, value) in vars {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        } else if let Some(mapped) = plain_env_key(&key) {
            plain.push((mapped.to_string(), value));
        }
    }

    for (key, value) in plain {
        apply_env_value(cfg, &key, value);
    }
    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn plain_env_key(key: &str) -> Option<&'static str> {
    match key {
        "REDDIT_CLIENT_ID" => Some("reddit.client_id"),
        "REDDIT_CLIENT_SECRET" => Some("reddit.client_secret"),
        "REDDIT_CALLBACK_URL" => Some("reddit.redirect_uri"),
        "MEDIA_DIR" => Some("library.root"),
        _ => None,
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "server.bind" => cfg.server.bind = value,
        "server.workers" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.server.workers = parsed;
            }
        }
        "server.backend_url" => cfg.server.backend_url = value,
        "reddit.client_id" => cfg.reddit.client_id = value,
        "reddit.client_secret" => cfg.reddit.client_secret = value,
        "reddit.user_agent" => cfg.reddit.user_agent = value,
        "reddit.redirect_uri" => cfg.reddit.redirect_uri = value,
        "reddit.scopes" => {
            cfg.reddit.scopes = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "reddit.page_limit" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.reddit.page_limit = parsed;
            }
        }
        "library.root" => cfg.library.root = Some(PathBuf::from(value)),
        "library.cache_ttl" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.library.cache_ttl = duration;
            }
        }
        "library.page_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.library.page_size = parsed;
            }
        }
        "gallery.lookahead" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.gallery.lookahead = parsed;
            }
        }
        "gallery.debounce" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.gallery.debounce = duration;
            }
        }
        "gallery.random_order" => {
            cfg.gallery.random_order = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
        "storage.path" => cfg.storage.path = Some(PathBuf::from(value)),
        _ => {}
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("saved-gallery").join("config.yaml"))
}

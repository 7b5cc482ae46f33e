//! Application configuration management

use std::collections::BTreeMap;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::media::{DEFAULT_ENCODER_COMMAND, TranscodeCommand};

/// Extensions listed by the browse API when `MEDIA_EXTENSIONS` is not set.
const DEFAULT_MEDIA_EXTENSIONS: &str = ".mkv,.mp4,.m4v,.avi,.mov,.webm,.ts,.wmv";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address
    pub host: IpAddr,

    /// Server port
    pub port: u16,

    /// Transcode cache directory (manifests and segments, flat)
    pub cache_path: PathBuf,

    /// Cache budget in bytes; zero or negative disables eviction
    pub cache_size: i64,

    /// Period of the eviction cycle
    pub cache_scan_interval: Duration,

    /// Encoder command template
    pub encoder: TranscodeCommand,

    /// Extensions shown when browsing (lowercase, with leading dot)
    pub media_extensions: Vec<String>,

    /// Named library roots exposed to clients
    pub library_roots: BTreeMap<String, PathBuf>,

    /// Web UI directory
    pub static_path: PathBuf,

    /// Delay between manifest polls on a cache miss
    pub stream_poll_interval: Duration,

    /// Manifest polls before giving up
    pub stream_poll_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let encoder_template = var("ENCODER_COMMAND", DEFAULT_ENCODER_COMMAND);
        let encoder = TranscodeCommand::parse(&encoder_template)
            .with_context(|| format!("Invalid ENCODER_COMMAND: {}", encoder_template))?;

        Ok(Self {
            host: var("HOST", "0.0.0.0").parse().context("Invalid HOST")?,

            port: var("PORT", "8080").parse().context("Invalid PORT")?,

            cache_path: trim_dir(&var("CACHE_PATH", "./data/cache")),

            cache_size: var("CACHE_SIZE", "0")
                .parse()
                .context("Invalid CACHE_SIZE")?,

            cache_scan_interval: Duration::from_secs(
                var("CACHE_SCAN_INTERVAL_SECS", "60")
                    .parse()
                    .context("Invalid CACHE_SCAN_INTERVAL_SECS")?,
            ),

            encoder,

            media_extensions: parse_extensions(&var("MEDIA_EXTENSIONS", DEFAULT_MEDIA_EXTENSIONS)),

            library_roots: parse_roots(&var("LIBRARY_ROOTS", ""))?,

            static_path: PathBuf::from(var("STATIC_PATH", "./static")),

            stream_poll_interval: Duration::from_millis(
                var("STREAM_POLL_INTERVAL_MS", "500")
                    .parse()
                    .context("Invalid STREAM_POLL_INTERVAL_MS")?,
            ),

            stream_poll_attempts: var("STREAM_POLL_ATTEMPTS", "30")
                .parse()
                .context("Invalid STREAM_POLL_ATTEMPTS")?,
        })
    }
}

/// Drop trailing slashes but keep a bare `/`.
fn trim_dir(path: &str) -> PathBuf {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

fn parse_extensions(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|ext| ext.trim().to_lowercase())
        .filter(|ext| !ext.is_empty())
        .map(|ext| {
            if ext.starts_with('.') {
                ext
            } else {
                format!(".{}", ext)
            }
        })
        .collect()
}

/// Parse `name=path` pairs separated by commas.
fn parse_roots(value: &str) -> Result<BTreeMap<String, PathBuf>> {
    let mut roots = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, path) = entry
            .split_once('=')
            .map(|(n, p)| (n.trim(), p.trim()))
            .filter(|(n, p)| !n.is_empty() && !p.is_empty() && !n.contains('/'))
            .with_context(|| format!("Invalid LIBRARY_ROOTS entry: {}", entry))?;
        roots.insert(name.to_string(), trim_dir(path));
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.cache_path, PathBuf::from("./data/cache"));
        assert_eq!(config.cache_size, 0);
        assert_eq!(config.cache_scan_interval, Duration::from_secs(60));
        assert_eq!(config.encoder.program(), "ffmpeg");
        assert_eq!(config.stream_poll_interval, Duration::from_millis(500));
        assert_eq!(config.stream_poll_attempts, 30);
        assert!(config.library_roots.is_empty());
        assert!(config.media_extensions.contains(&".mkv".to_string()));
    }

    #[test]
    fn test_library_roots_and_paths() {
        let config = config(&[
            ("LIBRARY_ROOTS", "movies=/mnt/movies/, tv = /mnt/tv"),
            ("CACHE_PATH", "/var/cache/streamcache/"),
            ("CACHE_SIZE", "1073741824"),
            ("MEDIA_EXTENSIONS", "MKV, .mp4"),
        ])
        .unwrap();

        assert_eq!(config.library_roots["movies"], PathBuf::from("/mnt/movies"));
        assert_eq!(config.library_roots["tv"], PathBuf::from("/mnt/tv"));
        assert_eq!(config.cache_path, PathBuf::from("/var/cache/streamcache"));
        assert_eq!(config.cache_size, 1_073_741_824);
        assert_eq!(config.media_extensions, vec![".mkv", ".mp4"]);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(config(&[("ENCODER_COMMAND", "")]).is_err());
        assert!(config(&[("ENCODER_COMMAND", "ffmpeg -vf 'scale")]).is_err());
        assert!(config(&[("PORT", "http")]).is_err());
        assert!(config(&[("CACHE_SIZE", "1GB")]).is_err());
        assert!(config(&[("LIBRARY_ROOTS", "movies")]).is_err());
        assert!(config(&[("LIBRARY_ROOTS", "a/b=/mnt")]).is_err());
    }

    #[test]
    fn test_negative_cache_size_is_allowed() {
        let config = config(&[("CACHE_SIZE", "-1")]).unwrap();
        assert_eq!(config.cache_size, -1);
    }

    #[test]
    fn test_trim_dir_keeps_root() {
        assert_eq!(trim_dir("/"), PathBuf::from("/"));
        assert_eq!(trim_dir("/srv/"), PathBuf::from("/srv"));
    }
}

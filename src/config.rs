use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use log::LevelFilter;

use crate::db::app_data_dir;
use crate::queue::DEFAULT_MAX_CONCURRENT;

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Process configuration, read once at startup from the environment and `.env`.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub log_level: LevelFilter,
    pub log_file: PathBuf,
    pub log_console: bool,
    pub ffmpeg_path: Option<PathBuf>,
    pub yt_dlp_path: Option<PathBuf>,
    pub download_path: PathBuf,
    pub max_concurrent_downloads: usize,
    pub history_limit: u32,
    /// Problems found while parsing. Logged once logging is up.
    pub warnings: Vec<String>,
}

impl AppConfig {
    /// Load `.env` (if any) and read the process environment.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let data_dir = app_data_dir().context("resolve app data directory")?;
        Ok(Self::from_lookup(&data_dir, |key| std::env::var(key).ok()))
    }

    /// Build a config from an arbitrary key lookup. Unparsable values fall back to defaults.
    pub fn from_lookup<F>(data_dir: &Path, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let log_level = match get("LOG_LEVEL") {
            Some(raw) => parse_level(&raw).unwrap_or_else(|| {
                warnings.push(format!("LOG_LEVEL '{raw}' is not a log level; using INFO"));
                LevelFilter::Info
            }),
            None => LevelFilter::Info,
        };

        let log_console = match get("LOG_CONSOLE") {
            Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
                warnings.push(format!("LOG_CONSOLE '{raw}' is not a boolean; using true"));
                true
            }),
            None => true,
        };

        let max_concurrent_downloads = match get("MAX_CONCURRENT_DOWNLOADS") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    warnings.push(format!(
                        "MAX_CONCURRENT_DOWNLOADS '{raw}' must be a positive integer; using {DEFAULT_MAX_CONCURRENT}"
                    ));
                    DEFAULT_MAX_CONCURRENT
                }
            },
            None => DEFAULT_MAX_CONCURRENT,
        };

        let history_limit = match get("HISTORY_LIMIT") {
            Some(raw) => match raw.parse::<u32>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    warnings.push(format!(
                        "HISTORY_LIMIT '{raw}' must be a positive integer; using {DEFAULT_HISTORY_LIMIT}"
                    ));
                    DEFAULT_HISTORY_LIMIT
                }
            },
            None => DEFAULT_HISTORY_LIMIT,
        };

        Self {
            db_path: get("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("tubeshelf.sqlite3")),
            log_level,
            log_file: get("LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("logs").join("app.log")),
            log_console,
            ffmpeg_path: get("FFMPEG_PATH").map(PathBuf::from),
            yt_dlp_path: get("YT_DLP_PATH").map(PathBuf::from),
            download_path: get("DOWNLOAD_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_download_path),
            max_concurrent_downloads,
            history_limit,
            warnings,
        }
    }
}

pub fn default_download_path() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("Downloads"))
        .join("yt-downloads")
}

/// Accepts `log` level names plus the `WARNING` / `CRITICAL` spellings.
fn parse_level(raw: &str) -> Option<LevelFilter> {
    match raw.to_ascii_uppercase().as_str() {
        "WARNING" => Some(LevelFilter::Warn),
        "CRITICAL" | "FATAL" => Some(LevelFilter::Error),
        other => LevelFilter::from_str(other).ok(),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> AppConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(Path::new("/data/tubeshelf"), |k| env.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_from(&[]);
        assert_eq!(config.db_path, PathBuf::from("/data/tubeshelf/tubeshelf.sqlite3"));
        assert_eq!(config.log_file, PathBuf::from("/data/tubeshelf/logs/app.log"));
        assert_eq!(config.log_level, LevelFilter::Info);
        assert!(config.log_console);
        assert_eq!(config.ffmpeg_path, None);
        assert_eq!(config.max_concurrent_downloads, 2);
        assert_eq!(config.history_limit, 50);
        assert!(config.download_path.ends_with("yt-downloads"));
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("DB_PATH", "/tmp/lib.db"),
            ("LOG_LEVEL", "debug"),
            ("LOG_CONSOLE", "false"),
            ("FFMPEG_PATH", "/usr/bin/ffmpeg"),
            ("MAX_CONCURRENT_DOWNLOADS", "4"),
            ("DOWNLOAD_PATH", "/media/yt"),
        ]);
        assert_eq!(config.db_path, PathBuf::from("/tmp/lib.db"));
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert!(!config.log_console);
        assert_eq!(config.ffmpeg_path, Some(PathBuf::from("/usr/bin/ffmpeg")));
        assert_eq!(config.max_concurrent_downloads, 4);
        assert_eq!(config.download_path, PathBuf::from("/media/yt"));
    }

    #[test]
    fn bad_values_fall_back_with_warnings() {
        let config = config_from(&[
            ("LOG_LEVEL", "loud"),
            ("LOG_CONSOLE", "maybe"),
            ("MAX_CONCURRENT_DOWNLOADS", "0"),
            ("HISTORY_LIMIT", "-3"),
            ("FFMPEG_PATH", "   "),
        ]);
        assert_eq!(config.log_level, LevelFilter::Info);
        assert!(config.log_console);
        assert_eq!(config.max_concurrent_downloads, 2);
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.ffmpeg_path, None);
        assert_eq!(config.warnings.len(), 4);
    }

    #[test]
    fn python_style_level_names() {
        assert_eq!(parse_level("WARNING"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("critical"), Some(LevelFilter::Error));
        assert_eq!(parse_level("TRACE"), Some(LevelFilter::Trace));
    }
}

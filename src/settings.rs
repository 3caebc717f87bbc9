//! User preferences, kept in the `settings` table as one JSON value per key.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::models::MediaFormat;

/// User-editable options. Missing fields fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Where downloads land when no destination is given.
    #[serde(default = "default_download_folder")]
    pub download_folder: PathBuf,

    #[serde(default = "default_format")]
    pub default_format: MediaFormat,

    /// Worker threads allowed at once.
    #[serde(default = "default_concurrency")]
    pub max_concurrent: u32,

    /// Explicit ffmpeg binary. `None` means discover it on PATH.
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Rows shown by the history view.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            download_folder: default_download_folder(),
            default_format: default_format(),
            max_concurrent: default_concurrency(),
            ffmpeg_path: None,
            history_limit: default_history_limit(),
        }
    }
}

impl UserSettings {
    /// Settings seeded from the environment, used until the user saves their own.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            download_folder: config.download_path.clone(),
            default_format: default_format(),
            max_concurrent: config.max_concurrent_downloads as u32,
            ffmpeg_path: config.ffmpeg_path.clone(),
            history_limit: config.history_limit,
        }
    }

    /// Names accepted by [`UserSettings::apply`].
    pub const KEYS: [&'static str; 5] = [
        "download_folder",
        "default_format",
        "max_concurrent",
        "ffmpeg_path",
        "history_limit",
    ];

    /// Update one field from its textual form (the `set <key> <value>` command).
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "download_folder" => {
                if value.is_empty() {
                    return Err(AppError::Validation("download_folder cannot be empty".into()));
                }
                self.download_folder = PathBuf::from(value);
            }
            "default_format" => {
                self.default_format = MediaFormat::parse(value).ok_or_else(|| {
                    AppError::Validation(format!("unknown format '{value}' (use video or audio)"))
                })?;
            }
            "max_concurrent" => self.max_concurrent = parse_positive(key, value)?,
            "history_limit" => self.history_limit = parse_positive(key, value)?,
            "ffmpeg_path" => {
                self.ffmpeg_path = match value {
                    "" | "auto" | "none" => None,
                    path => Some(PathBuf::from(path)),
                };
            }
            other => {
                return Err(AppError::Validation(format!(
                    "unknown setting '{other}' (expected one of: {})",
                    Self::KEYS.join(", ")
                )))
            }
        }
        Ok(())
    }

    /// Checks run before saving. A missing ffmpeg binary is a configuration error.
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.ffmpeg_path {
            validate_ffmpeg_path(path)?;
        }
        if self.max_concurrent == 0 {
            return Err(AppError::Config("max_concurrent must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u32> {
    match value.parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(AppError::Validation(format!(
            "{key} must be a positive integer, got '{value}'"
        ))),
    }
}

/// Creates the download folder when missing. Failure is a configuration error.
pub fn ensure_download_folder(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        AppError::Config(format!("cannot use download folder {}: {e}", path.display()))
    })
}

/// The ffmpeg override must point at an existing file.
pub fn validate_ffmpeg_path(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(AppError::Config(format!(
            "ffmpeg not found at {}. Install ffmpeg or clear the ffmpeg_path setting.",
            path.display()
        )));
    }
    Ok(())
}

fn default_download_folder() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(|| PathBuf::from("Downloads"))
        .join("yt-downloads")
}

fn default_format() -> MediaFormat {
    MediaFormat::Video
}

fn default_concurrency() -> u32 {
    2
}

fn default_history_limit() -> u32 {
    50
}

/// Row keys in the `settings` table.
pub mod keys {
    pub const USER_SETTINGS: &str = "user_settings";
    pub const LAST_DESTINATION: &str = "last_destination";
}

/// One raw row of the settings table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingRow {
    pub key: String,
    pub value: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Typed access to the `settings` table over a borrowed connection.
pub struct SettingsManager<'a> {
    conn: &'a Connection,
}

impl<'a> SettingsManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Deserializes the value stored under `key`, if any.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let result: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match result.flatten() {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Upserts `value` as JSON and stamps `updated_at`.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;

        self.conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, json, Utc::now()],
        )?;
        log::debug!("Setting '{}' saved", key);

        Ok(())
    }

    /// Delete a setting by key. Returns whether a row existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    pub fn list(&self) -> Result<Vec<SettingRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM settings ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(SettingRow {
                key: row.get(0)?,
                value: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Saved settings, or the built-in defaults.
    pub fn get_user_settings(&self) -> Result<UserSettings> {
        self.get_user_settings_or(UserSettings::default())
    }

    /// Get the user settings, or `fallback` when nothing was saved yet.
    pub fn get_user_settings_or(&self, fallback: UserSettings) -> Result<UserSettings> {
        Ok(self
            .get::<UserSettings>(keys::USER_SETTINGS)?
            .unwrap_or(fallback))
    }

    /// Validate, then save user settings.
    pub fn save_user_settings(&self, settings: &UserSettings) -> Result<()> {
        settings.validate()?;
        self.set(keys::USER_SETTINGS, settings)
    }

    /// Folder of the most recent explicit `download ... <dest>`.
    pub fn get_last_destination(&self) -> Result<Option<PathBuf>> {
        self.get::<PathBuf>(keys::LAST_DESTINATION)
    }

    pub fn save_last_destination(&self, path: &Path) -> Result<()> {
        self.set(keys::LAST_DESTINATION, &path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[test]
    fn test_default_settings() {
        let settings = UserSettings::default();
        assert_eq!(settings.max_concurrent, 2);
        assert_eq!(settings.history_limit, 50);
        assert_eq!(settings.default_format, MediaFormat::Video);
        assert!(settings.download_folder.ends_with("yt-downloads"));
    }

    #[test]
    fn test_settings_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        let manager = SettingsManager::new(db.conn());

        let mut settings = UserSettings::default();
        settings.max_concurrent = 4;
        settings.download_folder = PathBuf::from("/custom/path");
        settings.default_format = MediaFormat::Audio;

        manager.save_user_settings(&settings).unwrap();
        let loaded = manager.get_user_settings().unwrap();

        assert_eq!(loaded, settings);

        let rows = manager.list().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, keys::USER_SETTINGS);
        assert!(rows[0].updated_at.is_some());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let db = Db::open_in_memory().unwrap();
        let manager = SettingsManager::new(db.conn());
        db.conn()
            .execute(
                "INSERT INTO settings (key, value) VALUES ('user_settings', '{\"history_limit\": 10}')",
                [],
            )
            .unwrap();

        let loaded = manager.get_user_settings().unwrap();
        assert_eq!(loaded.history_limit, 10);
        assert_eq!(loaded.max_concurrent, 2);
    }

    #[test]
    fn test_missing_ffmpeg_is_config_error() {
        let db = Db::open_in_memory().unwrap();
        let manager = SettingsManager::new(db.conn());

        let mut settings = UserSettings::default();
        settings.ffmpeg_path = Some(PathBuf::from("/definitely/not/here/ffmpeg"));

        let err = manager.save_user_settings(&settings).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(manager.get::<UserSettings>(keys::USER_SETTINGS).unwrap().is_none());
    }

    #[test]
    fn test_existing_ffmpeg_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ffmpeg");
        std::fs::write(&fake, b"").unwrap();

        let mut settings = UserSettings::default();
        settings.apply("ffmpeg_path", fake.to_str().unwrap()).unwrap();
        assert!(settings.validate().is_ok());

        settings.apply("ffmpeg_path", "auto").unwrap();
        assert_eq!(settings.ffmpeg_path, None);
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut settings = UserSettings::default();
        assert!(settings.apply("max_concurrent", "0").is_err());
        assert!(settings.apply("max_concurrent", "many").is_err());
        assert!(settings.apply("default_format", "flac").is_err());
        assert!(settings.apply("theme", "dark").is_err());

        settings.apply("default_format", "mp3").unwrap();
        settings.apply("max_concurrent", "3").unwrap();
        assert_eq!(settings.default_format, MediaFormat::Audio);
        assert_eq!(settings.max_concurrent, 3);
    }

    #[test]
    fn test_last_destination_and_delete() {
        let db = Db::open_in_memory().unwrap();
        let manager = SettingsManager::new(db.conn());

        assert!(manager.get_last_destination().unwrap().is_none());
        manager.save_last_destination(Path::new("/music")).unwrap();
        assert_eq!(
            manager.get_last_destination().unwrap(),
            Some(PathBuf::from("/music"))
        );

        assert!(manager.delete(keys::LAST_DESTINATION).unwrap());
        assert!(!manager.delete(keys::LAST_DESTINATION).unwrap());
        assert!(manager.get_last_destination().unwrap().is_none());
    }

    #[test]
    fn download_folder_is_created_or_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_download_folder(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_download_folder(&nested).unwrap();

        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"").unwrap();
        assert!(matches!(
            ensure_download_folder(&file.join("inner")),
            Err(AppError::Config(_))
        ));
    }
}

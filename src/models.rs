use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Output format requested for a download.
/// - `Video`: best mp4 video+audio, merged
/// - `Audio`: best audio, extracted to mp3 through ffmpeg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaFormat {
    Video,
    Audio,
}

impl MediaFormat {
    /// Container extension the engine is asked to produce.
    pub fn extension(self) -> &'static str {
        match self {
            MediaFormat::Video => "mp4",
            MediaFormat::Audio => "mp3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "video" | "mp4" => Some(MediaFormat::Video),
            "audio" | "mp3" => Some(MediaFormat::Audio),
            _ => None,
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// What a submitted URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Video,
    Playlist,
    Channel,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Video => "video",
            SourceKind::Playlist => "playlist",
            SourceKind::Channel => "channel",
        }
    }

    /// Playlists and channels both expand into one job per entry.
    pub fn is_collection(self) -> bool {
        !matches!(self, SourceKind::Video)
    }
}

/// A library video, keyed by the external (YouTube) video id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub title: String,
    pub duration: Option<i64>,
    pub channel: Option<String>,
    pub upload_date: Option<String>,
    pub url: String,
    pub file_path: Option<String>,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Video {
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            duration: None,
            channel: None,
            upload_date: None,
            url: url.into(),
            file_path: None,
            thumbnail_url: None,
            description: None,
            created_at: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Playlist {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            url: None,
            created_at: None,
            updated_at: None,
        }
    }
}

/// A video as it appears inside a playlist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaylistItem {
    pub video: Video,
    pub position: i64,
    pub added_at: Option<DateTime<Utc>>,
}

/// Persistent status of one download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl HistoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryStatus::Pending => "pending",
            HistoryStatus::Downloading => "downloading",
            HistoryStatus::Completed => "completed",
            HistoryStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => HistoryStatus::Pending,
            "downloading" => HistoryStatus::Downloading,
            "completed" => HistoryStatus::Completed,
            "failed" => HistoryStatus::Failed,
            _ => return None,
        })
    }
}

/// Fields for a new history row.
#[derive(Debug, Clone, Default)]
pub struct NewHistory {
    pub video_id: Option<String>,
    pub playlist_id: Option<String>,
    pub status: Option<HistoryStatus>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub download_started_at: Option<DateTime<Utc>>,
    pub download_completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Audit record of one download attempt, joined with its subject's titles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub video_id: Option<String>,
    pub playlist_id: Option<String>,
    pub status: HistoryStatus,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub download_started_at: Option<DateTime<Utc>>,
    pub download_completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,

    pub video_title: Option<String>,
    pub video_url: Option<String>,
    pub playlist_title: Option<String>,
}

impl HistoryEntry {
    /// Folder containing the downloaded file, if any.
    pub fn folder(&self) -> Option<PathBuf> {
        let path = PathBuf::from(self.file_path.as_deref()?);
        path.parent().map(|p| p.to_path_buf())
    }
}

/// Normalized download progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// 0..=100
    pub percent: Option<f64>,
    pub bytes_downloaded: Option<u64>,
    pub bytes_total: Option<u64>,
    pub speed_bps: Option<u64>,
    pub eta_seconds: Option<u64>,
}

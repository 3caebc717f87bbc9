use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::Progress;

/// Sending half held by workers. `send` never blocks, so it is safe from plain threads.
pub type EventSender = mpsc::UnboundedSender<AppEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AppEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// A suggested follow-up the UI can print next to a failure.
/// `kind` should be stable; the UI can map it to a command hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Retry,
    InstallFfmpeg,
    UpdateYtDlp,
    OpenSettings,
    OpenLogs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub kind: ActionKind,
    pub label: String,
}

/// Stable error codes to allow UX mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Forbidden,
    Unavailable,
    Private,
    AgeRestricted,
    LoginRequired,
    GeoRestricted,
    FfmpegMissing,
    Network,
    ToolMissing,
    Canceled,
    Unknown,
}

impl ErrorCode {
    /// Remediation hints shown with a failed job.
    pub fn actions(&self) -> Vec<Action> {
        match self {
            ErrorCode::FfmpegMissing => vec![
                action(ActionKind::InstallFfmpeg, "Install ffmpeg or set its path"),
                action(ActionKind::OpenSettings, "set ffmpeg_path <path>"),
            ],
            ErrorCode::ToolMissing => vec![action(
                ActionKind::UpdateYtDlp,
                "Install yt-dlp or set YT_DLP_PATH",
            )],
            ErrorCode::Forbidden => vec![
                action(ActionKind::UpdateYtDlp, "Update yt-dlp"),
                action(ActionKind::Retry, "Retry"),
            ],
            ErrorCode::Network | ErrorCode::Canceled => vec![action(ActionKind::Retry, "Retry")],
            ErrorCode::Unknown => vec![
                action(ActionKind::Retry, "Retry"),
                action(ActionKind::OpenLogs, "Check the log file"),
            ],
            ErrorCode::Unavailable
            | ErrorCode::Private
            | ErrorCode::AgeRestricted
            | ErrorCode::LoginRequired
            | ErrorCode::GeoRestricted => Vec::new(),
        }
    }
}

pub fn action(kind: ActionKind, label: impl Into<String>) -> Action {
    Action {
        kind,
        label: label.into(),
    }
}

/// Minimal metadata for queue display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    pub video_id: String,
    pub title: String,
    pub channel: Option<String>,
    pub duration_seconds: Option<i64>,
}

/// Worker -> UI events. The UI loop is the only consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum AppEvent {
    // Queue
    JobQueued {
        id: Uuid,
        url: String,
    },
    JobStarted {
        id: Uuid,
    },
    JobRetried {
        id: Uuid,
    },
    JobRemoved {
        id: Uuid,
    },
    QueuePaused,
    QueueResumed,

    // Metadata / expansion
    MetadataReady {
        id: Uuid,
        info: MediaInfo,
    },
    PlaylistExpanded {
        playlist_id: String,
        title: String,
        job_ids: Vec<Uuid>,
        count: usize,
    },
    ExpansionFailed {
        url: String,
        error_code: ErrorCode,
        user_message: String,
    },

    // Execution
    JobProgress {
        id: Uuid,
        progress: Progress,
    },
    JobCompleted {
        id: Uuid,
        file_path: String,
    },
    JobFailed {
        id: Uuid,
        error_code: ErrorCode,
        user_message: String,
        actions: Vec<Action>,
    },

    // Persistence trouble that did not stop the job
    StoreError {
        message: String,
    },
}

impl AppEvent {
    /// Job the event belongs to, if any.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            AppEvent::JobQueued { id, .. }
            | AppEvent::JobStarted { id }
            | AppEvent::JobRetried { id }
            | AppEvent::JobRemoved { id }
            | AppEvent::MetadataReady { id, .. }
            | AppEvent::JobProgress { id, .. }
            | AppEvent::JobCompleted { id, .. }
            | AppEvent::JobFailed { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Terminal events end a job's current attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AppEvent::JobCompleted { .. } | AppEvent::JobFailed { .. })
    }
}

/// Send an event, logging when the UI side has gone away.
pub fn emit(tx: &EventSender, event: AppEvent) {
    if tx.send(event).is_err() {
        log::debug!("event receiver dropped; event discarded");
    }
}

pub mod helpers {
    use super::*;

    pub fn fail(id: Uuid, error_code: ErrorCode, user_message: impl Into<String>) -> AppEvent {
        let actions = error_code.actions();
        AppEvent::JobFailed {
            id,
            error_code,
            user_message: user_message.into(),
            actions,
        }
    }

    pub fn store_error(err: &crate::error::AppError) -> AppEvent {
        let message = if err.is_transient() {
            format!("Database busy, try again: {err}")
        } else {
            err.to_string()
        };
        AppEvent::StoreError { message }
    }
}

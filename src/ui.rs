//! Terminal UI
//!
//! Parses command lines, folds [`AppEvent`]s into a small view state and
//! renders tables. Only the UI loop calls into this module.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use uuid::Uuid;

use crate::coordinator::Submission;
use crate::error::{AppError, Result};
use crate::events::AppEvent;
use crate::models::{HistoryEntry, MediaFormat, Playlist, PlaylistItem, SourceKind};
use crate::queue::{short_id, JobState, QueueSnapshot};
use crate::settings::UserSettings;
use crate::tools::{ToolInfo, ToolStatus, ToolchainStatus};
use crate::url_utils::{contains_multiple_urls, extract_urls, is_youtube_url};
use crate::App;

pub const HELP: &str = "\
Commands:
  download <url> [video|audio] [dest]   queue a download (kind detected from the URL)
  playlist <url> [video|audio] [dest]   force playlist expansion
  channel <url> [video|audio] [dest]    force channel expansion
  queue                                 show the queue
  pause | resume                        stop or restart admitting jobs
  retry <job> | cancel <job> | remove <job>
  clear                                 remove completed jobs
  history [n]                           show the last n downloads
  delete <history id>                   delete one history entry
  clear-history                         delete all history
  open <history id>                     open the folder of a downloaded file
  playlist-items <playlist id>          list a playlist's videos
  settings                              show settings
  set <key> <value>                     change a setting
  reset-settings                        restore default settings
  tools                                 show yt-dlp / ffmpeg status
  help                                  this text
  quit                                  exit
Pasting one or more URLs queues them as downloads.";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Download {
        url: String,
        kind: Option<SourceKind>,
        format: Option<MediaFormat>,
        destination: Option<PathBuf>,
    },
    /// Several URLs pasted at once.
    Paste(Vec<String>),
    Queue,
    Pause,
    Resume,
    Retry(String),
    Cancel(String),
    Remove(String),
    Clear,
    History(Option<u32>),
    Delete(i64),
    ClearHistory,
    Open(i64),
    PlaylistItems(String),
    Settings,
    Set { key: String, value: String },
    ResetSettings,
    Tools,
    Help,
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines are rejected; the loop skips them first.
    pub fn parse(line: &str) -> Result<Command> {
        let line = line.trim();
        let mut words = line.split_whitespace();
        let head = words
            .next()
            .ok_or_else(|| AppError::Validation("empty command".into()))?;
        let rest: Vec<&str> = words.collect();

        let cmd = match head.to_ascii_lowercase().as_str() {
            "download" | "dl" => parse_download(&rest, None)?,
            "playlist" => parse_download(&rest, Some(SourceKind::Playlist))?,
            "channel" => parse_download(&rest, Some(SourceKind::Channel))?,
            "queue" | "q" => Command::Queue,
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            "retry" => Command::Retry(one_arg(head, &rest)?.to_string()),
            "cancel" => Command::Cancel(one_arg(head, &rest)?.to_string()),
            "remove" | "rm" => Command::Remove(one_arg(head, &rest)?.to_string()),
            "clear" => Command::Clear,
            "history" => match rest.first() {
                None => Command::History(None),
                Some(n) => Command::History(Some(parse_number(head, n)?)),
            },
            "delete" => Command::Delete(parse_number(head, one_arg(head, &rest)?)?),
            "clear-history" => Command::ClearHistory,
            "open" => Command::Open(parse_number(head, one_arg(head, &rest)?)?),
            "playlist-items" => Command::PlaylistItems(one_arg(head, &rest)?.to_string()),
            "settings" => Command::Settings,
            "reset-settings" => Command::ResetSettings,
            "set" => match rest.split_first() {
                Some((key, value)) => Command::Set {
                    key: key.to_string(),
                    value: value.join(" "),
                },
                None => return Err(usage("set <key> <value>")),
            },
            "tools" => Command::Tools,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            _ if contains_multiple_urls(line) => Command::Paste(extract_urls(line)),
            _ if rest.is_empty() && is_youtube_url(head) => Command::Download {
                url: head.to_string(),
                kind: None,
                format: None,
                destination: None,
            },
            other => {
                return Err(AppError::Validation(format!(
                    "unknown command '{other}'; type 'help' for a list"
                )))
            }
        };
        Ok(cmd)
    }
}

fn parse_download(args: &[&str], kind: Option<SourceKind>) -> Result<Command> {
    let (url, mut rest) = args
        .split_first()
        .ok_or_else(|| usage("download <url> [video|audio] [dest]"))?;
    let format = match rest.first().and_then(|f| MediaFormat::parse(f)) {
        Some(format) => {
            rest = &rest[1..];
            Some(format)
        }
        None => None,
    };
    // Destinations may contain spaces
    let destination = (!rest.is_empty()).then(|| PathBuf::from(rest.join(" ")));
    Ok(Command::Download {
        url: url.to_string(),
        kind,
        format,
        destination,
    })
}

fn one_arg<'a>(cmd: &str, args: &[&'a str]) -> Result<&'a str> {
    match args {
        [one] => Ok(*one),
        _ => Err(usage(&format!("{cmd} <id>"))),
    }
}

fn parse_number<T: std::str::FromStr>(cmd: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| AppError::Validation(format!("{cmd}: '{raw}' is not a number")))
}

fn usage(text: &str) -> AppError {
    AppError::Validation(format!("usage: {text}"))
}

/// What the UI knows about a job from events alone.
#[derive(Debug, Clone, Default)]
struct JobView {
    label: String,
    /// Last printed tenth of progress, so the log is not flooded.
    printed_step: Option<u8>,
}

/// Event-fed view state. Lives on the UI thread only.
#[derive(Debug, Default)]
pub struct UiState {
    jobs: HashMap<Uuid, JobView>,
}

impl UiState {
    pub fn label(&self, id: &Uuid) -> Option<&str> {
        self.jobs.get(id).map(|j| j.label.as_str())
    }

    /// Fold an event into the view. Returns a line to print, if the event is worth one.
    pub fn apply(&mut self, event: &AppEvent) -> Option<String> {
        match event {
            AppEvent::JobQueued { id, url } => {
                self.jobs.insert(
                    *id,
                    JobView {
                        label: url.clone(),
                        printed_step: None,
                    },
                );
                Some(format!("[{}] queued {}", short_id(id), url))
            }
            AppEvent::JobStarted { id } => {
                let job = self.jobs.entry(*id).or_default();
                job.printed_step = None;
                Some(format!("[{}] started {}", short_id(id), job.label))
            }
            AppEvent::JobRetried { id } => Some(format!("[{}] queued for retry", short_id(id))),
            AppEvent::JobRemoved { id } => {
                self.jobs.remove(id);
                Some(format!("[{}] removed", short_id(id)))
            }
            AppEvent::QueuePaused => Some("Queue paused; running downloads will finish.".to_string()),
            AppEvent::QueueResumed => Some("Queue resumed.".to_string()),
            AppEvent::MetadataReady { id, info } => {
                self.jobs.entry(*id).or_default().label = info.title.clone();
                let mut line = format!("[{}] {}", short_id(id), info.title);
                let mut details = Vec::new();
                if let Some(secs) = info.duration_seconds {
                    details.push(format_duration(secs.max(0) as u64));
                }
                if let Some(channel) = &info.channel {
                    details.push(channel.clone());
                }
                if !details.is_empty() {
                    let _ = write!(line, " ({})", details.join(", "));
                }
                Some(line)
            }
            AppEvent::PlaylistExpanded {
                title,
                job_ids,
                count,
                ..
            } => {
                for (n, id) in job_ids.iter().enumerate() {
                    self.jobs.entry(*id).or_default().label = format!("{title} #{}", n + 1);
                }
                Some(format!("Playlist '{title}': {count} video(s) queued"))
            }
            AppEvent::ExpansionFailed {
                url, user_message, ..
            } => Some(format!("Could not expand {url}: {user_message}")),
            AppEvent::JobProgress { id, progress } => {
                let percent = progress.percent?;
                let step = (percent.clamp(0.0, 100.0) / 10.0).floor() as u8;
                let job = self.jobs.entry(*id).or_default();
                if job.printed_step.is_some_and(|s| s >= step) {
                    return None;
                }
                job.printed_step = Some(step);

                let mut line = format!("[{}] {:5.1}%", short_id(id), percent);
                if let Some(speed) = progress.speed_bps {
                    let _ = write!(line, "  {}/s", format_bytes(speed));
                }
                if let Some(eta) = progress.eta_seconds {
                    let _ = write!(line, "  eta {}", format_duration(eta));
                }
                Some(line)
            }
            AppEvent::JobCompleted { id, file_path } => {
                Some(format!("[{}] done: {}", short_id(id), file_path))
            }
            AppEvent::JobFailed {
                id,
                user_message,
                actions,
                ..
            } => {
                let mut line = format!("[{}] failed: {}", short_id(id), user_message);
                for action in actions {
                    let _ = write!(line, "\n    hint: {}", action.label);
                }
                if actions.iter().any(|a| a.kind == crate::events::ActionKind::Retry) {
                    let _ = write!(line, " (retry {})", short_id(id));
                }
                Some(line)
            }
            AppEvent::StoreError { message } => Some(format!("Storage problem: {message}")),
        }
    }
}

/// Run one parsed command against the app. Returns the text to print.
pub fn execute(app: &mut App, command: Command) -> Result<String> {
    Ok(match command {
        Command::Download {
            url,
            kind,
            format,
            destination,
        } => describe_submission(app.download(&url, format, destination, kind)?),
        Command::Paste(urls) => {
            let mut out = String::new();
            for url in urls {
                match app.download(&url, None, None, None) {
                    Ok(submission) => out.push_str(&describe_submission(submission)),
                    Err(e) => {
                        let _ = write!(out, "{url}: {e}");
                    }
                }
                out.push('\n');
            }
            out.trim_end().to_string()
        }
        Command::Queue => render_queue(&app.queue()),
        Command::Pause => {
            if app.pause() {
                String::new()
            } else {
                "Queue is already paused.".into()
            }
        }
        Command::Resume => {
            if app.resume() {
                String::new()
            } else {
                "Queue is not paused.".into()
            }
        }
        Command::Retry(job) => {
            app.retry(&job)?;
            String::new()
        }
        Command::Cancel(job) => {
            app.cancel(&job)?;
            format!("Cancel requested for {job}")
        }
        Command::Remove(job) => {
            app.remove(&job)?;
            String::new()
        }
        Command::Clear => format!("Removed {} completed job(s)", app.clear_completed()),
        Command::History(limit) => render_history(&app.history(limit)?),
        Command::Delete(id) => {
            app.delete_history(id)?;
            format!("Deleted history entry #{id}")
        }
        Command::ClearHistory => format!("Deleted {} history entries", app.clear_history()?),
        Command::Open(id) => format!("Opened {}", app.open_folder(id)?.display()),
        Command::PlaylistItems(id) => {
            let (playlist, items) = app.playlist_items(&id)?;
            render_playlist(&playlist, &items)
        }
        Command::Settings => render_settings(app.settings(), app.last_destination()?.as_deref()),
        Command::Set { key, value } => {
            app.set_setting(&key, &value)?;
            format!("{key} updated")
        }
        Command::ResetSettings => {
            app.reset_settings()?;
            render_settings(app.settings(), app.last_destination()?.as_deref())
        }
        Command::Tools => render_tools(&app.tools()),
        Command::Help => HELP.to_string(),
        Command::Quit => String::new(),
    })
}

fn describe_submission(submission: Submission) -> String {
    match submission {
        // JobQueued already announces it
        Submission::Queued(_) => String::new(),
        Submission::Expanding { url } => format!("Reading {url} ..."),
    }
}

pub fn render_queue(snapshot: &QueueSnapshot) -> String {
    if snapshot.jobs.is_empty() {
        return "Queue is empty.".to_string();
    }
    let mut out = format!(
        "Queue{} (max {} at once)\n",
        if snapshot.paused { " [paused]" } else { "" },
        snapshot.max_concurrent
    );
    for job in &snapshot.jobs {
        let progress = match (job.state, job.progress.percent) {
            (JobState::Downloading, Some(p)) => format!("{p:5.1}%"),
            _ => "      ".to_string(),
        };
        let _ = writeln!(
            out,
            "  {}  {:<11} {} {} [{}]",
            job.short_id(),
            job.state.as_str(),
            progress,
            job.label(),
            job.spec.format
        );
        if let Some(error) = &job.error {
            let _ = writeln!(out, "      {error}");
        }
    }
    out.trim_end().to_string()
}

pub fn render_history(entries: &[HistoryEntry]) -> String {
    if entries.is_empty() {
        return "No downloads yet.".to_string();
    }
    let mut out = String::new();
    for entry in entries {
        let when = entry
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let title = entry
            .video_title
            .as_deref()
            .or(entry.video_url.as_deref())
            .unwrap_or("(unknown video)");
        let _ = write!(
            out,
            "#{:<5} {:<11} {}  {}",
            entry.id,
            entry.status.as_str(),
            when,
            title
        );
        if let Some(playlist) = &entry.playlist_title {
            let _ = write!(out, "  [{playlist}]");
        }
        if let Some(size) = entry.file_size {
            let _ = write!(out, "  {}", format_bytes(size.max(0) as u64));
        }
        if let Some(error) = &entry.error_message {
            let _ = write!(out, "\n       {error}");
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

pub fn render_playlist(playlist: &Playlist, items: &[PlaylistItem]) -> String {
    let mut out = format!("{} ({} videos)\n", playlist.title, items.len());
    for item in items {
        let duration = item
            .video
            .duration
            .map(|d| format_duration(d.max(0) as u64))
            .unwrap_or_default();
        let mark = if item.video.file_path.is_some() { "*" } else { " " };
        let _ = writeln!(
            out,
            "{mark}{:>4}. {}  {}  {}",
            item.position + 1,
            item.video.id,
            item.video.title,
            duration
        );
    }
    out.trim_end().to_string()
}

pub fn render_settings(settings: &UserSettings, last_destination: Option<&std::path::Path>) -> String {
    let ffmpeg = settings
        .ffmpeg_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "auto".to_string());
    let mut out = format!(
        "download_folder  {}\ndefault_format   {}\nmax_concurrent   {}\nffmpeg_path      {}\nhistory_limit    {}",
        settings.download_folder.display(),
        settings.default_format,
        settings.max_concurrent,
        ffmpeg,
        settings.history_limit
    );
    if let Some(dest) = last_destination {
        let _ = write!(out, "\n(last destination: {})", dest.display());
    }
    out
}

pub fn render_tools(status: &ToolchainStatus) -> String {
    let line = |info: &ToolInfo| {
        let state = match info.status {
            ToolStatus::Ok => "ok",
            ToolStatus::Missing => "missing",
            ToolStatus::Broken => "broken",
        };
        format!(
            "{:<7} {:<8} {:<12} {}",
            info.tool.as_str(),
            state,
            info.version.as_deref().unwrap_or("-"),
            info.path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        )
    };
    let mut out = format!("{}\n{}", line(&status.yt_dlp), line(&status.ffmpeg));
    if !status.can_download() {
        out.push_str("\nyt-dlp is required. Install it or set YT_DLP_PATH.");
    }
    out
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// `m:ss`, or `h:mm:ss` from an hour up.
pub fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{helpers, ErrorCode, MediaInfo};
    use crate::models::Progress;

    #[test]
    fn parses_download_variants() {
        assert_eq!(
            Command::parse("download https://youtu.be/dQw4w9WgXcQ audio /tmp/My Music").unwrap(),
            Command::Download {
                url: "https://youtu.be/dQw4w9WgXcQ".into(),
                kind: None,
                format: Some(MediaFormat::Audio),
                destination: Some(PathBuf::from("/tmp/My Music")),
            }
        );
        assert_eq!(
            Command::parse("channel https://www.youtube.com/@someone").unwrap(),
            Command::Download {
                url: "https://www.youtube.com/@someone".into(),
                kind: Some(SourceKind::Channel),
                format: None,
                destination: None,
            }
        );
        // A destination that is not a format keyword
        match Command::parse("download https://youtu.be/dQw4w9WgXcQ ~/videos").unwrap() {
            Command::Download { format, destination, .. } => {
                assert_eq!(format, None);
                assert_eq!(destination, Some(PathBuf::from("~/videos")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Command::parse("download").is_err());
    }

    #[test]
    fn parses_bare_and_pasted_urls() {
        assert!(matches!(
            Command::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap(),
            Command::Download { kind: None, .. }
        ));
        match Command::parse("https://youtu.be/dQw4w9WgXcQ, https://youtu.be/9bZkp7q19f0").unwrap() {
            Command::Paste(urls) => assert_eq!(urls.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_control_commands() {
        assert_eq!(Command::parse("  queue ").unwrap(), Command::Queue);
        assert_eq!(Command::parse("retry 1a2b").unwrap(), Command::Retry("1a2b".into()));
        assert_eq!(Command::parse("history 10").unwrap(), Command::History(Some(10)));
        assert_eq!(Command::parse("history").unwrap(), Command::History(None));
        assert_eq!(Command::parse("delete 7").unwrap(), Command::Delete(7));
        assert_eq!(Command::parse("clear-history").unwrap(), Command::ClearHistory);
        assert_eq!(Command::parse("reset-settings").unwrap(), Command::ResetSettings);
        assert_eq!(
            Command::parse("set download_folder /media/My Videos").unwrap(),
            Command::Set {
                key: "download_folder".into(),
                value: "/media/My Videos".into()
            }
        );
        assert_eq!(Command::parse("QUIT").unwrap(), Command::Quit);

        assert!(Command::parse("").is_err());
        assert!(Command::parse("open seven").is_err());
        assert!(Command::parse("cancel").is_err());
        assert!(Command::parse("frobnicate").is_err());
    }

    #[test]
    fn applies_job_lifecycle_events() {
        let mut ui = UiState::default();
        let id = Uuid::new_v4();

        let line = ui
            .apply(&AppEvent::JobQueued {
                id,
                url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
            })
            .unwrap();
        assert!(line.contains(&short_id(&id)));

        ui.apply(&AppEvent::MetadataReady {
            id,
            info: MediaInfo {
                video_id: "dQw4w9WgXcQ".into(),
                title: "Never Gonna".into(),
                channel: Some("Rick".into()),
                duration_seconds: Some(213),
            },
        });
        assert_eq!(ui.label(&id), Some("Never Gonna"));

        let progress = |p: f64| AppEvent::JobProgress {
            id,
            progress: Progress {
                percent: Some(p),
                speed_bps: Some(2 * 1024 * 1024),
                ..Default::default()
            },
        };
        assert!(ui.apply(&progress(3.0)).unwrap().contains("2.0 MiB/s"));
        assert!(ui.apply(&progress(7.5)).is_none());
        assert!(ui.apply(&progress(12.0)).is_some());
        assert!(ui.apply(&progress(100.0)).is_some());

        let failed = ui
            .apply(&helpers::fail(id, ErrorCode::Network, "Network error"))
            .unwrap();
        assert!(failed.contains("failed: Network error"));
        assert!(failed.contains("retry"));

        assert!(ui.apply(&AppEvent::QueuePaused).unwrap().contains("will finish"));
        ui.apply(&AppEvent::JobRemoved { id });
        assert_eq!(ui.label(&id), None);
    }

    #[test]
    fn formats_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_duration(65), "1:05");
        assert_eq!(format_duration(3725), "1:02:05");
    }
}

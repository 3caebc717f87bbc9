//! Download engine adapter.
//!
//! Everything that touches yt-dlp lives here: argument building, metadata and
//! playlist enumeration, progress parsing and error classification. Workers
//! call it from plain OS threads, so the process handling is blocking.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// `CREATE_NO_WINDOW` process creation flag.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use regex::Regex;
use serde_json::Value;

use crate::error::EngineError;
use crate::events::ErrorCode;
use crate::models::{MediaFormat, Progress, Video};

/// Marker printed by `--print after_move:` so the final file path can be picked out of stdout.
const FILE_MARKER: &str = "[tubeshelf-file] ";

/// Start of a `--progress-template` line. yt-dlp's display strings may contain
/// spaces ("Unknown B/s"), so the fields are separated by `|`.
const PROGRESS_PREFIX: &str = "[tubeshelf]";

const PROGRESS_TEMPLATE: &str = "download:[tubeshelf]%(progress._percent_str)s|%(progress._speed_str)s|%(progress._eta_str)s|%(progress._total_bytes_str)s|%(progress._total_bytes_estimate_str)s|%(progress.downloaded_bytes)s";

/// Bound log capture to avoid unbounded memory use.
const MAX_STDERR_LINES: usize = 2_000;

/// Cooperative cancellation shared between the coordinator and a worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Metadata of a single video as reported by `--dump-json`.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub duration: Option<i64>,
    pub channel: Option<String>,
    pub upload_date: Option<String>,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
}

impl VideoInfo {
    pub fn into_video(self) -> Video {
        Video {
            id: self.id,
            title: self.title,
            duration: self.duration,
            channel: self.channel,
            upload_date: self.upload_date,
            url: self.url,
            file_path: None,
            thumbnail_url: self.thumbnail_url,
            description: self.description,
            created_at: None,
            updated_at: None,
        }
    }
}

/// A single playlist entry returned by enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub video_id: String,
    pub url: String,
    pub title: Option<String>,
    pub duration: Option<i64>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaylistInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub entries: Vec<PlaylistEntry>,
}

/// One download invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub url: String,
    pub format: MediaFormat,
    pub output_dir: PathBuf,
}

/// The seam between the coordinator and the external downloader.
pub trait DownloadEngine: Send + Sync {
    fn fetch_video(&self, url: &str) -> Result<VideoInfo, EngineError>;

    /// Enumerate a playlist or channel without resolving each entry.
    fn fetch_playlist(&self, url: &str) -> Result<PlaylistInfo, EngineError>;

    /// Download to `request.output_dir`, reporting progress from the calling thread.
    /// Returns the path of the produced file.
    fn download(
        &self,
        request: &EngineRequest,
        cancel: &CancelFlag,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<PathBuf, EngineError>;
}

/// Where to find yt-dlp and ffmpeg.
#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    pub yt_dlp_path: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    /// Extra arguments injected before every call.
    pub global_args: Vec<String>,
}

impl YtDlpConfig {
    pub fn new(yt_dlp_path: PathBuf) -> Self {
        Self {
            yt_dlp_path,
            ffmpeg_path: None,
            global_args: vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    cfg: YtDlpConfig,
}

impl YtDlpEngine {
    pub fn new(cfg: YtDlpConfig) -> Self {
        Self { cfg }
    }

    fn command(&self, args: &[String]) -> Result<Command, EngineError> {
        // A bare name is resolved through PATH at spawn time.
        if self.cfg.yt_dlp_path.components().count() > 1 && !self.cfg.yt_dlp_path.exists() {
            return Err(EngineError::ToolMissing {
                tool: "yt-dlp".to_string(),
                path: self.cfg.yt_dlp_path.clone(),
            });
        }

        let mut cmd = Command::new(&self.cfg.yt_dlp_path);
        cmd.args(&self.cfg.global_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        Ok(cmd)
    }

    fn spawn(&self, args: &[String]) -> Result<Child, EngineError> {
        self.command(args)?.spawn().map_err(|e| self.spawn_error(e))
    }

    fn spawn_error(&self, e: std::io::Error) -> EngineError {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::ToolMissing {
                tool: "yt-dlp".to_string(),
                path: self.cfg.yt_dlp_path.clone(),
            }
        } else {
            EngineError::Spawn {
                tool: "yt-dlp".to_string(),
                source: e,
            }
        }
    }

    /// Run yt-dlp to completion and return the stdout lines that look like JSON objects.
    fn exec_json_lines(&self, args: &[String]) -> Result<Vec<String>, EngineError> {
        log::debug!("yt-dlp {:?}", args);
        let output = self
            .command(args)?
            .output()
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let (code, message) = classify_error(&stderr);
            log::warn!(
                "yt-dlp exited with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            );
            return Err(EngineError::Failed { code, message });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter(|l| looks_like_json_object(l))
            .map(str::to_string)
            .collect())
    }
}

impl DownloadEngine for YtDlpEngine {
    fn fetch_video(&self, url: &str) -> Result<VideoInfo, EngineError> {
        let args = vec![
            "--dump-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            url.to_string(),
        ];
        let first = self
            .exec_json_lines(&args)?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::InvalidJson("yt-dlp returned no JSON output".into()))?;
        parse_video_info(&first, url)
    }

    fn fetch_playlist(&self, url: &str) -> Result<PlaylistInfo, EngineError> {
        let args = vec![
            "--flat-playlist".to_string(),
            "--dump-json".to_string(),
            "--no-warnings".to_string(),
            url.to_string(),
        ];
        let lines = self.exec_json_lines(&args)?;

        let mut info = PlaylistInfo::default();
        for line in lines {
            match parse_playlist_line(&line) {
                Ok((entry, playlist_id, playlist_title)) => {
                    if info.id.is_none() {
                        info.id = playlist_id;
                    }
                    if info.title.is_none() {
                        info.title = playlist_title;
                    }
                    if let Some(entry) = entry {
                        info.entries.push(entry);
                    }
                }
                // A single bad entry should not kill the playlist.
                Err(e) => log::warn!("Skipping playlist entry: {}", e),
            }
        }
        log::info!(
            "Enumerated {} entries from {}",
            info.entries.len(),
            url
        );
        Ok(info)
    }

    fn download(
        &self,
        request: &EngineRequest,
        cancel: &CancelFlag,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<PathBuf, EngineError> {
        let args = build_download_args(request, self.cfg.ffmpeg_path.as_deref());
        log::info!("Starting yt-dlp with args: {:?}", args);

        let mut child = self.spawn(&args)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::InvalidJson("failed to capture yt-dlp stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::InvalidJson("failed to capture yt-dlp stderr".into()))?;

        let stderr_reader = thread::spawn(move || {
            let mut lines = Vec::new();
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                log::debug!("yt-dlp stderr: {}", line);
                if lines.len() < MAX_STDERR_LINES {
                    lines.push(line);
                }
            }
            lines
        });

        let parser = OutputParser::new();
        let mut final_path: Option<String> = None;

        for line in BufReader::new(stdout).lines() {
            if cancel.is_canceled() {
                break;
            }
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    log::error!("Error reading yt-dlp stdout: {}", e);
                    break;
                }
            };
            log::trace!("yt-dlp stdout: {}", line);

            if let Some(progress) = parser.progress(&line) {
                on_progress(progress);
            }
            if let Some(path) = parser.output_path(&line) {
                final_path = Some(path);
            }
        }

        if cancel.is_canceled() {
            log::info!("Cancel requested, stopping yt-dlp");
            let _ = child.kill();
            let _ = child.wait();
            let _ = stderr_reader.join();
            return Err(EngineError::Canceled);
        }

        let status = child.wait()?;
        let stderr_lines = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            let (code, message) = classify_error(&stderr_lines.join("\n"));
            return Err(EngineError::Failed { code, message });
        }

        final_path.map(PathBuf::from).ok_or_else(|| EngineError::Failed {
            code: ErrorCode::Unknown,
            message: "yt-dlp finished but did not report the output file".to_string(),
        })
    }
}

/// Arguments for a download call, in order: output handling, format, tools, URL.
pub fn build_download_args(request: &EngineRequest, ffmpeg_path: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "--newline".to_string(),
        "--no-warnings".to_string(),
        "--no-playlist".to_string(),
        "--progress".to_string(),
        "--progress-template".to_string(),
        PROGRESS_TEMPLATE.to_string(),
        "--print".to_string(),
        format!("after_move:{FILE_MARKER}%(filepath)s"),
        "-o".to_string(),
        request
            .output_dir
            .join("%(title)s.%(ext)s")
            .to_string_lossy()
            .to_string(),
    ];

    match request.format {
        MediaFormat::Video => args.extend(
            [
                "-f",
                "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best",
                "--merge-output-format",
                "mp4",
            ]
            .map(String::from),
        ),
        MediaFormat::Audio => args.extend(
            [
                "-f",
                "bestaudio/best",
                "-x",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "192K",
            ]
            .map(String::from),
        ),
    }

    if let Some(ffmpeg) = ffmpeg_path {
        args.push("--ffmpeg-location".to_string());
        args.push(ffmpeg.to_string_lossy().to_string());
    }

    args.push(request.url.clone());
    args
}

/// Line matchers for yt-dlp stdout, compiled once per download.
struct OutputParser {
    standard: Option<Regex>,
    percent_only: Option<Regex>,
    destination: Option<Regex>,
    already: Option<Regex>,
}

impl OutputParser {
    fn new() -> Self {
        Self {
            // [download]  50.5% of ~100.00MiB at 1.50MiB/s ETA 00:30
            standard: Regex::new(
                r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?\s*(\S+)\s+at\s+(\S+)\s+ETA\s+(\S+)",
            )
            .ok(),
            percent_only: Regex::new(r"\[download\]\s+(\d+\.?\d*)%").ok(),
            destination: Regex::new(r"\[(?:download|ExtractAudio|Merger)\].*?Destination: (.+)")
                .ok(),
            already: Regex::new(r"\[download\] (.+) has already been downloaded").ok(),
        }
    }

    fn progress(&self, line: &str) -> Option<Progress> {
        // [tubeshelf] 50.5%|1.50MiB/s|00:30|100.00MiB|N/A|52953088
        if let Some(rest) = line.trim_start().strip_prefix(PROGRESS_PREFIX) {
            let fields: Vec<&str> = rest.split('|').map(str::trim).collect();
            let field = |i: usize| fields.get(i).copied().unwrap_or("");
            return Some(Progress {
                percent: parse_percent(field(0)),
                speed_bps: parse_speed(field(1)),
                eta_seconds: parse_eta(field(2)),
                bytes_total: parse_bytes(field(3)).or_else(|| parse_bytes(field(4))),
                bytes_downloaded: field(5).parse::<u64>().ok(),
            });
        }

        if let Some(caps) = self.standard.as_ref().and_then(|re| re.captures(line)) {
            return Some(Progress {
                percent: caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()),
                bytes_total: caps.get(2).and_then(|m| parse_bytes(m.as_str())),
                speed_bps: caps.get(3).and_then(|m| parse_speed(m.as_str())),
                eta_seconds: caps.get(4).and_then(|m| parse_eta(m.as_str())),
                bytes_downloaded: None,
            });
        }

        let caps = self.percent_only.as_ref()?.captures(line)?;
        let percent = caps.get(1)?.as_str().parse::<f64>().ok()?;
        Some(Progress {
            percent: Some(percent),
            ..Progress::default()
        })
    }

    fn output_path(&self, line: &str) -> Option<String> {
        if let Some(path) = line.strip_prefix(FILE_MARKER) {
            return Some(path.trim().to_string());
        }
        for re in [&self.destination, &self.already].into_iter().flatten() {
            if let Some(caps) = re.captures(line) {
                return caps.get(1).map(|m| m.as_str().trim().trim_matches('"').to_string());
            }
        }
        None
    }
}

fn looks_like_json_object(s: &str) -> bool {
    let t = s.trim();
    t.starts_with('{') && t.ends_with('}')
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(|x| x.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn duration_field(v: &Value) -> Option<i64> {
    v.get("duration")
        .and_then(|x| x.as_i64())
        .or_else(|| v.get("duration").and_then(|x| x.as_f64()).map(|f| f as i64))
}

fn parse_video_info(json_line: &str, fallback_url: &str) -> Result<VideoInfo, EngineError> {
    let v: Value = serde_json::from_str(json_line)
        .map_err(|e| EngineError::InvalidJson(format!("invalid yt-dlp JSON: {e}")))?;

    let id = str_field(&v, "id")
        .ok_or_else(|| EngineError::InvalidJson("video JSON has no id".into()))?;

    Ok(VideoInfo {
        title: str_field(&v, "title").unwrap_or_else(|| id.clone()),
        duration: duration_field(&v),
        channel: str_field(&v, "channel").or_else(|| str_field(&v, "uploader")),
        upload_date: str_field(&v, "upload_date"),
        url: str_field(&v, "webpage_url").unwrap_or_else(|| fallback_url.to_string()),
        thumbnail_url: str_field(&v, "thumbnail"),
        description: str_field(&v, "description"),
        id,
    })
}

/// Parse one `--flat-playlist --dump-json` line.
///
/// Returns the entry (None for nested playlists such as channel tabs) plus the
/// playlist id and title each entry carries.
fn parse_playlist_line(
    json_line: &str,
) -> Result<(Option<PlaylistEntry>, Option<String>, Option<String>), EngineError> {
    let v: Value = serde_json::from_str(json_line)
        .map_err(|e| EngineError::InvalidJson(format!("invalid yt-dlp playlist JSON: {e}")))?;

    let playlist_id = str_field(&v, "playlist_id");
    let playlist_title = str_field(&v, "playlist_title").or_else(|| str_field(&v, "playlist"));

    if str_field(&v, "_type").as_deref() == Some("playlist") {
        return Ok((None, playlist_id, playlist_title));
    }

    let video_id = str_field(&v, "id")
        .ok_or_else(|| EngineError::InvalidJson("playlist entry missing id".into()))?;

    // Prefer `webpage_url`, then an absolute `url`, then build one from the id.
    let url = str_field(&v, "webpage_url")
        .or_else(|| str_field(&v, "url").filter(|u| u.starts_with("http")))
        .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={video_id}"));

    let entry = PlaylistEntry {
        url,
        title: str_field(&v, "title"),
        duration: duration_field(&v),
        channel: str_field(&v, "channel").or_else(|| str_field(&v, "uploader")),
        video_id,
    };
    Ok((Some(entry), playlist_id, playlist_title))
}

fn parse_percent(s: &str) -> Option<f64> {
    s.trim().trim_end_matches('%').trim_end().parse().ok()
}

fn parse_speed(s: &str) -> Option<u64> {
    parse_bytes(s.trim().strip_suffix("/s")?)
}

/// `SS`, `MM:SS` or `HH:MM:SS` to seconds.
fn parse_eta(s: &str) -> Option<u64> {
    let fields: Vec<&str> = s.trim().split(':').collect();
    if fields.len() > 3 {
        return None;
    }
    fields
        .iter()
        .try_fold(0u64, |total, field| Some(total * 60 + field.parse::<u64>().ok()?))
}

/// Sizes as yt-dlp prints them (`512B`, `~1.50GiB`). Decimal units are read as binary.
fn parse_bytes(s: &str) -> Option<u64> {
    let s = s.trim().trim_start_matches('~').trim_start();
    let (number, unit) = s.split_at(s.find(|c: char| !(c.is_ascii_digit() || c == '.'))?);
    let power = match unit.trim() {
        "B" => 0,
        "KB" | "KiB" => 1,
        "MB" | "MiB" => 2,
        "GB" | "GiB" => 3,
        "TB" | "TiB" => 4,
        _ => return None,
    };
    let value: f64 = number.parse().ok()?;
    Some((value * 1024f64.powi(power)) as u64)
}

/// Classify yt-dlp stderr into a stable code and a message for the user.
pub fn classify_error(stderr: &str) -> (ErrorCode, String) {
    let lower = stderr.to_lowercase();

    if lower.contains("403") || lower.contains("forbidden") {
        return (
            ErrorCode::Forbidden,
            "YouTube blocked the download (403 Forbidden). Update yt-dlp and try again later."
                .to_string(),
        );
    }

    if lower.contains("private video") {
        return (
            ErrorCode::Private,
            "This video is private and cannot be downloaded.".to_string(),
        );
    }

    if lower.contains("confirm your age") || lower.contains("age-restricted") {
        return (
            ErrorCode::AgeRestricted,
            "This video is age-restricted and cannot be downloaded.".to_string(),
        );
    }

    if lower.contains("available in your country")
        || lower.contains("geo restrict")
        || lower.contains("geo-restrict")
    {
        return (
            ErrorCode::GeoRestricted,
            "This content is not available in your region.".to_string(),
        );
    }

    if lower.contains("unavailable") || lower.contains("has been removed") {
        return (
            ErrorCode::Unavailable,
            "Video unavailable or removed.".to_string(),
        );
    }

    if lower.contains("ffmpeg") || lower.contains("ffprobe") {
        return (
            ErrorCode::FfmpegMissing,
            "ffmpeg is missing or misconfigured. Install ffmpeg or set its path in settings."
                .to_string(),
        );
    }

    if lower.contains("sign in") || lower.contains("login") || lower.contains("cookies") {
        return (
            ErrorCode::LoginRequired,
            "This content requires sign-in.".to_string(),
        );
    }

    if lower.contains("network")
        || lower.contains("connection")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("unable to download webpage")
    {
        return (
            ErrorCode::Network,
            "Network error occurred. Check your connection and retry.".to_string(),
        );
    }

    // Default: unknown error, reported from the ERROR lines when there are any.
    let errors: Vec<&str> = stderr
        .lines()
        .filter(|l| l.starts_with("ERROR"))
        .collect();
    let detail = if errors.is_empty() {
        stderr.trim().to_string()
    } else {
        errors.join(" ")
    };

    let message = if detail.is_empty() {
        "Download failed with unknown error.".to_string()
    } else if detail.chars().count() > 200 {
        format!("Download failed: {}…", detail.chars().take(200).collect::<String>())
    } else {
        format!("Download failed: {}", detail)
    };

    (ErrorCode::Unknown, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_fields_parse_and_reject_placeholders() {
        assert_eq!(parse_percent("  7.3%"), Some(7.3));
        assert_eq!(parse_percent("N/A"), None);

        assert_eq!(parse_speed("750.00KiB/s"), Some(768_000));
        assert_eq!(parse_speed("Unknown B/s"), None);

        assert_eq!(parse_eta("42"), Some(42));
        assert_eq!(parse_eta("12:00"), Some(720));
        assert_eq!(parse_eta("2:00:01"), Some(7201));
        assert_eq!(parse_eta("1:2:3:4"), None);
        assert_eq!(parse_eta("N/A"), None);

        assert_eq!(parse_bytes("~ 1.50GiB"), Some(1_610_612_736));
        assert_eq!(parse_bytes("4096B"), Some(4096));
        assert_eq!(parse_bytes("3furlongs"), None);
        assert_eq!(parse_bytes("NA"), None);
    }

    #[test]
    fn progress_from_template_and_fallbacks() {
        let parser = OutputParser::new();

        let p = parser
            .progress("[tubeshelf] 50.0%|1.00MiB/s|00:10|10.00MiB|N/A|5242880")
            .unwrap();
        assert_eq!(p.percent, Some(50.0));
        assert_eq!(p.speed_bps, Some(1024 * 1024));
        assert_eq!(p.eta_seconds, Some(10));
        assert_eq!(p.bytes_total, Some(10 * 1024 * 1024));
        assert_eq!(p.bytes_downloaded, Some(5242880));

        // Start of a download: speed and total are not known yet.
        let p = parser
            .progress("[tubeshelf]   3.2%|Unknown B/s|00:42|N/A|~  12.00MiB|402653")
            .unwrap();
        assert_eq!(p.percent, Some(3.2));
        assert_eq!(p.speed_bps, None);
        assert_eq!(p.eta_seconds, Some(42));
        assert_eq!(p.bytes_total, Some(12 * 1024 * 1024));
        assert_eq!(p.bytes_downloaded, Some(402653));

        let p = parser
            .progress("[tubeshelf]  60.0%|2.00MiB/s|Unknown|20.00MiB|N/A|NA")
            .unwrap();
        assert_eq!(p.eta_seconds, None);
        assert_eq!(p.bytes_total, Some(20 * 1024 * 1024));
        assert_eq!(p.bytes_downloaded, None);

        let p = parser
            .progress("[download]  12.5% of ~ 80.00MiB at  2.00MiB/s ETA 00:35")
            .unwrap();
        assert_eq!(p.percent, Some(12.5));
        assert_eq!(p.bytes_total, Some(80 * 1024 * 1024));
        assert_eq!(p.eta_seconds, Some(35));

        let p = parser.progress("[download] 100% of 3.00MiB").unwrap();
        assert_eq!(p.percent, Some(100.0));

        assert!(parser.progress("[youtube] abc: Downloading webpage").is_none());
    }

    #[test]
    fn output_path_detection() {
        let parser = OutputParser::new();
        assert_eq!(
            parser.output_path("[tubeshelf-file] /dl/Song Title.mp3"),
            Some("/dl/Song Title.mp3".to_string())
        );
        assert_eq!(
            parser.output_path("[ExtractAudio] Destination: /dl/Song.mp3"),
            Some("/dl/Song.mp3".to_string())
        );
        assert_eq!(
            parser.output_path("[Merger] Merging formats into \"/dl/Clip.mp4\""),
            None
        );
        assert_eq!(
            parser.output_path("[download] /dl/Clip.mp4 has already been downloaded"),
            Some("/dl/Clip.mp4".to_string())
        );
    }

    #[test]
    fn audio_args_extract_mp3() {
        let request = EngineRequest {
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
            format: MediaFormat::Audio,
            output_dir: PathBuf::from("/dl"),
        };
        let args = build_download_args(&request, Some(Path::new("/opt/ffmpeg")));
        assert!(args.windows(2).any(|w| w[0] == "--audio-format" && w[1] == "mp3"));
        assert!(args.contains(&"-x".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--ffmpeg-location" && w[1] == "/opt/ffmpeg"));
        assert_eq!(args.last().unwrap(), &request.url);

        let video = EngineRequest {
            format: MediaFormat::Video,
            ..request
        };
        let args = build_download_args(&video, None);
        assert!(args.windows(2).any(|w| w[0] == "--merge-output-format" && w[1] == "mp4"));
        assert!(!args.contains(&"--ffmpeg-location".to_string()));
    }

    #[test]
    fn video_info_from_json() {
        let json = r#"{"id":"dQw4w9WgXcQ","title":"Clip","duration":212.0,"uploader":"Artist",
            "upload_date":"20091025","webpage_url":"https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "thumbnail":"https://i.ytimg.com/x.jpg","description":""}"#
            .replace('\n', " ");
        let info = parse_video_info(&json, "fallback").unwrap();
        assert_eq!(info.id, "dQw4w9WgXcQ");
        assert_eq!(info.duration, Some(212));
        assert_eq!(info.channel.as_deref(), Some("Artist"));
        assert_eq!(info.description, None);

        assert!(matches!(
            parse_video_info("{\"title\":\"x\"}", "u"),
            Err(EngineError::InvalidJson(_))
        ));
    }

    #[test]
    fn playlist_lines() {
        let (entry, pid, title) = parse_playlist_line(
            r#"{"_type":"url","id":"abcdefghijk","title":"One","url":"https://www.youtube.com/watch?v=abcdefghijk","playlist_id":"PL1","playlist_title":"Mix"}"#,
        )
        .unwrap();
        let entry = entry.unwrap();
        assert_eq!(entry.video_id, "abcdefghijk");
        assert_eq!(pid.as_deref(), Some("PL1"));
        assert_eq!(title.as_deref(), Some("Mix"));

        let (entry, _, _) =
            parse_playlist_line(r#"{"id":"zyxwvutsrqp","url":"zyxwvutsrqp"}"#).unwrap();
        assert_eq!(
            entry.unwrap().url,
            "https://www.youtube.com/watch?v=zyxwvutsrqp"
        );

        let (entry, _, _) =
            parse_playlist_line(r#"{"_type":"playlist","id":"UCx - Videos"}"#).unwrap();
        assert!(entry.is_none());
    }

    #[test]
    fn test_classify_error() {
        let cases = [
            ("ERROR: unable to download video data: HTTP Error 403: Forbidden", ErrorCode::Forbidden),
            ("ERROR: [youtube] x: Private video. Sign in if you've been granted access", ErrorCode::Private),
            ("ERROR: [youtube] x: Sign in to confirm your age", ErrorCode::AgeRestricted),
            ("ERROR: [youtube] x: Video unavailable", ErrorCode::Unavailable),
            ("ERROR: Postprocessing: ffprobe and ffmpeg not found", ErrorCode::FfmpegMissing),
            ("ERROR: The uploader has not made this video available in your country", ErrorCode::GeoRestricted),
            ("ERROR: Sign in to confirm you're not a bot", ErrorCode::LoginRequired),
            ("ERROR: Connection reset by peer", ErrorCode::Network),
        ];
        for (stderr, expected) in cases {
            assert_eq!(classify_error(stderr).0, expected, "{stderr}");
        }
    }

    #[test]
    fn unknown_errors_are_truncated() {
        let long = format!("ERROR: {}", "é".repeat(500));
        let (code, message) = classify_error(&long);
        assert_eq!(code, ErrorCode::Unknown);
        assert!(message.chars().count() <= "Download failed: ".len() + 201);

        let (_, message) = classify_error("");
        assert_eq!(message, "Download failed with unknown error.");
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_canceled());
        flag.cancel();
        assert!(other.is_canceled());
    }

    /// Runs a shell script in place of yt-dlp: the script is passed to `/bin/sh`
    /// as a global argument, so the real download arguments follow it.
    #[cfg(unix)]
    fn scripted_engine(dir: &Path, body: &str) -> YtDlpEngine {
        let script = dir.join("fake-yt-dlp.sh");
        std::fs::write(&script, body).unwrap();
        let mut cfg = YtDlpConfig::new(PathBuf::from("/bin/sh"));
        cfg.global_args = vec![script.to_string_lossy().to_string()];
        YtDlpEngine::new(cfg)
    }

    #[cfg(unix)]
    fn request(dir: &Path) -> EngineRequest {
        EngineRequest {
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
            format: MediaFormat::Audio,
            output_dir: dir.to_path_buf(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn scripted_download_reports_progress_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let engine = scripted_engine(
            dir.path(),
            "echo '[tubeshelf]  50.0%|Unknown B/s|Unknown|10.00MiB|N/A|5242880'\n\
             echo '[tubeshelf] 100.0%|1.00MiB/s|00:00|10.00MiB|N/A|10485760'\n\
             echo '[tubeshelf-file] /dl/Song.mp3'\n",
        );

        let mut seen = Vec::new();
        let path = engine
            .download(&request(dir.path()), &CancelFlag::new(), &mut |p| {
                seen.push(p.percent)
            })
            .unwrap();
        assert_eq!(path, PathBuf::from("/dl/Song.mp3"));
        assert_eq!(seen, vec![Some(50.0), Some(100.0)]);
    }

    #[cfg(unix)]
    #[test]
    fn scripted_failure_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let engine = scripted_engine(
            dir.path(),
            "echo \"ERROR: [youtube] x: Private video. Sign in if you've been granted access\" >&2\nexit 1\n",
        );
        let err = engine
            .download(&request(dir.path()), &CancelFlag::new(), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Private);
    }

    #[cfg(unix)]
    #[test]
    fn scripted_download_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let engine = scripted_engine(
            dir.path(),
            "i=0\nwhile [ $i -lt 200 ]; do echo \"[tubeshelf]$i.0%|N/A|N/A|N/A|N/A|NA\"; sleep 0.05; i=$((i+1)); done\n",
        );
        let cancel = CancelFlag::new();
        let mut calls = 0;
        let err = engine
            .download(&request(dir.path()), &cancel, &mut |_| {
                calls += 1;
                if calls == 2 {
                    cancel.cancel();
                }
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Canceled));
        assert_eq!(calls, 2);
    }

    #[test]
    fn missing_binary_is_tool_missing() {
        let engine = YtDlpEngine::new(YtDlpConfig::new(PathBuf::from(
            "/definitely/not/here/yt-dlp",
        )));
        let err = engine.fetch_video("https://youtu.be/dQw4w9WgXcQ").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ToolMissing);
    }
}

//! Tool discovery
//!
//! Locates yt-dlp and ffmpeg and checks that they run. Explicit paths from
//! configuration win, then a binary next to the executable, then PATH, then
//! the usual install locations.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// `CREATE_NO_WINDOW`, so version checks don't flash a console.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, Result};

/// External tools the app drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    YtDlp,
    Ffmpeg,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::YtDlp => "yt-dlp",
            Tool::Ffmpeg => "ffmpeg",
        }
    }

    pub fn binary_name(&self) -> &'static str {
        #[cfg(target_os = "windows")]
        {
            match self {
                Tool::YtDlp => "yt-dlp.exe",
                Tool::Ffmpeg => "ffmpeg.exe",
            }
        }
        #[cfg(not(target_os = "windows"))]
        {
            match self {
                Tool::YtDlp => "yt-dlp",
                Tool::Ffmpeg => "ffmpeg",
            }
        }
    }

    pub fn version_args(&self) -> &[&str] {
        match self {
            Tool::YtDlp => &["--version"],
            Tool::Ffmpeg => &["-version"],
        }
    }

    /// Usual install locations (Homebrew, pip --user, distro packages, MacPorts).
    fn common_paths(&self) -> Vec<PathBuf> {
        let name = self.binary_name();
        let mut paths: Vec<PathBuf> = ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/opt/local/bin"]
            .iter()
            .map(|dir| Path::new(dir).join(name))
            .collect();
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".local").join("bin").join(name));
        }
        paths
    }
}

/// Outcome of probing a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Missing,
    Broken,
}

/// What the `tools` command reports for one binary.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub tool: Tool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
    pub status: ToolStatus,
    pub last_checked: DateTime<Utc>,
}

/// Combined toolchain status for display.
#[derive(Debug, Clone, Serialize)]
pub struct ToolchainStatus {
    pub yt_dlp: ToolInfo,
    pub ffmpeg: ToolInfo,
}

impl ToolchainStatus {
    /// Downloads need yt-dlp; audio extraction and merging also need ffmpeg.
    pub fn can_download(&self) -> bool {
        self.yt_dlp.status == ToolStatus::Ok
    }
}

/// Finds tools, honoring explicit overrides first.
#[derive(Debug, Clone)]
pub struct ToolLocator {
    yt_dlp_override: Option<PathBuf>,
    ffmpeg_override: Option<PathBuf>,
    version_timeout: Duration,
}

impl ToolLocator {
    pub fn new(yt_dlp_override: Option<PathBuf>, ffmpeg_override: Option<PathBuf>) -> Self {
        Self {
            yt_dlp_override,
            ffmpeg_override,
            version_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_ffmpeg_override(mut self, path: Option<PathBuf>) -> Self {
        self.ffmpeg_override = path;
        self
    }

    /// Find the best available path for a tool, without running it.
    pub fn find_tool(&self, tool: Tool) -> Option<PathBuf> {
        let configured = match tool {
            Tool::YtDlp => self.yt_dlp_override.as_ref(),
            Tool::Ffmpeg => self.ffmpeg_override.as_ref(),
        };
        if let Some(path) = configured {
            if path.exists() {
                return Some(path.clone());
            }
            log::warn!(
                "Configured {} path {} does not exist; searching elsewhere",
                tool.as_str(),
                path.display()
            );
        }

        // A binary shipped next to the executable
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
        {
            let sidecar = exe_dir.join(tool.binary_name());
            if sidecar.is_file() {
                log::info!("Found bundled {} at {}", tool.as_str(), sidecar.display());
                return Some(sidecar);
            }
        }

        if let Ok(path) = which::which(tool.binary_name()) {
            log::debug!("Found {} on PATH at {}", tool.as_str(), path.display());
            return Some(path);
        }

        // Apps launched outside a shell may not see the user's PATH
        tool.common_paths().into_iter().find(|p| p.is_file())
    }

    /// yt-dlp path; falls back to the bare name so spawning reports it missing.
    pub fn yt_dlp_path(&self) -> PathBuf {
        self.find_tool(Tool::YtDlp).unwrap_or_else(|| {
            log::warn!("Could not find yt-dlp, falling back to PATH lookup");
            PathBuf::from(Tool::YtDlp.binary_name())
        })
    }

    pub fn ffmpeg_path(&self) -> Option<PathBuf> {
        let found = self.find_tool(Tool::Ffmpeg);
        if found.is_none() {
            log::warn!("Could not find ffmpeg; audio extraction and merging will fail");
        }
        found
    }

    /// Locates one tool and checks its version.
    pub fn get_tool_info(&self, tool: Tool) -> ToolInfo {
        let path = self.find_tool(tool);
        let (version, status) = match &path {
            Some(p) => match self.get_version(p, tool) {
                Ok(v) => (Some(v), ToolStatus::Ok),
                Err(e) => {
                    log::warn!("{} at {} is not usable: {}", tool.as_str(), p.display(), e);
                    (None, ToolStatus::Broken)
                }
            },
            None => (None, ToolStatus::Missing),
        };

        ToolInfo {
            tool,
            path,
            version,
            status,
            last_checked: Utc::now(),
        }
    }

    pub fn get_toolchain_status(&self) -> ToolchainStatus {
        ToolchainStatus {
            yt_dlp: self.get_tool_info(Tool::YtDlp),
            ffmpeg: self.get_tool_info(Tool::Ffmpeg),
        }
    }

    /// Get the version string from a tool, giving up after the version timeout.
    pub fn get_version(&self, path: &Path, tool: Tool) -> Result<String> {
        let mut cmd = Command::new(path);
        cmd.args(tool.version_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(cmd.output());
        });

        let output = rx
            .recv_timeout(self.version_timeout)
            .map_err(|_| AppError::Config(format!("{} version check timed out", tool.as_str())))??;

        if !output.status.success() {
            return Err(AppError::Config(format!(
                "{} returned non-zero exit code: {}",
                tool.as_str(),
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_version(&stdout, tool)
            .ok_or_else(|| AppError::Config(format!("could not parse {} version", tool.as_str())))
    }
}

fn parse_version(output: &str, tool: Tool) -> Option<String> {
    let line = output.lines().next().map(str::trim).filter(|l| !l.is_empty())?;
    let version = match tool {
        // bare date, e.g. 2024.01.01
        Tool::YtDlp => line,
        // "ffmpeg version <v> Copyright ..."
        Tool::Ffmpeg => line
            .strip_prefix("ffmpeg version ")
            .and_then(|rest| rest.split_whitespace().next())
            .unwrap_or(line),
    };
    Some(version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_lines_are_parsed_per_tool() {
        assert_eq!(parse_version("2025.06.30\n", Tool::YtDlp).as_deref(), Some("2025.06.30"));
        assert_eq!(parse_version("   \n", Tool::YtDlp), None);
        assert_eq!(
            parse_version("ffmpeg version 7.0.2-static https://johnvansickle.com\n", Tool::Ffmpeg)
                .as_deref(),
            Some("7.0.2-static")
        );
        assert!(Tool::YtDlp.binary_name().starts_with("yt-dlp"));
    }

    #[test]
    fn configured_path_wins_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ffmpeg-custom");
        std::fs::write(&fake, b"").unwrap();

        let locator = ToolLocator::new(None, Some(fake.clone()));
        assert_eq!(locator.find_tool(Tool::Ffmpeg), Some(fake));
    }

    #[test]
    fn missing_configured_path_is_not_returned() {
        let missing = PathBuf::from("/definitely/not/here/yt-dlp");
        let locator = ToolLocator::new(Some(missing.clone()), None);
        assert_ne!(locator.find_tool(Tool::YtDlp), Some(missing));
    }

    #[test]
    fn broken_tool_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ffmpeg-broken");
        std::fs::write(&fake, b"").unwrap();

        let locator = ToolLocator::new(None, Some(fake));
        let info = locator.get_tool_info(Tool::Ffmpeg);
        assert_eq!(info.status, ToolStatus::Broken);
        assert!(info.version.is_none());
    }
}

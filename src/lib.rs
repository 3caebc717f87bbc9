use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod queue;
pub mod settings;
pub mod tools;
pub mod ui;
pub mod url_utils;

use config::AppConfig;
use coordinator::{Coordinator, Submission};
use db::Store;
use engine::{DownloadEngine, YtDlpConfig, YtDlpEngine};
use error::{AppError, Result};
use events::EventSender;
use models::{HistoryEntry, MediaFormat, Playlist, PlaylistItem, SourceKind};
use queue::QueueSnapshot;
use settings::{SettingsManager, UserSettings};
use tools::{ToolLocator, ToolchainStatus};

/// Command surface shared by every front end. Owned by the UI thread.
pub struct App {
    store: Store,
    coordinator: Coordinator,
    tools: ToolLocator,
    settings: UserSettings,
    /// What `reset_settings` restores.
    defaults: UserSettings,
}

impl App {
    /// Open the store, locate tools and start the coordinator.
    pub fn bootstrap(config: &AppConfig, events: EventSender) -> anyhow::Result<Self> {
        let store = Store::open(&config.db_path)
            .with_context(|| format!("open database at {}", config.db_path.display()))?;
        let settings = store
            .with(|db| {
                SettingsManager::new(db.conn()).get_user_settings_or(UserSettings::from_config(config))
            })
            .context("load user settings")?;

        let ffmpeg_override = settings.ffmpeg_path.clone().or_else(|| config.ffmpeg_path.clone());
        let tools = ToolLocator::new(config.yt_dlp_path.clone(), ffmpeg_override);
        let engine = build_engine(&tools);

        Ok(Self::new(store, engine, tools, settings, events)
            .with_defaults(UserSettings::from_config(config)))
    }

    pub fn new(
        store: Store,
        engine: Arc<dyn DownloadEngine>,
        tools: ToolLocator,
        settings: UserSettings,
        events: EventSender,
    ) -> Self {
        let coordinator = Coordinator::new(
            engine,
            store.clone(),
            events,
            settings.max_concurrent as usize,
        );
        Self {
            store,
            coordinator,
            tools,
            settings,
            defaults: UserSettings::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: UserSettings) -> Self {
        self.defaults = defaults;
        self
    }

    /// Queue a URL. Format and destination default to the user settings.
    pub fn download(
        &mut self,
        url: &str,
        format: Option<MediaFormat>,
        destination: Option<PathBuf>,
        kind: Option<SourceKind>,
    ) -> Result<Submission> {
        let format = format.unwrap_or(self.settings.default_format);
        let explicit = destination.is_some();
        let destination = destination.unwrap_or_else(|| self.settings.download_folder.clone());

        let submission = self.coordinator.submit(url, format, &destination, kind)?;
        if explicit {
            let saved = self
                .store
                .with(|db| SettingsManager::new(db.conn()).save_last_destination(&destination));
            if let Err(e) = saved {
                log::warn!("Could not remember destination {}: {}", destination.display(), e);
            }
        }
        Ok(submission)
    }

    pub fn queue(&self) -> QueueSnapshot {
        self.coordinator.snapshot()
    }

    pub fn pause(&self) -> bool {
        self.coordinator.pause()
    }

    pub fn resume(&self) -> bool {
        self.coordinator.resume()
    }

    pub fn retry(&self, job: &str) -> Result<()> {
        self.coordinator.retry(self.coordinator.find_job(job)?)
    }

    pub fn cancel(&self, job: &str) -> Result<()> {
        self.coordinator.cancel(self.coordinator.find_job(job)?)
    }

    pub fn remove(&self, job: &str) -> Result<()> {
        self.coordinator.remove(self.coordinator.find_job(job)?)
    }

    pub fn clear_completed(&self) -> usize {
        self.coordinator.clear_completed()
    }

    /// Newest first. `limit` defaults to the history_limit setting.
    pub fn history(&self, limit: Option<u32>) -> Result<Vec<HistoryEntry>> {
        let limit = limit.unwrap_or(self.settings.history_limit);
        self.store.with(|db| db.list_history(limit))
    }

    pub fn delete_history(&self, id: i64) -> Result<()> {
        if self.store.with(|db| db.delete_history(id))? {
            log::info!("Deleted history entry {}", id);
            Ok(())
        } else {
            Err(AppError::NotFound(format!("history entry #{id}")))
        }
    }

    pub fn clear_history(&self) -> Result<usize> {
        let removed = self.store.with(|db| db.clear_history())?;
        log::info!("Cleared {} history entries", removed);
        Ok(removed)
    }

    /// Open the folder holding a history entry's file in the system file manager.
    pub fn open_folder(&self, id: i64) -> Result<PathBuf> {
        let entry = self
            .store
            .with(|db| db.get_history_entry(id))?
            .ok_or_else(|| AppError::NotFound(format!("history entry #{id}")))?;
        let folder = entry.folder().ok_or_else(|| {
            AppError::Validation(format!("history entry #{id} has no downloaded file"))
        })?;
        if !folder.is_dir() {
            return Err(AppError::NotFound(format!("folder {}", folder.display())));
        }

        open::that(&folder)?;
        log::info!("Opened folder {}", folder.display());
        Ok(folder)
    }

    pub fn playlist_items(&self, playlist_id: &str) -> Result<(Playlist, Vec<PlaylistItem>)> {
        self.store.with(|db| {
            let playlist = db
                .get_playlist(playlist_id)?
                .ok_or_else(|| AppError::NotFound(format!("playlist {playlist_id}")))?;
            let items = db.get_playlist_items(playlist_id)?;
            Ok((playlist, items))
        })
    }

    pub fn settings(&self) -> &UserSettings {
        &self.settings
    }

    pub fn last_destination(&self) -> Result<Option<PathBuf>> {
        self.store
            .with(|db| SettingsManager::new(db.conn()).get_last_destination())
    }

    /// Change one setting, persist it, then apply it to the running app.
    pub fn set_setting(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.settings.clone();
        updated.apply(key, value)?;
        self.replace_settings(updated)?;
        log::info!("Setting '{}' changed to '{}'", key, value);
        Ok(())
    }

    /// Restore the settings the app started with before any were saved.
    pub fn reset_settings(&mut self) -> Result<()> {
        self.replace_settings(self.defaults.clone())?;
        log::info!("Settings reset to defaults");
        Ok(())
    }

    fn replace_settings(&mut self, updated: UserSettings) -> Result<()> {
        if updated.download_folder != self.settings.download_folder {
            settings::ensure_download_folder(&updated.download_folder)?;
        }
        self.store
            .with(|db| SettingsManager::new(db.conn()).save_user_settings(&updated))?;

        if updated.max_concurrent != self.settings.max_concurrent {
            self.coordinator
                .set_max_concurrent(updated.max_concurrent as usize);
        }
        if updated.ffmpeg_path != self.settings.ffmpeg_path {
            self.tools = self.tools.clone().with_ffmpeg_override(updated.ffmpeg_path.clone());
            self.coordinator.replace_engine(build_engine(&self.tools));
        }
        self.settings = updated;
        Ok(())
    }

    pub fn tools(&self) -> ToolchainStatus {
        self.tools.get_toolchain_status()
    }

    /// Cancel running downloads, wait for their threads and close the store.
    pub fn shutdown(self) -> Result<()> {
        self.coordinator.shutdown();
        drop(self.coordinator);
        self.store.close()
    }
}

fn build_engine(tools: &ToolLocator) -> Arc<dyn DownloadEngine> {
    let mut cfg = YtDlpConfig::new(tools.yt_dlp_path());
    cfg.ffmpeg_path = tools.ffmpeg_path();
    Arc::new(YtDlpEngine::new(cfg))
}

/// Entry point: configuration, logging, then the UI loop on a single-threaded runtime.
pub fn run() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let _log_handle = logging::init(&config)?;
    log::info!("Tubeshelf {} starting", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build UI runtime")?;
    let result = runtime.block_on(ui_loop(&config));
    if let Err(e) = &result {
        log::error!("Exiting with error: {:#}", e);
    }
    result
}

async fn ui_loop(config: &AppConfig) -> anyhow::Result<()> {
    let (tx, mut rx) = events::channel();
    let mut app = App::bootstrap(config, tx)?;
    let mut view = ui::UiState::default();

    let status = app.tools();
    if !status.can_download() {
        println!("{}", ui::render_tools(&status));
    }
    println!("Tubeshelf ready. Type 'help' for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match ui::Command::parse(&line) {
                    Ok(ui::Command::Quit) => break,
                    Ok(command) => match ui::execute(&mut app, command) {
                        Ok(text) if text.is_empty() => {}
                        Ok(text) => println!("{text}"),
                        Err(e) => println!("Error: {e}"),
                    },
                    Err(e) => println!("{e}"),
                }
            }
            Some(event) = rx.recv() => {
                if let Some(text) = view.apply(&event) {
                    println!("{text}");
                }
            }
        }
    }

    log::info!("Shutting down");
    app.shutdown()?;
    // Terminal events from canceled workers
    while let Ok(event) = rx.try_recv() {
        if let Some(text) = view.apply(&event) {
            println!("{text}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CancelFlag, EngineRequest, PlaylistInfo, VideoInfo};
    use crate::error::EngineError;
    use crate::events::EventReceiver;
    use crate::models::{NewHistory, Progress};
    use std::path::Path;

    /// Every call fails as if yt-dlp were not installed.
    struct MissingEngine;

    fn missing() -> EngineError {
        EngineError::ToolMissing {
            tool: "yt-dlp".into(),
            path: PathBuf::from("yt-dlp"),
        }
    }

    impl DownloadEngine for MissingEngine {
        fn fetch_video(&self, _url: &str) -> std::result::Result<VideoInfo, EngineError> {
            Err(missing())
        }

        fn fetch_playlist(&self, _url: &str) -> std::result::Result<PlaylistInfo, EngineError> {
            Err(missing())
        }

        fn download(
            &self,
            _request: &EngineRequest,
            _cancel: &CancelFlag,
            _on_progress: &mut dyn FnMut(Progress),
        ) -> std::result::Result<PathBuf, EngineError> {
            Err(missing())
        }
    }

    fn test_app(dir: &Path) -> (App, EventReceiver) {
        let (tx, rx) = events::channel();
        let settings = UserSettings {
            download_folder: dir.join("downloads"),
            ..UserSettings::default()
        };
        let app = App::new(
            Store::open_in_memory().unwrap(),
            Arc::new(MissingEngine),
            ToolLocator::new(None, None),
            settings,
            tx,
        );
        (app, rx)
    }

    #[test]
    fn settings_are_validated_persisted_and_applied() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx) = test_app(dir.path());

        app.set_setting("max_concurrent", "3").unwrap();
        assert_eq!(app.queue().max_concurrent, 3);
        let saved = app
            .store
            .with(|db| SettingsManager::new(db.conn()).get_user_settings())
            .unwrap();
        assert_eq!(saved.max_concurrent, 3);

        let err = app
            .set_setting("ffmpeg_path", "/definitely/not/here/ffmpeg")
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(app.settings().ffmpeg_path, None);

        assert!(matches!(
            app.set_setting("volume", "11").unwrap_err(),
            AppError::Validation(_)
        ));
    }

    #[test]
    fn download_folder_is_created_when_set() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx) = test_app(dir.path());

        let target = dir.path().join("media").join("clips");
        app.set_setting("download_folder", target.to_str().unwrap()).unwrap();
        assert!(target.is_dir());
        assert_eq!(app.settings().download_folder, target);

        let blocker = dir.path().join("not-a-folder");
        std::fs::write(&blocker, b"x").unwrap();
        let err = app
            .set_setting("download_folder", blocker.join("sub").to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(app.settings().download_folder, target);
    }

    #[test]
    fn reset_restores_startup_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = test_app(dir.path());
        let defaults = UserSettings {
            download_folder: dir.path().join("default-downloads"),
            history_limit: 20,
            ..UserSettings::default()
        };
        let mut app = app.with_defaults(defaults.clone());

        app.set_setting("max_concurrent", "5").unwrap();
        app.set_setting("default_format", "audio").unwrap();
        app.reset_settings().unwrap();

        assert_eq!(app.settings(), &defaults);
        assert_eq!(app.queue().max_concurrent, defaults.max_concurrent as usize);
        assert!(defaults.download_folder.is_dir());
        let saved = app
            .store
            .with(|db| SettingsManager::new(db.conn()).get_user_settings())
            .unwrap();
        assert_eq!(saved, defaults);
    }

    #[test]
    fn queued_download_survives_unsaved_destination() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx) = test_app(dir.path());
        app.store
            .with(|db| Ok(db.conn().execute_batch("DROP TABLE settings")?))
            .unwrap();

        let submission = app
            .download(
                "https://youtu.be/dQw4w9WgXcQ",
                None,
                Some(dir.path().join("elsewhere")),
                None,
            )
            .unwrap();
        assert!(matches!(submission, Submission::Queued(_)));
        assert_eq!(app.queue().jobs.len(), 1);
        app.shutdown().unwrap();
    }

    #[test]
    fn history_can_be_deleted_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = test_app(dir.path());
        let ids: Vec<i64> = (0..3)
            .map(|_| {
                app.store
                    .with(|db| db.add_history(&NewHistory::default()))
                    .unwrap()
            })
            .collect();

        app.delete_history(ids[0]).unwrap();
        assert!(matches!(
            app.delete_history(ids[0]).unwrap_err(),
            AppError::NotFound(_)
        ));
        assert_eq!(app.history(None).unwrap().len(), 2);
        assert_eq!(app.history(Some(1)).unwrap().len(), 1);

        // A pending entry has no file to reveal
        assert!(matches!(
            app.open_folder(ids[1]).unwrap_err(),
            AppError::Validation(_)
        ));
        assert_eq!(app.clear_history().unwrap(), 2);
    }

    #[test]
    fn explicit_destination_is_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, mut rx) = test_app(dir.path());
        let dest = dir.path().join("music");

        let submission = app
            .download(
                "https://youtu.be/dQw4w9WgXcQ",
                Some(MediaFormat::Audio),
                Some(dest.clone()),
                None,
            )
            .unwrap();
        assert!(matches!(submission, Submission::Queued(_)));
        assert_eq!(app.last_destination().unwrap(), Some(dest));

        // The job fails because the engine is missing, and says so
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        let failure = loop {
            match rx.try_recv() {
                Ok(event @ events::AppEvent::JobFailed { .. }) => break event,
                Ok(_) => {}
                Err(_) => {
                    assert!(std::time::Instant::now() < deadline, "no failure event");
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
            }
        };
        assert!(matches!(
            failure,
            events::AppEvent::JobFailed {
                error_code: events::ErrorCode::ToolMissing,
                ..
            }
        ));
        app.shutdown().unwrap();
    }

    #[test]
    fn unknown_playlist_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = test_app(dir.path());
        assert!(matches!(
            app.playlist_items("PLnothing").unwrap_err(),
            AppError::NotFound(_)
        ));
        assert!(matches!(
            app.retry("zzzz").unwrap_err(),
            AppError::Queue(_)
        ));
    }
}

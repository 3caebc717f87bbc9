//! Download Coordinator
//!
//! Turns validated URLs into queued jobs and runs admitted jobs on their own
//! OS threads. Workers persist history and video rows through the shared
//! [`Store`] and report back to the UI only through [`AppEvent`]s.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};

use uuid::Uuid;

use crate::db::{Db, Store};
use crate::engine::{CancelFlag, DownloadEngine, EngineRequest};
use crate::error::{AppError, EngineError, QueueError, Result};
use crate::events::{emit, helpers, AppEvent, ErrorCode, EventSender, MediaInfo};
use crate::models::{HistoryStatus, MediaFormat, NewHistory, Playlist, Progress, SourceKind, Video};
use crate::queue::{short_id, Job, JobSpec, JobState, QueueManager, QueueSnapshot};
use crate::url_utils::{validate_download_url, YoutubeUrl};

/// Minimum change in percent between two progress events.
const PROGRESS_STEP: f64 = 0.5;

const CANCELED_BEFORE_START: &str = "Canceled before start";

/// What `submit` did with a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// A single job was queued.
    Queued(Uuid),
    /// A playlist or channel is being enumerated; jobs follow in `PlaylistExpanded`.
    Expanding { url: String },
}

struct Worker {
    cancel: CancelFlag,
    handle: JoinHandle<()>,
}

struct Shared {
    engine: RwLock<Arc<dyn DownloadEngine>>,
    store: Store,
    queue: Mutex<QueueManager>,
    events: EventSender,
    active: Mutex<HashMap<Uuid, Worker>>,
    closed: AtomicBool,
}

/// Cheap to clone; every clone drives the same queue.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(
        engine: Arc<dyn DownloadEngine>,
        store: Store,
        events: EventSender,
        max_concurrent: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine: RwLock::new(engine),
                store,
                queue: Mutex::new(QueueManager::new(max_concurrent)),
                events,
                active: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Validate `url` and queue it. `kind` overrides the kind detected from the URL.
    pub fn submit(
        &self,
        url: &str,
        format: MediaFormat,
        destination: &Path,
        kind: Option<SourceKind>,
    ) -> Result<Submission> {
        let mut parsed = validate_download_url(url)?;
        if destination.as_os_str().is_empty() {
            return Err(AppError::Validation("Please choose a destination folder.".into()));
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(AppError::Validation("Downloads are shutting down.".into()));
        }
        if let Some(kind) = kind {
            parsed.kind = kind;
        }

        if parsed.kind.is_collection() {
            self.spawn_expansion(parsed, format, destination.to_path_buf())?;
            return Ok(Submission::Expanding { url: url.trim().to_string() });
        }

        let history_id = self.shared.persist("creating history row", |db| {
            db.add_history(&NewHistory {
                status: Some(HistoryStatus::Pending),
                ..Default::default()
            })
        });
        let spec = JobSpec::new(parsed.url.clone(), format, destination);
        let id = lock(&self.shared.queue).enqueue(spec, history_id);
        log::info!("Queued job {} for {}", short_id(&id), parsed.url);

        emit(&self.shared.events, AppEvent::JobQueued { id, url: parsed.url });
        self.shared.pump();
        Ok(Submission::Queued(id))
    }

    fn spawn_expansion(
        &self,
        parsed: YoutubeUrl,
        format: MediaFormat,
        destination: PathBuf,
    ) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let name = format!("expand-{}", short_id(&Uuid::new_v4()));
        log::info!("Expanding {} {} on {}", parsed.kind.as_str(), parsed.url, name);

        thread::Builder::new()
            .name(name)
            .spawn(move || shared.expand(parsed, format, destination))?;
        Ok(())
    }

    /// Stop admitting new jobs. In-flight jobs keep running.
    pub fn pause(&self) -> bool {
        let changed = lock(&self.shared.queue).pause();
        if changed {
            log::info!("Queue paused");
            emit(&self.shared.events, AppEvent::QueuePaused);
        }
        changed
    }

    pub fn resume(&self) -> bool {
        let changed = lock(&self.shared.queue).resume();
        if changed {
            log::info!("Queue resumed");
            emit(&self.shared.events, AppEvent::QueueResumed);
            self.shared.pump();
        }
        changed
    }

    /// Re-queue a failed job with a fresh history row.
    pub fn retry(&self, id: Uuid) -> Result<()> {
        {
            let mut queue = lock(&self.shared.queue);
            let job = queue.get(id).ok_or(QueueError::UnknownJob(id))?;
            if job.state != JobState::Failed {
                return Err(QueueError::InvalidTransition {
                    id,
                    from: job.state,
                    to: JobState::Pending,
                }
                .into());
            }
            let entry = NewHistory {
                video_id: job.spec.video_id.clone(),
                playlist_id: job.spec.playlist_id.clone(),
                status: Some(HistoryStatus::Pending),
                ..Default::default()
            };
            let history_id = self
                .shared
                .persist("creating history row", |db| db.add_history(&entry));
            queue.retry(id, history_id)?;
        }
        log::info!("Retrying job {}", short_id(&id));

        emit(&self.shared.events, AppEvent::JobRetried { id });
        self.shared.pump();
        Ok(())
    }

    /// Cancel a job. A downloading job is signalled and later fails with
    /// "Canceled by user"; a pending one is dropped from the queue.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let active = lock(&self.shared.active);
        if let Some(worker) = active.get(&id) {
            log::info!("Cancel requested for job {}", short_id(&id));
            worker.cancel.cancel();
            return Ok(());
        }

        let mut queue = lock(&self.shared.queue);
        let state = queue.get(id).ok_or(QueueError::UnknownJob(id))?.state;
        if state != JobState::Pending {
            return Err(QueueError::InvalidTransition {
                id,
                from: state,
                to: JobState::Failed,
            }
            .into());
        }
        let job = queue.remove(id)?;
        drop(queue);
        drop(active);

        self.shared.settle_removed(&job, CANCELED_BEFORE_START);
        Ok(())
    }

    /// Drop a job that is not downloading.
    pub fn remove(&self, id: Uuid) -> Result<()> {
        let job = lock(&self.shared.queue).remove(id)?;
        self.shared.settle_removed(&job, CANCELED_BEFORE_START);
        Ok(())
    }

    pub fn clear_completed(&self) -> usize {
        let removed = lock(&self.shared.queue).clear_completed();
        if removed > 0 {
            log::info!("Cleared {} completed job(s)", removed);
        }
        removed
    }

    pub fn set_max_concurrent(&self, n: usize) {
        lock(&self.shared.queue).set_max_concurrent(n);
        log::info!("Max concurrent downloads set to {}", n.max(1));
        self.shared.pump();
    }

    pub fn active_count(&self) -> usize {
        lock(&self.shared.queue).active_count()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        lock(&self.shared.queue).snapshot()
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        lock(&self.shared.queue).get(id).cloned()
    }

    /// Resolve a full id or a unique short-id prefix.
    pub fn find_job(&self, prefix: &str) -> Result<Uuid> {
        Ok(lock(&self.shared.queue).find_by_prefix(prefix)?)
    }

    /// Use a different engine for jobs started from now on.
    pub fn replace_engine(&self, engine: Arc<dyn DownloadEngine>) {
        *self
            .shared
            .engine
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = engine;
        log::info!("Download engine reconfigured");
    }

    /// Admit as many pending jobs as capacity allows.
    pub fn pump(&self) {
        self.shared.pump();
    }

    /// Cancel every running job and wait for its thread. No job is admitted afterwards.
    ///
    /// The engine only sees the cancel flag between output lines, so a worker in a
    /// silent step (metadata fetch, ffmpeg post-processing) is joined once that step ends.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let workers: Vec<(Uuid, Worker)> = lock(&self.shared.active).drain().collect();
        if workers.is_empty() {
            return;
        }

        log::info!("Shutting down {} active download(s)", workers.len());
        for (_, worker) in &workers {
            worker.cancel.cancel();
        }
        for (id, worker) in workers {
            if worker.handle.join().is_err() {
                log::error!("Worker for job {} panicked", short_id(&id));
            }
        }
    }
}

impl Shared {
    fn engine(&self) -> Arc<dyn DownloadEngine> {
        self.engine
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn pump(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut active = lock(&self.active);
        // shutdown sets `closed` before it drains `active` under this lock
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        loop {
            let Some(job) = lock(&self.queue).admit_next() else {
                break;
            };
            let id = job.id;
            let history_id = job.history_id;
            let cancel = CancelFlag::new();
            let flag = cancel.clone();
            let shared = Arc::clone(self);

            let spawned = thread::Builder::new()
                .name(format!("download-{}", job.short_id()))
                .spawn(move || shared.run_job(job, flag));

            match spawned {
                Ok(handle) => {
                    active.insert(id, Worker { cancel, handle });
                }
                Err(e) => {
                    log::error!("Failed to spawn worker for job {}: {}", short_id(&id), e);
                    let message = format!("Could not start download: {e}");
                    if let Some(hid) = history_id {
                        self.persist("failing history row", |db| db.fail_history(hid, &message));
                    }
                    if let Err(e) = lock(&self.queue).fail(id, message.clone()) {
                        log::warn!("{}", e);
                    }
                    emit(&self.events, helpers::fail(id, ErrorCode::Unknown, message));
                }
            }
        }
    }

    fn run_job(self: Arc<Self>, job: Job, cancel: CancelFlag) {
        let id = job.id;
        log::info!("Job {} started: {}", job.short_id(), job.spec.url);

        if let Some(hid) = job.history_id {
            self.persist("marking history downloading", |db| {
                db.mark_history_downloading(hid)
            });
        }
        emit(&self.events, AppEvent::JobStarted { id });

        match self.execute(&job, &cancel) {
            Ok((video_id, path)) => self.finish_ok(&job, video_id, path),
            Err(err) => self.finish_err(&job, err),
        }

        lock(&self.active).remove(&id);
        self.pump();
    }

    fn execute(
        &self,
        job: &Job,
        cancel: &CancelFlag,
    ) -> std::result::Result<(Option<String>, PathBuf), EngineError> {
        let id = job.id;
        let engine = self.engine();
        let mut video_id = job.spec.video_id.clone();

        if video_id.is_none() {
            let info = engine.fetch_video(&job.spec.url)?;
            let media = MediaInfo {
                video_id: info.id.clone(),
                title: info.title.clone(),
                channel: info.channel.clone(),
                duration_seconds: info.duration,
            };
            let video = info.into_video();
            let history_id = job.history_id;
            self.persist("saving video metadata", |db| {
                db.upsert_video(&video)?;
                if let Some(hid) = history_id {
                    db.attach_history_video(hid, &video.id)?;
                }
                Ok(())
            });
            if let Err(e) = lock(&self.queue).set_video(id, &media.video_id, &media.title) {
                log::warn!("{}", e);
            }
            log::info!("Metadata for job {}: {}", job.short_id(), media.title);
            video_id = Some(media.video_id.clone());
            emit(&self.events, AppEvent::MetadataReady { id, info: media });
        }

        if cancel.is_canceled() {
            return Err(EngineError::Canceled);
        }

        fs::create_dir_all(&job.spec.destination)?;
        let request = EngineRequest {
            url: job.spec.url.clone(),
            format: job.spec.format,
            output_dir: job.spec.destination.clone(),
        };

        let mut last_sent: Option<f64> = None;
        let mut on_progress = |progress: Progress| {
            if let Err(e) = lock(&self.queue).update_progress(id, progress.clone()) {
                log::debug!("{}", e);
            }
            if should_emit(last_sent, progress.percent) {
                last_sent = progress.percent;
                emit(&self.events, AppEvent::JobProgress { id, progress });
            }
        };

        let path = engine.download(&request, cancel, &mut on_progress)?;
        Ok((video_id, path))
    }

    fn finish_ok(&self, job: &Job, video_id: Option<String>, path: PathBuf) {
        let id = job.id;
        let file_path = path.to_string_lossy().into_owned();
        let file_size = fs::metadata(&path).ok().map(|m| m.len() as i64);
        log::info!("Job {} completed: {}", job.short_id(), file_path);

        if let Some(video_id) = &video_id {
            self.persist("saving file path", |db| {
                db.set_video_file_path(video_id, &file_path)
            });
        }
        if let Some(hid) = job.history_id {
            self.persist("completing history row", |db| {
                db.complete_history(hid, Some(&file_path), file_size)
            });
        }
        if let Err(e) = lock(&self.queue).complete(id, Some(file_path.clone())) {
            log::warn!("{}", e);
        }
        emit(&self.events, AppEvent::JobCompleted { id, file_path });
    }

    fn finish_err(&self, job: &Job, err: EngineError) {
        let id = job.id;
        let code = err.code();
        let message = err.to_string();
        if code == ErrorCode::Canceled {
            log::info!("Job {} canceled", job.short_id());
        } else {
            log::warn!("Job {} failed ({:?}): {}", job.short_id(), code, message);
        }

        if let Some(hid) = job.history_id {
            self.persist("failing history row", |db| db.fail_history(hid, &message));
        }
        if let Err(e) = lock(&self.queue).fail(id, message.clone()) {
            log::warn!("{}", e);
        }
        emit(&self.events, helpers::fail(id, code, message));
    }

    /// Bookkeeping for a job taken out of the queue without running.
    fn settle_removed(&self, job: &Job, reason: &str) {
        if job.state == JobState::Pending {
            if let Some(hid) = job.history_id {
                self.persist("failing history row", |db| db.fail_history(hid, reason));
            }
        }
        log::info!("Removed job {} ({})", job.short_id(), job.state);
        emit(&self.events, AppEvent::JobRemoved { id: job.id });
    }

    fn expand(self: Arc<Self>, parsed: YoutubeUrl, format: MediaFormat, destination: PathBuf) {
        let info = match self.engine().fetch_playlist(&parsed.url) {
            Ok(info) => info,
            Err(err) => {
                log::warn!("Expansion of {} failed: {}", parsed.url, err);
                emit(
                    &self.events,
                    AppEvent::ExpansionFailed {
                        url: parsed.url,
                        error_code: err.code(),
                        user_message: err.to_string(),
                    },
                );
                return;
            }
        };

        let playlist_id = info.id.clone().unwrap_or_else(|| parsed.id.clone());
        let title = info.title.clone().unwrap_or_else(|| playlist_id.clone());
        let folder = destination.join(playlist_folder(&title, &playlist_id));

        let playlist = Playlist {
            url: Some(parsed.url.clone()),
            ..Playlist::new(playlist_id.clone(), title.clone())
        };
        let playlist_saved = self
            .persist("saving playlist", |db| db.upsert_playlist(&playlist))
            .is_some();

        let mut specs = Vec::with_capacity(info.entries.len());
        for (position, entry) in info.entries.into_iter().enumerate() {
            let video = Video {
                duration: entry.duration,
                channel: entry.channel.clone(),
                ..Video::new(
                    entry.video_id.clone(),
                    entry.title.clone().unwrap_or_else(|| entry.video_id.clone()),
                    entry.url.clone(),
                )
            };
            let history_id = self.persist("saving playlist entry", |db| {
                db.upsert_video(&video)?;
                if playlist_saved {
                    db.link_video(&playlist_id, &video.id, position as i64)?;
                }
                db.add_history(&NewHistory {
                    video_id: Some(video.id.clone()),
                    playlist_id: playlist_saved.then(|| playlist_id.clone()),
                    status: Some(HistoryStatus::Pending),
                    ..Default::default()
                })
            });

            let spec = JobSpec {
                video_id: Some(entry.video_id),
                playlist_id: Some(playlist_id.clone()),
                title: entry.title,
                ..JobSpec::new(entry.url, format, folder.clone())
            };
            specs.push((spec, history_id));
        }

        if self.closed.load(Ordering::SeqCst) {
            log::info!("Discarding expansion of {}: shutting down", parsed.url);
            return;
        }

        let job_ids: Vec<Uuid> = {
            let mut queue = lock(&self.queue);
            specs
                .into_iter()
                .map(|(spec, history_id)| queue.enqueue(spec, history_id))
                .collect()
        };
        log::info!(
            "Expanded '{}' into {} job(s) under {}",
            title,
            job_ids.len(),
            folder.display()
        );

        emit(
            &self.events,
            AppEvent::PlaylistExpanded {
                playlist_id,
                title,
                count: job_ids.len(),
                job_ids,
            },
        );
        self.pump();
    }

    /// Run a store operation; failures are logged and reported, never fatal.
    fn persist<T>(&self, what: &str, f: impl FnOnce(&mut Db) -> Result<T>) -> Option<T> {
        match self.store.with(f) {
            Ok(value) => Some(value),
            Err(err) => {
                log::error!("Store error while {}: {}", what, err);
                emit(&self.events, helpers::store_error(&err));
                None
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn playlist_folder(title: &str, fallback: &str) -> String {
    let name = sanitize_filename::sanitize(title);
    if name.trim().is_empty() {
        sanitize_filename::sanitize(fallback)
    } else {
        name
    }
}

/// Throttle progress events: every 0.5 points, and 100% whenever it is reached.
fn should_emit(last: Option<f64>, percent: Option<f64>) -> bool {
    match (last, percent) {
        (_, None) => false,
        (last, Some(p)) if p >= 100.0 => last.map_or(true, |l| l < 100.0),
        (None, Some(_)) => true,
        (Some(l), Some(p)) => (p - l).abs() >= PROGRESS_STEP,
    }
}

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{MediaFormat, Progress};

pub const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Lifecycle of a queued download.
///
/// Legal moves: Pending -> Downloading -> {Completed | Failed}, Failed -> Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Downloading => "downloading",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, to: JobState) -> bool {
        matches!(
            (self, to),
            (JobState::Pending, JobState::Downloading)
                | (JobState::Downloading, JobState::Completed)
                | (JobState::Downloading, JobState::Failed)
                | (JobState::Failed, JobState::Pending)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to download and where.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSpec {
    pub url: String,
    pub format: MediaFormat,
    pub destination: PathBuf,
    /// Known when the job came from a playlist expansion.
    pub video_id: Option<String>,
    pub playlist_id: Option<String>,
    pub title: Option<String>,
}

impl JobSpec {
    pub fn new(url: impl Into<String>, format: MediaFormat, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            format,
            destination: destination.into(),
            video_id: None,
            playlist_id: None,
            title: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub spec: JobSpec,
    pub state: JobState,
    /// History row of the current attempt.
    pub history_id: Option<i64>,
    pub progress: Progress,
    pub error: Option<String>,
    pub file_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn short_id(&self) -> String {
        short_id(&self.id)
    }

    /// Title when known, otherwise the URL.
    pub fn label(&self) -> &str {
        self.spec.title.as_deref().unwrap_or(&self.spec.url)
    }
}

pub fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub downloading: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.downloading + self.completed + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub jobs: Vec<Job>,
    pub paused: bool,
    pub max_concurrent: usize,
}

/// Ordered job list with a global pause flag and a capacity limit.
///
/// Not synchronized by itself; the coordinator keeps it behind a mutex.
#[derive(Debug)]
pub struct QueueManager {
    jobs: Vec<Job>,
    paused: bool,
    max_concurrent: usize,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

impl QueueManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            jobs: Vec::new(),
            paused: false,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn enqueue(&mut self, spec: JobSpec, history_id: Option<i64>) -> Uuid {
        let id = Uuid::new_v4();
        log::info!("Queued job {} for {}", short_id(&id), spec.url);
        self.jobs.push(Job {
            id,
            spec,
            state: JobState::Pending,
            history_id,
            progress: Progress::default(),
            error: None,
            file_path: None,
            created_at: Utc::now(),
        });
        id
    }

    pub fn get(&self, id: Uuid) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut Job, QueueError> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(QueueError::UnknownJob(id))
    }

    /// Resolve a full id or a unique prefix of its simple (dashless) form.
    pub fn find_by_prefix(&self, prefix: &str) -> Result<Uuid, QueueError> {
        let needle = prefix.trim().to_ascii_lowercase().replace('-', "");
        if needle.is_empty() {
            return Err(QueueError::NoMatch(prefix.to_string()));
        }
        let mut matches = self
            .jobs
            .iter()
            .filter(|j| j.id.simple().to_string().starts_with(&needle));
        match (matches.next(), matches.next()) {
            (Some(job), None) => Ok(job.id),
            (Some(_), Some(_)) => Err(QueueError::AmbiguousPrefix(prefix.to_string())),
            (None, _) => Err(QueueError::NoMatch(prefix.to_string())),
        }
    }

    fn transition(&mut self, id: Uuid, to: JobState) -> Result<&mut Job, QueueError> {
        let job = self.get_mut(id)?;
        if !job.state.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                id,
                from: job.state,
                to,
            });
        }
        log::debug!("Job {} {} -> {}", short_id(&id), job.state, to);
        job.state = to;
        Ok(job)
    }

    /// Admit the oldest pending job if not paused and below capacity.
    /// Returns a copy of the admitted job.
    pub fn admit_next(&mut self) -> Option<Job> {
        if self.paused || self.active_count() >= self.max_concurrent {
            return None;
        }
        let id = self.jobs.iter().find(|j| j.state == JobState::Pending)?.id;
        self.transition(id, JobState::Downloading).ok().map(|j| j.clone())
    }

    pub fn complete(&mut self, id: Uuid, file_path: Option<String>) -> Result<(), QueueError> {
        let job = self.transition(id, JobState::Completed)?;
        job.file_path = file_path;
        job.progress.percent = Some(100.0);
        job.error = None;
        Ok(())
    }

    pub fn fail(&mut self, id: Uuid, message: impl Into<String>) -> Result<(), QueueError> {
        let job = self.transition(id, JobState::Failed)?;
        job.error = Some(message.into());
        Ok(())
    }

    /// Failed -> Pending, moved to the back of the queue.
    pub fn retry(&mut self, id: Uuid, history_id: Option<i64>) -> Result<(), QueueError> {
        let job = self.transition(id, JobState::Pending)?;
        job.error = None;
        job.progress = Progress::default();
        job.history_id = history_id;

        let idx = self
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or(QueueError::UnknownJob(id))?;
        let job = self.jobs.remove(idx);
        self.jobs.push(job);
        Ok(())
    }

    pub fn update_progress(&mut self, id: Uuid, progress: Progress) -> Result<(), QueueError> {
        self.get_mut(id)?.progress = progress;
        Ok(())
    }

    /// Record metadata discovered while the job runs.
    pub fn set_video(&mut self, id: Uuid, video_id: &str, title: &str) -> Result<(), QueueError> {
        let job = self.get_mut(id)?;
        job.spec.video_id = Some(video_id.to_string());
        job.spec.title = Some(title.to_string());
        Ok(())
    }

    /// Returns false when already paused.
    pub fn pause(&mut self) -> bool {
        let changed = !self.paused;
        self.paused = true;
        changed
    }

    /// Returns false when not paused.
    pub fn resume(&mut self) -> bool {
        let changed = self.paused;
        self.paused = false;
        changed
    }

    /// Drop a job that is not downloading.
    pub fn remove(&mut self, id: Uuid) -> Result<Job, QueueError> {
        let idx = self
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or(QueueError::UnknownJob(id))?;
        if self.jobs[idx].state == JobState::Downloading {
            return Err(QueueError::Busy(id));
        }
        Ok(self.jobs.remove(idx))
    }

    pub fn clear_completed(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.state != JobState::Completed);
        before - self.jobs.len()
    }

    pub fn set_max_concurrent(&mut self, n: usize) {
        self.max_concurrent = n.max(1);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.state == JobState::Downloading)
            .count()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for job in &self.jobs {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Downloading => stats.downloading += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            jobs: self.jobs.clone(),
            paused: self.paused,
            max_concurrent: self.max_concurrent,
        }
    }
}

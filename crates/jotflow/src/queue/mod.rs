//! The job queue: authoritative in-memory registry of all jobs.
//!
//! All mutation is mediated here, behind one registry-wide `RwLock`:
//! transition validation, FIFO ordering, write-through persistence to the
//! database and event emission all happen inside the critical section, so
//! per-job events are delivered in commit order. Contention is inherently
//! low (one worker, occasional user actions).
//!
//! On a storage failure the in-memory mutation is kept and the event still
//! emitted - the user's action is not lost - and the error is returned to
//! the caller. Because every write-through persists the whole registry, the
//! next successful mutation repairs the store.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::analysis::{AnalysisResult, AttachmentRef, JobKind};
use crate::broadcast::{JobEvent, JobEventBroadcaster};
use crate::db::{job_repo, Database};
use crate::error::QueueError;

pub mod job;

pub use job::{JobId, JobRecord, JobState, PREVIEW_CHARS};

/// Derived counts for the indicator badge. Computed from the registry,
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub processing: usize,
    pub ready_for_review: usize,
}

pub struct JobQueue {
    jobs: RwLock<Vec<JobRecord>>,
    db: Database,
    events: JobEventBroadcaster,
}

impl JobQueue {
    /// Loads the persisted job set and runs the startup recovery rule:
    /// no job may be `processing` before the worker has started, so any
    /// such record is reset to `queued` with its original `created_at`.
    ///
    /// Must run before the processor loop starts accepting work.
    pub fn load(db: Database, events: JobEventBroadcaster) -> Result<Self, QueueError> {
        let rows = job_repo::load_all(&db)?;
        let total = rows.len();

        let mut jobs: Vec<JobRecord> = Vec::with_capacity(total);
        for row in &rows {
            match JobRecord::from_row(row) {
                Ok(job) => jobs.push(job),
                Err(e) => log::warn!("Skipping corrupt job row '{}': {}", row.id, e),
            }
        }

        let mut recovered = 0;
        for job in &mut jobs {
            if job.recover_orphaned() {
                recovered += 1;
            }
        }

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        if recovered > 0 || jobs.len() != total {
            let rows: Vec<_> = jobs.iter().map(JobRecord::to_row).collect();
            job_repo::replace_all(&db, &rows)?;
        }
        if recovered > 0 {
            log::info!("Recovered {} orphaned processing job(s) to queued", recovered);
        }
        log::info!("Loaded {} job(s) from store", jobs.len());

        Ok(Self {
            jobs: RwLock::new(jobs),
            db,
            events,
        })
    }

    /// The broadcaster this queue emits lifecycle events on.
    pub fn events(&self) -> &JobEventBroadcaster {
        &self.events
    }

    /// Submits new content for analysis and returns the job id.
    ///
    /// Fails only when the write-through persist fails; the record is
    /// registered in memory either way.
    pub fn submit(
        &self,
        kind: JobKind,
        input: &str,
        attachments: Vec<AttachmentRef>,
    ) -> Result<JobId, QueueError> {
        let job = JobRecord::new(kind, input, attachments);
        let id = job.id.clone();

        let mut jobs = self.write();
        jobs.push(job.clone());
        let persisted = self.persist(&jobs);
        self.events.send(JobEvent::Added(job));
        drop(jobs);

        log::debug!("Submitted job {}", id);
        persisted.map(|_| id)
    }

    /// Read-only snapshots of all jobs, ordered by `created_at` ascending.
    pub fn list(&self) -> Vec<JobRecord> {
        let jobs = self.read();
        let mut snapshot: Vec<JobRecord> = jobs.clone();
        snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshot
    }

    /// Snapshot of a single job, if present.
    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.read().iter().find(|j| &j.id == id).cloned()
    }

    /// Counts backing the indicator badge.
    pub fn counts(&self) -> QueueCounts {
        let jobs = self.read();
        QueueCounts {
            processing: jobs.iter().filter(|j| j.is_processing()).count(),
            ready_for_review: jobs
                .iter()
                .filter(|j| matches!(j.state, JobState::Complete { .. }))
                .count(),
        }
    }

    /// The oldest queued job, or `None` while any job is processing.
    /// Used exclusively by the processor loop.
    pub fn next_eligible(&self) -> Option<JobRecord> {
        let jobs = self.read();
        if jobs.iter().any(|j| j.is_processing()) {
            return None;
        }
        jobs.iter().find(|j| j.is_queued()).cloned()
    }

    /// queued -> processing. Guarded by the single-flight rule: fails if
    /// any other job is already processing.
    pub fn mark_processing(&self, id: &JobId) -> Result<(), QueueError> {
        let mut jobs = self.write();
        if let Some(active) = jobs.iter().find(|j| j.is_processing()) {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                operation: "mark_processing",
                reason: format!("job {} is already processing", active.id),
            });
        }
        self.commit(&mut jobs, id, |job| job.begin_processing(), JobEvent::Updated)
    }

    /// Relays a progress callback onto the record.
    pub fn apply_progress(
        &self,
        id: &JobId,
        percent: u8,
        current_step: &str,
    ) -> Result<(), QueueError> {
        let mut jobs = self.write();
        self.commit(
            &mut jobs,
            id,
            |job| job.record_progress(percent, current_step),
            JobEvent::Updated,
        )
    }

    /// processing -> complete.
    pub fn mark_complete(&self, id: &JobId, result: AnalysisResult) -> Result<(), QueueError> {
        let mut jobs = self.write();
        self.commit(&mut jobs, id, |job| job.finish(result), JobEvent::Completed)
    }

    /// processing -> error.
    pub fn mark_error(&self, id: &JobId, message: &str) -> Result<(), QueueError> {
        let mut jobs = self.write();
        self.commit(&mut jobs, id, |job| job.fail(message), JobEvent::Completed)
    }

    /// error -> queued. The user-facing recovery action for failed jobs.
    pub fn retry(&self, id: &JobId) -> Result<(), QueueError> {
        let mut jobs = self.write();
        self.commit(&mut jobs, id, |job| job.reset_for_retry(), JobEvent::Updated)
    }

    /// Removes a job regardless of status (dismiss, or cleanup after
    /// review). Returns whether a record existed.
    pub fn remove(&self, id: &JobId) -> Result<bool, QueueError> {
        let mut jobs = self.write();
        let Some(pos) = jobs.iter().position(|j| &j.id == id) else {
            return Ok(false);
        };
        let job = jobs.remove(pos);
        let persisted = self.persist(&jobs);
        self.events.send(JobEvent::Removed(job));
        drop(jobs);

        log::debug!("Removed job {}", id);
        persisted.map(|_| true)
    }

    /// Applies a validated transition, persists the full set and emits the
    /// corresponding event. Caller holds the write lock.
    fn commit<F>(
        &self,
        jobs: &mut Vec<JobRecord>,
        id: &JobId,
        apply: F,
        make_event: fn(JobRecord) -> JobEvent,
    ) -> Result<(), QueueError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), QueueError>,
    {
        let snapshot = {
            let job = jobs
                .iter_mut()
                .find(|j| &j.id == id)
                .ok_or_else(|| QueueError::UnknownJob { id: id.to_string() })?;
            apply(job)?;
            job.clone()
        };

        let persisted = self.persist(jobs);
        self.events.send(make_event(snapshot));
        persisted
    }

    fn persist(&self, jobs: &[JobRecord]) -> Result<(), QueueError> {
        let rows: Vec<_> = jobs.iter().map(JobRecord::to_row).collect();
        job_repo::replace_all(&self.db, &rows).map_err(|e| {
            log::error!("Failed to persist job set: {}", e);
            QueueError::Storage(e)
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<JobRecord>> {
        match self.jobs.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<JobRecord>> {
        match self.jobs.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

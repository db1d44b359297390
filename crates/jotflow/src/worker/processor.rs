//! The processor loop: the single active worker.
//!
//! Exactly one analysis is in flight at any time; this is the
//! rate-limiting discipline required by the upstream AI provider. The loop
//! pulls the oldest eligible job, invokes the analyzer, relays progress
//! callbacks into queue updates and commits the terminal outcome. Analyzer
//! failures are absorbed into job state and never terminate the loop.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::analysis::{AnalysisFailure, Analyzer, ProgressSink};
use crate::error::QueueError;
use crate::queue::{JobId, JobQueue, JobRecord};

/// Handle to the spawned processor loop.
pub struct Processor {
    queue: Arc<JobQueue>,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// State shared between the loop and the handle: which job is in flight,
/// and how to cancel it.
#[derive(Default)]
struct Shared {
    active: Mutex<Option<ActiveJob>>,
}

struct ActiveJob {
    id: JobId,
    cancel: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Active-job lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

enum Outcome {
    Finished(Result<crate::analysis::AnalysisResult, AnalysisFailure>),
    Cancelled,
    Shutdown,
}

impl Processor {
    /// Spawns the processor loop on the current tokio runtime.
    ///
    /// Run queue recovery (`JobQueue::load`) before calling this.
    pub fn spawn(
        queue: Arc<JobQueue>,
        analyzer: Arc<dyn Analyzer>,
        idle_poll: Duration,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            Arc::clone(&queue),
            analyzer,
            Arc::clone(&shared),
            shutdown_rx,
            idle_poll,
        ));

        Self {
            queue,
            shared,
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Discards a job. For the in-flight job this cancels the analysis;
    /// the loop then commits `error` with the distinguished cancelled
    /// message and removes the record. Any other job is removed directly.
    ///
    /// Returns whether a job was found.
    pub fn dismiss(&self, id: &JobId) -> Result<bool, QueueError> {
        {
            let active = self.shared.lock();
            if let Some(active_job) = active.as_ref() {
                if &active_job.id == id {
                    info!("Cancelling in-flight job {}", id);
                    let _ = active_job.cancel.send(true);
                    return Ok(true);
                }
            }
        }
        self.queue.remove(id)
    }

    /// Signals the loop to stop. An in-flight analysis is abandoned
    /// without a terminal transition; startup recovery requeues it.
    pub fn shutdown(&self) {
        info!("Shutting down processor...");
        let _ = self.shutdown.send(true);
    }

    /// Waits for the loop to finish.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!("Processor task panicked: {:?}", e);
        }
    }
}

/// Bridges analyzer progress callbacks into queue updates.
struct QueueProgress {
    queue: Arc<JobQueue>,
    id: JobId,
}

impl ProgressSink for QueueProgress {
    fn report(&self, percent: u8, step: &str) {
        if let Err(e) = self.queue.apply_progress(&self.id, percent, step) {
            warn!("Dropping progress callback for job {}: {}", self.id, e);
        }
    }
}

async fn run(
    queue: Arc<JobQueue>,
    analyzer: Arc<dyn Analyzer>,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
    idle_poll: Duration,
) {
    let mut events = queue.events().subscribe();
    info!("Processor loop started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match queue.next_eligible() {
            Some(job) => {
                process_one(&queue, analyzer.as_ref(), &shared, &mut shutdown_rx, job).await;
            }
            None => {
                // Idle wait: a new submission or retry shows up on the
                // event channel; the poll interval bounds the wait either
                // way so the loop never busy-spins.
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    recv = events.recv() => {
                        if let Err(RecvError::Closed) = recv {
                            tokio::time::sleep(idle_poll).await;
                        }
                    }
                    _ = tokio::time::sleep(idle_poll) => {}
                }
            }
        }
    }

    info!("Processor loop stopped");
}

async fn process_one(
    queue: &Arc<JobQueue>,
    analyzer: &dyn Analyzer,
    shared: &Shared,
    shutdown_rx: &mut watch::Receiver<bool>,
    job: JobRecord,
) {
    let id = job.id.clone();
    if let Err(e) = queue.mark_processing(&id) {
        // Removed or raced since next_eligible; skip it.
        warn!("Skipping job {}: {}", id, e);
        return;
    }
    debug!("Analysis started for job {} ({})", id, job.kind);

    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    *shared.lock() = Some(ActiveJob {
        id: id.clone(),
        cancel: cancel_tx,
    });

    let sink = QueueProgress {
        queue: Arc::clone(queue),
        id: id.clone(),
    };

    let outcome = tokio::select! {
        res = analyzer.analyze(job.kind, &job.input, &job.attachments, &sink) => {
            Outcome::Finished(res)
        }
        _ = cancel_rx.changed() => Outcome::Cancelled,
        _ = shutdown_rx.changed() => Outcome::Shutdown,
    };

    *shared.lock() = None;

    match outcome {
        Outcome::Finished(Ok(result)) => {
            info!("Analysis complete for job {}", id);
            if let Err(e) = queue.mark_complete(&id, result) {
                warn!("Could not commit result for job {}: {}", id, e);
            }
        }
        Outcome::Finished(Err(failure)) => {
            warn!("Analysis failed for job {}: {}", id, failure);
            if let Err(e) = queue.mark_error(&id, &failure.to_string()) {
                warn!("Could not commit failure for job {}: {}", id, e);
            }
        }
        Outcome::Cancelled => {
            info!("Analysis cancelled for job {}, removing it", id);
            if let Err(e) = queue.mark_error(&id, &AnalysisFailure::Cancelled.to_string()) {
                warn!("Could not commit cancellation for job {}: {}", id, e);
            }
            if let Err(e) = queue.remove(&id) {
                warn!("Could not remove cancelled job {}: {}", id, e);
            }
        }
        Outcome::Shutdown => {
            // Left as `processing` on purpose: recovery resets it to
            // `queued` with its original submission order on next start.
            info!("Shutdown during analysis of job {}; it will be requeued", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisResult, AttachmentRef, JobKind};
    use crate::broadcast::{JobEvent, JobEventBroadcaster};
    use crate::db::Database;
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    struct ScriptedAnalyzer;

    #[async_trait]
    impl Analyzer for ScriptedAnalyzer {
        async fn analyze(
            &self,
            _kind: JobKind,
            input: &str,
            _attachments: &[AttachmentRef],
            progress: &dyn ProgressSink,
        ) -> Result<AnalysisResult, AnalysisFailure> {
            if input.contains("fail") {
                return Err(AnalysisFailure::Failed("rate limit exceeded".into()));
            }
            progress.report(30, "Extracting entities");
            progress.report(60, "Finding relationships");
            progress.report(100, "Summarizing");
            Ok(AnalysisResult(serde_json::json!({"summary": "ok"})))
        }
    }

    /// Never resolves; used to hold a job in flight.
    struct StallingAnalyzer;

    #[async_trait]
    impl Analyzer for StallingAnalyzer {
        async fn analyze(
            &self,
            _kind: JobKind,
            _input: &str,
            _attachments: &[AttachmentRef],
            progress: &dyn ProgressSink,
        ) -> Result<AnalysisResult, AnalysisFailure> {
            progress.report(10, "Extracting entities");
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn test_queue() -> Arc<JobQueue> {
        let db = Database::open_in_memory().expect("open in-memory DB");
        Arc::new(JobQueue::load(db, JobEventBroadcaster::new(64)).unwrap())
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<JobEvent>, pred: F) -> JobEvent
    where
        F: Fn(&JobEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_processes_job_to_completion() {
        let queue = test_queue();
        let mut rx = queue.events().subscribe();
        let processor = Processor::spawn(
            Arc::clone(&queue),
            Arc::new(ScriptedAnalyzer),
            Duration::from_millis(20),
        );

        let id = queue.submit(JobKind::Note, "Meeting notes", vec![]).unwrap();
        let event = wait_for(&mut rx, |e| {
            matches!(e, JobEvent::Completed(_)) && e.job().id == id
        })
        .await;

        let job = event.job();
        assert_eq!(job.progress(), Some(100));
        assert_eq!(job.steps.len(), 3);
        assert!(job.result().is_some());

        processor.shutdown();
        processor.wait().await;
    }

    #[tokio::test]
    async fn test_failure_absorbed_loop_continues() {
        let queue = test_queue();
        let mut rx = queue.events().subscribe();
        let processor = Processor::spawn(
            Arc::clone(&queue),
            Arc::new(ScriptedAnalyzer),
            Duration::from_millis(20),
        );

        let bad = queue.submit(JobKind::Note, "please fail", vec![]).unwrap();
        let good = queue.submit(JobKind::Note, "fine", vec![]).unwrap();

        let event = wait_for(&mut rx, |e| {
            matches!(e, JobEvent::Completed(_)) && e.job().id == bad
        })
        .await;
        assert_eq!(
            event.job().error_message(),
            Some("analysis failed: rate limit exceeded")
        );

        // The loop survived and drives the next job.
        let event = wait_for(&mut rx, |e| {
            matches!(e, JobEvent::Completed(_)) && e.job().id == good
        })
        .await;
        assert!(event.job().result().is_some());

        processor.shutdown();
        processor.wait().await;
    }

    #[tokio::test]
    async fn test_dismiss_in_flight_cancels_and_removes() {
        let queue = test_queue();
        let mut rx = queue.events().subscribe();
        let processor = Processor::spawn(
            Arc::clone(&queue),
            Arc::new(StallingAnalyzer),
            Duration::from_millis(20),
        );

        let id = queue.submit(JobKind::Note, "stuck", vec![]).unwrap();
        wait_for(&mut rx, |e| e.job().id == id && e.job().is_processing()).await;

        assert!(processor.dismiss(&id).unwrap());

        let event = wait_for(&mut rx, |e| {
            matches!(e, JobEvent::Completed(_)) && e.job().id == id
        })
        .await;
        assert_eq!(event.job().error_message(), Some("analysis cancelled"));

        wait_for(&mut rx, |e| {
            matches!(e, JobEvent::Removed(_)) && e.job().id == id
        })
        .await;
        assert!(queue.get(&id).is_none());

        processor.shutdown();
        processor.wait().await;
    }

    #[tokio::test]
    async fn test_dismiss_queued_job_removes_directly() {
        let queue = test_queue();
        let mut rx = queue.events().subscribe();
        let processor = Processor::spawn(
            Arc::clone(&queue),
            Arc::new(StallingAnalyzer),
            Duration::from_millis(20),
        );

        let stuck = queue.submit(JobKind::Note, "stuck", vec![]).unwrap();
        wait_for(&mut rx, |e| e.job().id == stuck && e.job().is_processing()).await;

        let waiting = queue.submit(JobKind::Note, "waiting", vec![]).unwrap();
        assert!(processor.dismiss(&waiting).unwrap());
        assert!(queue.get(&waiting).is_none());
        // The in-flight job is untouched.
        assert!(queue.get(&stuck).unwrap().is_processing());

        processor.shutdown();
        processor.wait().await;
    }

    #[tokio::test]
    async fn test_dismiss_unknown_job() {
        let queue = test_queue();
        let processor = Processor::spawn(
            Arc::clone(&queue),
            Arc::new(ScriptedAnalyzer),
            Duration::from_millis(20),
        );

        let id = queue.submit(JobKind::Note, "gone", vec![]).unwrap();
        queue.remove(&id).unwrap();
        assert!(!processor.dismiss(&id).unwrap());

        processor.shutdown();
        processor.wait().await;
    }
}

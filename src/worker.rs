//! Background worker.
//!
//! The orchestrator moves onto a dedicated thread. Jobs arrive over one
//! channel and run strictly one at a time, so at most one mutation per
//! identifier class is ever in flight. Status, progress and results flow
//! back over a second channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{IdError, Result, StructuredError};
use crate::mutator::{IdentifierClass, MutationOptions, SpoofMode};
use crate::orchestrator::{BatchProgress, BatchSummary, Orchestrator, RestoreSummary};
use crate::revert::RevertState;
use crate::storage::BackupRecord;

/// Cooperative cancellation flag, polled between steps.
///
/// A step that has started writing a live resource always runs to
/// completion and is journaled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    Mutate {
        classes: Vec<IdentifierClass>,
        options: MutationOptions,
    },
    RestoreAll,
    Backup {
        verify: bool,
    },
    SetMode {
        mode: SpoofMode,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobResult {
    Batch(BatchSummary),
    Restore(RestoreSummary),
    Backup(BackupRecord),
    Mode(RevertState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Status {
        job_id: u64,
        message: String,
    },
    Progress {
        job_id: u64,
        percent: u8,
    },
    Completed {
        job_id: u64,
        result: std::result::Result<JobResult, StructuredError>,
    },
}

pub struct Worker {
    jobs: Option<Sender<(u64, Job)>>,
    events: Receiver<WorkerEvent>,
    cancel: CancelToken,
    handle: Option<JoinHandle<Orchestrator>>,
    next_id: u64,
}

impl Worker {
    pub fn spawn(orchestrator: Orchestrator) -> Result<Self> {
        let (job_tx, job_rx) = unbounded::<(u64, Job)>();
        let (event_tx, event_rx) = unbounded();
        let cancel = CancelToken::new();
        let token = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("idswap-worker".to_string())
            .spawn(move || run(orchestrator, &job_rx, &event_tx, &token))?;

        Ok(Self {
            jobs: Some(job_tx),
            events: event_rx,
            cancel,
            handle: Some(handle),
            next_id: 1,
        })
    }

    /// Queue a job; returns its id.
    pub fn submit(&mut self, job: Job) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        self.jobs
            .as_ref()
            .ok_or_else(|| IdError::Cancelled("worker is shutting down".to_string()))?
            .send((id, job))
            .map_err(|_| IdError::Cancelled("worker thread has stopped".to_string()))?;
        Ok(id)
    }

    pub const fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    /// Block until job `id` completes, forwarding other events to `on_event`.
    pub fn wait(
        &self,
        id: u64,
        on_event: &mut dyn FnMut(&WorkerEvent),
    ) -> Result<std::result::Result<JobResult, StructuredError>> {
        loop {
            let event = self
                .events
                .recv()
                .map_err(|_| IdError::Cancelled("worker thread has stopped".to_string()))?;
            on_event(&event);
            if let WorkerEvent::Completed { job_id, result } = event {
                if job_id == id {
                    return Ok(result);
                }
            }
        }
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Ask the running job to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Finish queued jobs, stop the thread and hand the orchestrator back.
    pub fn join(mut self) -> Result<Orchestrator> {
        self.jobs.take();
        let handle = self
            .handle
            .take()
            .ok_or_else(|| IdError::Cancelled("worker already joined".to_string()))?;
        handle
            .join()
            .map_err(|_| IdError::Cancelled("worker thread panicked".to_string()))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

fn run(
    mut orchestrator: Orchestrator,
    jobs: &Receiver<(u64, Job)>,
    events: &Sender<WorkerEvent>,
    cancel: &CancelToken,
) -> Orchestrator {
    for (job_id, job) in jobs {
        debug!(job_id, ?job, "job started");
        let result = execute(&mut orchestrator, job_id, job, events, cancel);
        cancel.reset();
        // The receiver may be gone; the orchestrator still owns the outcome.
        let _ = events.send(WorkerEvent::Completed {
            job_id,
            result: result.map_err(|err| err.to_structured()),
        });
    }
    debug!("job channel closed; worker exiting");
    orchestrator
}

fn execute(
    orchestrator: &mut Orchestrator,
    job_id: u64,
    job: Job,
    events: &Sender<WorkerEvent>,
    cancel: &CancelToken,
) -> Result<JobResult> {
    let status = |message: String| {
        let _ = events.send(WorkerEvent::Status { job_id, message });
    };
    let progress = |percent: u8| {
        let _ = events.send(WorkerEvent::Progress { job_id, percent });
    };

    match job {
        Job::Mutate { classes, options } => {
            let summary = orchestrator.mutate_batch(
                &classes,
                &options,
                &mut |event| match event {
                    BatchProgress::Started { total, class, index } => {
                        status(format!("[{}/{total}] {class}", index + 1));
                    }
                    BatchProgress::Finished {
                        index,
                        total,
                        outcome,
                    } => {
                        status(format!("{}: {}", outcome.item, outcome.message));
                        progress(percent(index + 1, total));
                    }
                },
                cancel,
            );
            Ok(JobResult::Batch(summary))
        }
        Job::RestoreAll => {
            status("restoring originals".to_string());
            orchestrator.restore_all().map(JobResult::Restore)
        }
        Job::Backup { verify } => {
            status("backing up journal".to_string());
            orchestrator
                .create_backup(verify, &mut |p| progress(p))
                .map(JobResult::Backup)
        }
        Job::SetMode { mode } => orchestrator.set_mode(mode).map(JobResult::Mode),
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(done.saturating_mul(100) / total).unwrap_or(100)
}

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use fragstream_common::{EventList, JobId};
use serde::{Deserialize, Serialize};

use crate::error::ConversionError;
use crate::pipeline::{self, Interrupted, RunError};
use crate::runtime::RuntimeLocator;

/// Pipeline stage a progress value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Parsing,
    GeometryExtraction,
    PropertyExtraction,
    Serialization,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Parsing => "parsing",
            Self::GeometryExtraction => "geometry extraction",
            Self::PropertyExtraction => "property extraction",
            Self::Serialization => "serialization",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: Stage,
    /// Fraction of the whole run in `[0, 1]`.
    pub value: f32,
}

impl Progress {
    pub fn new(stage: Stage, value: f32) -> Self {
        Self { stage, value }
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Vec<u8>),
    Failed(ConversionError),
    Cancelled,
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

pub type ProgressCallback = Box<dyn FnMut(&Progress) + Send>;

#[derive(Default)]
pub struct ConvertOptions {
    /// Called from `poll`/`wait` on the caller's thread.
    pub progress_callback: Option<ProgressCallback>,
    pub runtime: RuntimeLocator,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    done: AtomicBool,
}

/// Shared cancellation flag of one job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<TokenState>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// The job has stopped working: its thread exited or its outcome was
    /// delivered. Cancelling a done job changes nothing on the worker side.
    pub fn is_done(&self) -> bool {
        self.0.done.load(Ordering::SeqCst)
    }

    fn mark_done(&self) {
        self.0.done.store(true, Ordering::SeqCst);
    }
}

enum JobEvent {
    Progress(Progress),
    Done(Result<Vec<u8>, ConversionError>),
    Interrupted,
}

/// Starts conversion jobs.
pub struct Converter;

impl Converter {
    /// Start converting `bytes` on a background thread.
    pub fn convert(bytes: Vec<u8>, options: ConvertOptions) -> ConversionJob {
        let id = JobId::new();
        let token = CancelToken::default();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut job = ConversionJob {
            id,
            token: token.clone(),
            events: rx,
            callback: options.progress_callback,
            progress: None,
            outcome: None,
            on_finished: EventList::new(),
        };

        let runtime = options.runtime;
        let spawned = std::thread::Builder::new()
            .name(format!("fragstream-convert-{id}"))
            .spawn(move || {
                let _span = tracing::info_span!("convert", job = %id).entered();
                let result = pipeline::run(&bytes, &runtime, &mut |progress| {
                    if token.is_cancelled() {
                        return Err(Interrupted);
                    }
                    let _ = tx.send(JobEvent::Progress(progress));
                    Ok(())
                });
                let event = match result {
                    Ok(payload) => JobEvent::Done(Ok(payload)),
                    Err(RunError::Failed(e)) => {
                        tracing::warn!(error = %e, "conversion failed");
                        JobEvent::Done(Err(e))
                    }
                    Err(RunError::Interrupted) => {
                        tracing::debug!("conversion interrupted");
                        JobEvent::Interrupted
                    }
                };
                let _ = tx.send(event);
                token.mark_done();
            });

        if let Err(e) = spawned {
            job.finish(JobOutcome::Failed(ConversionError::Runtime(format!(
                "cannot start conversion thread: {e}"
            ))));
        }
        job
    }
}

/// Handle to a running conversion.
///
/// Progress and the terminal outcome are delivered only from [`poll`] and
/// [`wait`], on whichever thread owns the job.
///
/// [`poll`]: ConversionJob::poll
/// [`wait`]: ConversionJob::wait
pub struct ConversionJob {
    id: JobId,
    token: CancelToken,
    events: Receiver<JobEvent>,
    callback: Option<ProgressCallback>,
    progress: Option<Progress>,
    outcome: Option<JobOutcome>,
    on_finished: EventList<JobOutcome>,
}

impl fmt::Debug for ConversionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionJob")
            .field("id", &self.id)
            .field("progress", &self.progress)
            .field("finished", &self.outcome.is_some())
            .finish()
    }
}

const WAIT_SLICE: Duration = Duration::from_millis(50);

impl ConversionJob {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Last progress delivered.
    pub fn progress(&self) -> Option<Progress> {
        self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    /// Token that cancels this job from elsewhere. The cancellation is
    /// observed by the next `poll`/`wait`.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Observers of the terminal outcome. Fires once; listeners added after
    /// the job finished are never called.
    pub fn on_finished(&mut self) -> &mut EventList<JobOutcome> {
        &mut self.on_finished
    }

    /// Stop the job. No-op once finished; otherwise the job is `Cancelled`
    /// when this returns, and no further progress is delivered.
    pub fn cancel(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        self.token.cancel();
        self.finish(JobOutcome::Cancelled);
    }

    /// Deliver whatever the worker has produced so far without blocking.
    pub fn poll(&mut self) -> Option<&JobOutcome> {
        while self.outcome.is_none() {
            if self.token.is_cancelled() {
                self.finish(JobOutcome::Cancelled);
                break;
            }
            match self.events.try_recv() {
                Ok(event) => self.handle(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.worker_lost(),
            }
        }
        self.outcome.as_ref()
    }

    /// Block until the job reaches its terminal outcome.
    pub fn wait(&mut self) -> &JobOutcome {
        while self.outcome.is_none() {
            if self.token.is_cancelled() {
                self.finish(JobOutcome::Cancelled);
                break;
            }
            match self.events.recv_timeout(WAIT_SLICE) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.worker_lost(),
            }
        }
        self.outcome.get_or_insert(JobOutcome::Cancelled)
    }

    /// Move the output bytes out of a completed job.
    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        match &mut self.outcome {
            Some(JobOutcome::Completed(bytes)) => Some(std::mem::take(bytes)),
            _ => None,
        }
    }

    fn handle(&mut self, event: JobEvent) {
        match event {
            JobEvent::Progress(progress) => {
                if self.progress.is_some_and(|last| progress.value < last.value) {
                    return;
                }
                self.progress = Some(progress);
                if let Some(callback) = self.callback.as_mut() {
                    callback(&progress);
                }
            }
            JobEvent::Done(Ok(payload)) => self.finish(JobOutcome::Completed(payload)),
            JobEvent::Done(Err(e)) => self.finish(JobOutcome::Failed(e)),
            JobEvent::Interrupted => self.finish(JobOutcome::Cancelled),
        }
    }

    fn worker_lost(&mut self) {
        self.finish(JobOutcome::Failed(ConversionError::Runtime(
            "conversion thread stopped without a result".into(),
        )));
    }

    fn finish(&mut self, outcome: JobOutcome) {
        if self.outcome.is_some() {
            return;
        }
        tracing::debug!(job = %self.id, completed = outcome.is_completed(), "conversion job finished");
        self.token.mark_done();
        self.callback = None;
        self.on_finished.dispatch(&outcome);
        self.outcome = Some(outcome);
    }
}

impl Drop for ConversionJob {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            self.token.cancel();
        }
    }
}

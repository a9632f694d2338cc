//! Single-slot background executor.
//!
//! A [`TaskScheduler`] holds at most one unit of work. The work runs on a
//! one-thread worker pool and talks back through a channel: any number of
//! progress strings followed by exactly one terminal outcome. Nothing is
//! delivered until the reporting side calls [`TaskScheduler::pump`] (or
//! [`TaskScheduler::wait`]), so callbacks always run on the caller's thread
//! and never on the worker.
//!
//! There is no cancellation. Once submitted, a task runs until it returns or
//! panics; while it does, further submissions are rejected with
//! [`ErrorCode::Busy`](crate::error::ErrorCode::Busy), not queued.

use crate::error::{ErrorCode, ExternalToolError, PipelineError};
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    backtrace::Backtrace,
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

pub type TaskId = u64;

const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Progress capability handed to a running unit of work.
#[derive(Clone)]
pub struct Progress {
    emit: Arc<dyn Fn(String) + Send + Sync>,
}

impl Progress {
    pub fn new(emit: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&self, message: impl Into<String>) {
        (self.emit)(message.into())
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Progress")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

/// A fault raised by a unit of work, captured at the scheduler boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: ErrorCode,
    /// Innermost cause, one line.
    pub condition: String,
    /// Full error chain, for display.
    pub message: String,
    pub trace: String,
}

impl TaskFailure {
    fn from_error(err: &anyhow::Error) -> Self {
        let code = err
            .chain()
            .find_map(|cause| {
                if let Some(e) = cause.downcast_ref::<PipelineError>() {
                    Some(e.code)
                } else if cause.downcast_ref::<ExternalToolError>().is_some() {
                    Some(ErrorCode::ExternalTool)
                } else if cause.downcast_ref::<std::io::Error>().is_some() {
                    Some(ErrorCode::Io)
                } else {
                    None
                }
            })
            .unwrap_or(ErrorCode::ExternalTool);
        Self {
            code,
            condition: err.root_cause().to_string(),
            message: format!("{err:#}"),
            trace: format!("{err:?}"),
        }
    }

    fn from_panic(label: &str, payload: Box<dyn Any + Send>) -> Self {
        let condition = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            code: ErrorCode::Internal,
            message: format!("task '{label}' panicked: {condition}"),
            condition,
            trace: Backtrace::force_capture().to_string(),
        }
    }
}

impl From<PipelineError> for TaskFailure {
    fn from(err: PipelineError) -> Self {
        Self {
            code: err.code,
            condition: err.message.clone(),
            message: err.to_string(),
            trace: String::new(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for TaskFailure {}

pub type TaskOutcome<T> = Result<T, TaskFailure>;

enum TaskEvent<T> {
    Progress(String),
    Done(TaskOutcome<T>),
}

struct Callbacks<T> {
    on_progress: Box<dyn FnMut(&str) + Send>,
    on_done: Box<dyn FnOnce(TaskOutcome<T>) + Send>,
}

struct ActiveTask<T> {
    id: TaskId,
    label: String,
    started: Instant,
    events: Receiver<TaskEvent<T>>,
    // events already pulled off the channel by `wait`
    pending: VecDeque<TaskEvent<T>>,
    // taken out while `pump` runs them
    callbacks: Option<Callbacks<T>>,
}

struct Inner<T> {
    slot: Mutex<Option<ActiveTask<T>>>,
    pumping: Mutex<()>,
    pool: rayon::ThreadPool,
    next_id: AtomicU64,
}

pub struct TaskScheduler<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TaskScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> TaskScheduler<T> {
    pub fn new() -> Result<Self, PipelineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|i| format!("snpgenie-stage-{i}"))
            .build()
            .map_err(|e| PipelineError::internal(format!("Could not start worker pool: {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                pumping: Mutex::new(()),
                pool,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<ActiveTask<T>>> {
        match self.inner.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.lock_slot().is_some() {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    pub fn active_label(&self) -> Option<String> {
        self.lock_slot().as_ref().map(|task| task.label.clone())
    }

    /// Starts `work` unless another task holds the slot.
    ///
    /// `on_progress` and `on_done` are invoked from [`pump`](Self::pump);
    /// `on_done` exactly once, after the slot has been released, so it may
    /// submit the next task.
    pub fn submit<W, P, D>(
        &self,
        label: &str,
        work: W,
        on_progress: P,
        on_done: D,
    ) -> Result<TaskId, PipelineError>
    where
        W: FnOnce(&Progress) -> anyhow::Result<T> + Send + 'static,
        P: FnMut(&str) + Send + 'static,
        D: FnOnce(TaskOutcome<T>) + Send + 'static,
    {
        let mut slot = self.lock_slot();
        if let Some(active) = slot.as_ref() {
            warn!(
                "Rejected '{label}': task {} '{}' is still running",
                active.id, active.label
            );
            return Err(PipelineError::busy(format!(
                "'{}' is already running",
                active.label
            )));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = unbounded::<TaskEvent<T>>();
        *slot = Some(ActiveTask {
            id,
            label: label.to_string(),
            started: Instant::now(),
            events: rx,
            pending: VecDeque::new(),
            callbacks: Some(Callbacks {
                on_progress: Box::new(on_progress),
                on_done: Box::new(on_done),
            }),
        });
        drop(slot);

        info!("Task {id} '{label}' started");
        let progress_tx = tx.clone();
        let progress = Progress::new(move |message| {
            let _ = progress_tx.send(TaskEvent::Progress(message));
        });
        let label = label.to_string();
        self.inner.pool.spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(&progress))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(TaskFailure::from_error(&err)),
                Err(payload) => Err(TaskFailure::from_panic(&label, payload)),
            };
            let _ = tx.send(TaskEvent::Done(outcome));
        });
        Ok(id)
    }

    /// Delivers every event that has arrived so far; returns how many.
    ///
    /// Never blocks on the worker. Re-entrant calls (from inside a callback)
    /// return 0.
    pub fn pump(&self) -> usize {
        let Ok(_pumping) = self.inner.pumping.try_lock() else {
            return 0;
        };

        let (id, mut events, mut callbacks) = {
            let mut slot = self.lock_slot();
            let Some(active) = slot.as_mut() else {
                return 0;
            };
            let mut events: VecDeque<TaskEvent<T>> = active.pending.drain(..).collect();
            events.extend(active.events.try_iter());
            (active.id, events, active.callbacks.take())
        };
        let Some(cbs) = callbacks.as_mut() else {
            return 0;
        };

        let mut delivered = 0;
        let mut finished = None;
        while let Some(event) = events.pop_front() {
            match event {
                TaskEvent::Progress(message) => {
                    (cbs.on_progress)(&message);
                    delivered += 1;
                }
                TaskEvent::Done(outcome) => {
                    finished = Some(outcome);
                    break;
                }
            }
        }

        match finished {
            Some(outcome) => {
                let task = self.lock_slot().take();
                if let Some(task) = task {
                    let elapsed = task.started.elapsed().as_millis();
                    match &outcome {
                        Ok(_) => info!("Task {id} '{}' finished in {elapsed} ms", task.label),
                        Err(failure) => warn!(
                            "Task {id} '{}' failed after {elapsed} ms: {}",
                            task.label, failure.message
                        ),
                    }
                }
                delivered += 1;
                if let Some(cbs) = callbacks.take() {
                    (cbs.on_done)(outcome);
                }
            }
            None => {
                let mut slot = self.lock_slot();
                if let Some(active) = slot.as_mut().filter(|active| active.id == id) {
                    active.callbacks = callbacks;
                }
            }
        }
        delivered
    }

    /// Pumps until the scheduler is idle or `timeout` expires; returns
    /// whether it is idle. Tasks submitted from an `on_done` callback are
    /// waited for too.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.pump();
            let (id, events) = {
                let slot = self.lock_slot();
                match slot.as_ref() {
                    None => return true,
                    Some(active) => (active.id, active.events.clone()),
                }
            };
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            let received = match events.recv_timeout(slice) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Task {id} channel closed without a terminal event");
                    TaskEvent::Done(Err(TaskFailure::from(PipelineError::internal(
                        "worker exited without reporting an outcome",
                    ))))
                }
            };
            let mut slot = self.lock_slot();
            if let Some(active) = slot.as_mut().filter(|active| active.id == id) {
                active.pending.push_back(received);
            }
        }
    }
}

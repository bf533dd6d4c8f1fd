// eval/jobs.rs — adapter over the parallel job substrate
//
// Nodes never create threads. They hand closures to a `JobSystem` and poll
// the returned `JobHandle`. Three substrates ship with the crate:
//
//   RayonJobs    — dedicated rayon pool (default)
//   InlineJobs   — runs each job on the dispatching thread
//   DeferredJobs — queues jobs until `run_pending` is called
//
// A handle can always be completed from the waiting side: if no worker has
// started the job yet, `complete()` claims it and runs it on the caller's
// thread, so a blocking wait never depends on a free worker.

use crate::error::{EngineError, Result};
use log::warn;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Unit of work the substrate runs once.
pub trait Task: Send + Sync {
    fn run(&self);
}

pub trait JobSystem: Send + Sync {
    fn dispatch(&self, task: Arc<dyn Task>);
}

// ── Job slot ────────────────────────────────────────────────────────

type Work<T> = Box<dyn FnOnce() -> T + Send>;

enum SlotState<T> {
    Pending(Work<T>),
    Running,
    /// `None` when the job panicked or the result was already taken.
    Finished(Option<T>),
}

struct JobSlot<T> {
    state: Mutex<SlotState<T>>,
    done: Condvar,
}

impl<T> JobSlot<T> {
    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim and run the job if nobody has yet. Returns whether this call ran it.
    fn try_run(&self) -> bool {
        let work = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, SlotState::Running) {
                SlotState::Pending(work) => work,
                other => {
                    *state = other;
                    return false;
                }
            }
        };
        let result = match catch_unwind(AssertUnwindSafe(work)) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("job panicked; its result is dropped");
                None
            }
        };
        *self.lock() = SlotState::Finished(result);
        self.done.notify_all();
        true
    }
}

impl<T: Send> Task for JobSlot<T> {
    fn run(&self) {
        self.try_run();
    }
}

/// Handle to a scheduled job.
pub struct JobHandle<T> {
    slot: Arc<JobSlot<T>>,
}

impl<T> Clone for JobHandle<T> {
    fn clone(&self) -> Self {
        JobHandle {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Send + 'static> JobHandle<T> {
    pub fn is_finished(&self) -> bool {
        matches!(*self.slot.lock(), SlotState::Finished(_))
    }

    /// Block until the job has finished, running it here if it never started.
    pub fn complete(&self) {
        if self.slot.try_run() {
            return;
        }
        let mut state = self.slot.lock();
        while !matches!(*state, SlotState::Finished(_)) {
            state = self
                .slot
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Move the result out. `None` if the job is unfinished, panicked or was
    /// already taken.
    pub fn take(&self) -> Option<T> {
        match &mut *self.slot.lock() {
            SlotState::Finished(result) => result.take(),
            _ => None,
        }
    }

    /// Like [`take`](Self::take) but as an error for the node boundary.
    pub fn take_result(&self, what: &str) -> Result<T> {
        self.take()
            .ok_or_else(|| EngineError::JobFailed(what.to_string()))
    }
}

/// Schedule `f` on `jobs`.
pub fn schedule<T, F>(jobs: &dyn JobSystem, f: F) -> JobHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let slot = Arc::new(JobSlot {
        state: Mutex::new(SlotState::Pending(Box::new(f))),
        done: Condvar::new(),
    });
    jobs.dispatch(slot.clone());
    JobHandle { slot }
}

// ── Substrates ──────────────────────────────────────────────────────

pub struct RayonJobs {
    pool: rayon::ThreadPool,
}

impl RayonJobs {
    /// `threads == 0` lets rayon pick the number of workers.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("terraforge-job-{i}"))
            .build()
            .map_err(|e| EngineError::JobSubstrate(e.to_string()))?;
        Ok(RayonJobs { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl JobSystem for RayonJobs {
    fn dispatch(&self, task: Arc<dyn Task>) {
        self.pool.spawn(move || task.run());
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InlineJobs;

impl JobSystem for InlineJobs {
    fn dispatch(&self, task: Arc<dyn Task>) {
        task.run();
    }
}

/// Queues every job until `run_pending` pumps them.
#[derive(Default)]
pub struct DeferredJobs {
    queue: Mutex<Vec<Arc<dyn Task>>>,
}

impl DeferredJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Run every queued job in dispatch order. Returns how many were run.
    pub fn run_pending(&self) -> usize {
        let tasks = std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner));
        let n = tasks.len();
        for task in tasks {
            task.run();
        }
        n
    }
}

impl JobSystem for DeferredJobs {
    fn dispatch(&self, task: Arc<dyn Task>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_jobs_finish_immediately() {
        let job = schedule(&InlineJobs, || 2 + 2);
        assert!(job.is_finished());
        assert_eq!(job.take(), Some(4));
        assert_eq!(job.take(), None);
    }

    #[test]
    fn deferred_jobs_wait_for_pump() {
        let jobs = DeferredJobs::new();
        let job = schedule(&jobs, || "done");
        assert!(!job.is_finished());
        assert_eq!(jobs.pending(), 1);
        assert_eq!(jobs.run_pending(), 1);
        assert!(job.is_finished());
        assert_eq!(job.take(), Some("done"));
    }

    #[test]
    fn complete_runs_unstarted_job_on_caller() {
        let jobs = DeferredJobs::new();
        let job = schedule(&jobs, || 11);
        job.complete();
        assert_eq!(job.take(), Some(11));
        // the queued task finds the slot finished and does nothing
        jobs.run_pending();
        assert_eq!(job.take(), None);
    }

    #[test]
    fn panicking_job_yields_job_failed() {
        let job = schedule::<u32, _>(&InlineJobs, || panic!("boom"));
        assert!(job.is_finished());
        let err = job.take_result("noise").unwrap_err();
        assert!(matches!(err, EngineError::JobFailed(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn rayon_jobs_complete_blocks_until_done() {
        let jobs = RayonJobs::new(2).unwrap();
        let handles: Vec<JobHandle<usize>> =
            (0..16).map(|i| schedule(&jobs, move || i * i)).collect();
        let sum: usize = handles
            .iter()
            .map(|h| {
                h.complete();
                h.take().unwrap()
            })
            .sum();
        assert_eq!(sum, (0..16).map(|i| i * i).sum::<usize>());
    }
}

// eval/token.rs — tree-wide completion token
//
// One token per tree, shared by every branch. Before completion, nodes poll
// their jobs and yield when unfinished. Once the token is completed (a
// deadline passed, or the caller needs the result now) every poll turns into
// a blocking wait so the rest of the evaluation finishes synchronously.

use crate::eval::jobs::JobHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct CompletionToken {
    complete: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

impl CompletionToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the callback fired on completion. Replaces any earlier one.
    /// Registering on an already completed token fires it immediately.
    pub fn on_complete<F: FnOnce() + Send + 'static>(&self, f: F) {
        let mut slot = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        if self.complete.load(Ordering::Acquire) {
            drop(slot);
            f();
            return;
        }
        *slot = Some(Box::new(f));
    }

    /// Force completion. Only the first call has any effect.
    pub fn complete(&self) {
        // The callback lock orders this against a concurrent `on_complete`.
        let callback = {
            let mut slot = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
            if self.complete.swap(true, Ordering::AcqRel) {
                return;
            }
            slot.take()
        };
        if let Some(f) = callback {
            f();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// `true` when the job has finished. Once the token is complete this
    /// blocks until it has; before that an unfinished job gives `false`.
    pub fn forced_or_finished<T: Send + 'static>(&self, job: &JobHandle<T>) -> bool {
        if job.is_finished() {
            return true;
        }
        if self.is_complete() {
            job.complete();
            return true;
        }
        false
    }
}

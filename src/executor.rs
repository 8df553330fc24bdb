//! Fan-out / fan-in of independent traversal branches.
//!
//! Both traversal directions split work the same way: the children of a node (sequence
//! elements, keyed entries, object properties) are independent and may run concurrently on the
//! rayon pool. The caller always waits for every branch before it assembles its own result, so
//! output order never depends on scheduling.
//!
//! The first failing branch stores its error and raises the abort flag; sibling branches notice
//! the flag at their next node and stop early. [`Executor::finish`] hands back that first error.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use crate::error::{RehydrateError, Result};

/// Shared state of one traversal call.
#[derive(Debug)]
pub struct Executor {
    parallel: bool,
    abort_flag: AtomicBool,
    error_capture: Mutex<Option<RehydrateError>>,
}

impl Executor {
    /// Creates the executor of one call. `parallel = false` runs every branch in order on the
    /// calling thread.
    pub fn new(parallel: bool) -> Self {
        Self {
            parallel,
            abort_flag: AtomicBool::new(false),
            error_capture: Mutex::new(None),
        }
    }

    /// Records `err` if it is the first failure of the call.
    pub fn signal_error(&self, err: &RehydrateError) {
        let mut guard = self.error_capture.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_none() {
            *guard = Some(err.clone());
            self.abort_flag.store(true, Ordering::SeqCst);
        }
    }

    /// Returns true once any branch failed.
    pub fn should_abort(&self) -> bool {
        self.abort_flag.load(Ordering::Relaxed)
    }

    /// Fails fast when a sibling branch already failed.
    pub fn checkpoint(&self) -> Result<()> {
        if self.should_abort() {
            return Err(RehydrateError::Internal("traversal aborted".into()));
        }
        Ok(())
    }

    /// Runs `f` on every item and collects the results in input order.
    pub fn map<T, R, F>(&self, items: &[T], f: F) -> Result<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Result<R> + Sync + Send,
    {
        let run = |item: &T| f(item).inspect_err(|err| self.signal_error(err));
        if self.parallel && items.len() > 1 {
            items.par_iter().map(run).collect()
        } else {
            items.iter().map(run).collect()
        }
    }

    /// Replaces `result` with the first captured error, if any branch failed.
    pub fn finish<R>(&self, result: Result<R>) -> Result<R> {
        let mut guard = self.error_capture.lock().unwrap_or_else(|p| p.into_inner());
        match guard.take() {
            Some(err) => Err(err),
            None => result,
        }
    }
}

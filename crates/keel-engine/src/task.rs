//! Background work off the frame loop.
//!
//! The kernel is single-threaded; the one exception is work the caller
//! explicitly ships to a background thread (file I/O, asset decoding).
//! [`spawn`] returns a [`TaskHandle`] that the frame loop polls, so results
//! come back on the main thread and never touch the registry concurrently.

use std::thread::{self, JoinHandle};

use crate::EngineError;

/// A running or finished background task producing a `T`.
#[derive(Debug)]
pub struct TaskHandle<T> {
    name: String,
    handle: Option<JoinHandle<T>>,
}

/// Run `work` on a new thread called `name`.
///
/// # Errors
///
/// [`EngineError::TaskFailed`] if the thread could not be spawned.
pub fn spawn<T, F>(name: &str, work: F) -> Result<TaskHandle<T>, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(name.to_owned())
        .spawn(work)
        .map_err(|err| EngineError::TaskFailed {
            task: name.to_owned(),
            reason: err.to_string(),
        })?;
    tracing::debug!(task = name, "background task started");
    Ok(TaskHandle {
        name: name.to_owned(),
        handle: Some(handle),
    })
}

impl<T> TaskHandle<T> {
    /// Name of the background thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task has stopped running (or its result was taken).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// The result, if the task is done. Returns `None` while it is still
    /// running and after the result has been taken once.
    pub fn try_take(&mut self) -> Option<Result<T, EngineError>> {
        if !self.handle.as_ref()?.is_finished() {
            return None;
        }
        let handle = self.handle.take()?;
        Some(self.collect(handle))
    }

    /// Block until the task is done.
    ///
    /// # Errors
    ///
    /// [`EngineError::TaskFailed`] if the task panicked or its result was
    /// already taken.
    pub fn join(mut self) -> Result<T, EngineError> {
        match self.handle.take() {
            Some(handle) => self.collect(handle),
            None => Err(EngineError::TaskFailed {
                task: self.name,
                reason: "result already taken".to_owned(),
            }),
        }
    }

    fn collect(&self, handle: JoinHandle<T>) -> Result<T, EngineError> {
        handle.join().map_err(|payload| {
            let reason = payload
                .downcast_ref::<&'static str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panicked".to_owned());
            tracing::error!(task = %self.name, %reason, "background task failed");
            EngineError::TaskFailed {
                task: self.name.clone(),
                reason,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn join_returns_value() {
        let task = spawn("sum", || (1..=10).sum::<u32>()).unwrap();
        assert_eq!(task.name(), "sum");
        assert_eq!(task.join().unwrap(), 55);
    }

    #[test]
    fn try_take_waits_for_completion() {
        let (release, gate) = mpsc::channel::<()>();
        let mut task = spawn("gated", move || {
            gate.recv().ok();
            "done"
        })
        .unwrap();

        assert!(task.try_take().is_none());
        release.send(()).unwrap();
        while !task.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(task.try_take().unwrap().unwrap(), "done");
        assert!(task.try_take().is_none());
        assert!(task.is_finished());
    }

    #[test]
    fn panicking_task_reports_failure() {
        let task = spawn("doomed", || -> u32 { panic!("disk on fire") }).unwrap();
        match task.join() {
            Err(EngineError::TaskFailed { task, reason }) => {
                assert_eq!(task, "doomed");
                assert!(reason.contains("disk on fire"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}

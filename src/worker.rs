//! Named worker threads that take the station down together.
//!
//! Every long-running loop runs inside [`spawn_worker`]. If the body returns an error,
//! the wrapper logs it and raises the shared [`StopSignal`], so one failed thread never
//! leaves its siblings running orphaned.

use crate::error::{StationError, StationResult};
use crate::shutdown::StopSignal;
use std::io;
use std::thread;
use tracing::{debug, error};

/// Handle to a running worker.
#[derive(Debug)]
pub struct Worker<T> {
    name: String,
    handle: thread::JoinHandle<StationResult<T>>,
}

impl<T> Worker<T> {
    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread and return what its body returned.
    pub fn join(self) -> StationResult<T> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(StationError::ThreadPanicked(self.name)),
        }
    }
}

/// Raises the stop signal if the owning thread unwinds.
struct CancelOnPanic(StopSignal);

impl Drop for CancelOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.cancel();
        }
    }
}

/// Spawn a named thread that inherits the current tracing dispatcher.
///
/// An `Err` returned by `body` is logged and cancels `stop`.
pub fn spawn_worker<F, T>(name: &str, stop: &StopSignal, body: F) -> io::Result<Worker<T>>
where
    F: FnOnce() -> StationResult<T> + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    let stop = stop.clone();
    let thread_name = name.to_string();
    let handle = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let _guard = CancelOnPanic(stop.clone());
            tracing::dispatcher::with_default(&dispatch, || {
                debug!(thread = %thread_name, "Worker started");
                let result = body();
                match &result {
                    Ok(_) => debug!(thread = %thread_name, "Worker stopped"),
                    Err(e) => {
                        error!(thread = %thread_name, "Worker failed, stopping station: {}", e);
                        stop.cancel();
                    }
                }
                result
            })
        })?;

    Ok(Worker {
        name: name.to_string(),
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_is_returned_from_join() {
        let stop = StopSignal::new();
        let worker = spawn_worker("adder", &stop, || Ok(2 + 2)).unwrap();
        assert_eq!(worker.name(), "adder");
        assert_eq!(worker.join().unwrap(), 4);
        assert!(!stop.is_cancelled());
    }

    #[test]
    fn failure_raises_stop_signal() {
        let stop = StopSignal::new();
        let worker =
            spawn_worker::<_, ()>("link", &stop, || Err(StationError::LinkClosed)).unwrap();
        assert!(matches!(worker.join(), Err(StationError::LinkClosed)));
        assert!(stop.is_cancelled());
    }

    #[test]
    fn panic_is_reported_by_name() {
        let stop = StopSignal::new();
        let worker = spawn_worker::<_, ()>("boom", &stop, || panic!("kaboom")).unwrap();
        match worker.join() {
            Err(StationError::ThreadPanicked(name)) => assert_eq!(name, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(stop.is_cancelled());
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::error::PanelResult;

/// A named background thread with a cooperative stop flag and a join that
/// gives up after a bound instead of hanging the caller.
pub struct Worker {
    name: String,
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns `body`, handing it the stop flag it must poll at the top of
    /// every iteration.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> PanelResult<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = mpsc::channel();

        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            body(flag);
            let _ = done_tx.send(());
        })?;

        Ok(Self {
            name,
            stop,
            done,
            handle: Some(handle),
        })
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signals the loop and waits up to `bound`. Returns `false` when the
    /// thread is still running; it keeps running on its own and
    /// [`Self::is_finished`] reports when it is done.
    pub fn stop(&mut self, bound: Duration) -> bool {
        self.request_stop();
        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.done.recv_timeout(bound) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!(worker = %self.name, "worker thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(worker = %self.name, ?bound, "worker did not exit in time, detaching");
                self.handle = Some(handle);
                false
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.request_stop();
    }
}

/// Sleeps in short steps so a stop request is noticed quickly.
pub fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) {
    const STEP: Duration = Duration::from_millis(20);
    let mut left = total;
    while !left.is_zero() && !stop.load(Ordering::Acquire) {
        let step = left.min(STEP);
        thread::sleep(step);
        left -= step;
    }
}

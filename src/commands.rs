//! Camera start/stop requests, carried out one at a time on a background
//! thread. Callers get a ticket back immediately and poll for the outcome,
//! so nobody waits on a device open, an encoder spawn or a bounded join.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::capture::RecordMode;
use crate::error::{PanelError, PanelResult};
use crate::worker::Worker;

const RECV_POLL: Duration = Duration::from_millis(50);
// settled outcomes kept for late pollers
const KEPT_OUTCOMES: usize = 64;

pub type Ticket = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraCommand {
    /// Start an idle camera or stop a recording one.
    Toggle {
        index: u32,
        stem: String,
        mode: RecordMode,
    },
    /// Start all cameras or stop all cameras.
    ToggleBoth { stem: String, mode: RecordMode },
}

#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Pending,
    Started,
    /// Cameras stopped and where each saved its output.
    Stopped(Vec<(u32, PathBuf)>),
    Failed(Arc<PanelError>),
}

impl CommandOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, CommandOutcome::Pending)
    }
}

#[derive(Debug, Default)]
struct Ledger {
    next: Ticket,
    outcomes: BTreeMap<Ticket, CommandOutcome>,
}

#[derive(Debug, Default)]
struct Outcomes {
    ledger: Mutex<Ledger>,
    settled: Condvar,
}

impl Outcomes {
    fn issue(&self) -> Ticket {
        let mut ledger = self.ledger.lock();
        ledger.next += 1;
        let ticket = ledger.next;
        ledger.outcomes.insert(ticket, CommandOutcome::Pending);
        while ledger.outcomes.len() > KEPT_OUTCOMES {
            ledger.outcomes.pop_first();
        }
        ticket
    }

    fn settle(&self, ticket: Ticket, outcome: CommandOutcome) {
        let mut ledger = self.ledger.lock();
        if let Some(slot) = ledger.outcomes.get_mut(&ticket) {
            *slot = outcome;
        }
        self.settled.notify_all();
    }

    fn get(&self, ticket: Ticket) -> Option<CommandOutcome> {
        self.ledger.lock().outcomes.get(&ticket).cloned()
    }

    fn wait(&self, ticket: Ticket, timeout: Duration) -> Option<CommandOutcome> {
        let deadline = Instant::now() + timeout;
        let mut ledger = self.ledger.lock();
        loop {
            let outcome = ledger.outcomes.get(&ticket).cloned()?;
            if !outcome.is_pending() {
                return Some(outcome);
            }
            if self.settled.wait_until(&mut ledger, deadline).timed_out() {
                return ledger.outcomes.get(&ticket).cloned();
            }
        }
    }
}

/// Runs [`CameraCommand`]s in submission order on the `camera-commands`
/// thread and keeps their outcomes for polling.
pub struct CommandDispatcher {
    sender: Mutex<Option<Sender<(Ticket, CameraCommand)>>>,
    outcomes: Arc<Outcomes>,
    worker: Mutex<Option<Worker>>,
}

impl CommandDispatcher {
    pub fn spawn<F>(handler: F) -> PanelResult<Self>
    where
        F: Fn(&CameraCommand) -> CommandOutcome + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<(Ticket, CameraCommand)>();
        let outcomes = Arc::new(Outcomes::default());

        let settled = Arc::clone(&outcomes);
        let worker = Worker::spawn("camera-commands", move |stop| {
            while !stop.load(Ordering::Acquire) {
                match receiver.recv_timeout(RECV_POLL) {
                    Ok((ticket, command)) => {
                        debug!(ticket, ?command, "camera command");
                        settled.settle(ticket, handler(&command));
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            for (ticket, command) in receiver.try_iter() {
                warn!(ticket, ?command, "camera command dropped on shutdown");
                settled.settle(ticket, CommandOutcome::Failed(Arc::new(PanelError::ShuttingDown)));
            }
        })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            outcomes,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queues `command` and returns its ticket without waiting for it.
    pub fn submit(&self, command: CameraCommand) -> PanelResult<Ticket> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(PanelError::ShuttingDown);
        };

        let ticket = self.outcomes.issue();
        if sender.send((ticket, command)).is_err() {
            self.outcomes
                .settle(ticket, CommandOutcome::Failed(Arc::new(PanelError::ShuttingDown)));
            return Err(PanelError::ShuttingDown);
        }
        Ok(ticket)
    }

    /// `None` for tickets never issued or long forgotten.
    pub fn outcome(&self, ticket: Ticket) -> Option<CommandOutcome> {
        self.outcomes.get(ticket)
    }

    /// Blocks until `ticket` settles or `timeout` passes. Not for UI threads.
    pub fn wait(&self, ticket: Ticket, timeout: Duration) -> Option<CommandOutcome> {
        self.outcomes.wait(ticket, timeout)
    }

    /// Refuses new commands and stops the thread within `bound`. Commands
    /// still queued settle as failed.
    pub fn stop(&self, bound: Duration) {
        self.sender.lock().take();
        if let Some(mut worker) = self.worker.lock().take() {
            if !worker.stop(bound) {
                warn!("camera command still running, left detached");
            }
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            worker.request_stop();
        }
    }
}

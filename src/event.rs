//! Notifications, cancellation and event injection for a running script.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const SLEEP_TICK: Duration = Duration::from_millis(50);

/// Direction of a captured chunk of channel traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Tx => write!(f, "TX"),
            Direction::Rx => write!(f, "RX"),
        }
    }
}

/// Why the executor left a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionReason {
    Goto,
    ElseGoto,
    Event(String),
    Timeout,
}

/// Lifecycle and data notifications emitted while a script runs
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// The run began in `initial`
    Started { initial: String },

    /// A state is about to run its actions
    StateEntered { state: String },

    Transition {
        from: String,
        to: String,
        reason: TransitionReason,
    },

    /// Output of a `log` action
    Log { message: String },

    /// Bytes written to or read from a channel
    Data {
        channel: String,
        direction: Direction,
        bytes: Vec<u8>,
    },

    /// The run reached a terminal state
    Finished { state: String },

    /// The run was stopped from outside
    Stopped { state: String },

    /// An action failed and the run aborted
    Failed {
        state: String,
        action: Option<String>,
        message: String,
    },
}

pub(crate) type Notifier = Arc<dyn Fn(&RunEvent) + Send + Sync>;

/// Cooperative cancellation flag shared between a run and its owner.
///
/// The executor checks it between actions and at every poll tick of a wait,
/// so a stop takes effect within one poll interval. A write already in
/// progress always completes.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in short ticks, failing with [`Error::Stopped`]
    /// as soon as a stop is requested.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return Err(Error::Stopped);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            tokio::time::sleep(remaining.min(SLEEP_TICK)).await;
        }
    }
}

/// Feeds external event labels into a run.
///
/// Events are queued and consumed in arrival order, one per wait cycle.
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<String>);

impl EventSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Queue `label`. Returns `false` once the run has ended.
    pub fn send(&self, label: impl Into<String>) -> bool {
        self.0.send(label.into()).is_ok()
    }
}

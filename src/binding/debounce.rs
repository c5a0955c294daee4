//! Per-dial debouncer
//!
//! Collapses bursts of triggers into one trailing action, then keeps the
//! action rate limited to one run per cooldown. The state machine runs in its
//! own task:
//!
//! ```text
//! Idle --trigger--> Pending --expiry--> Fired --done--> Armed --expiry--> Idle
//!                      ^                                  |
//!                      +-------------trigger--------------+
//! ```
//!
//! Triggers while `Pending` only collapse. The action does not receive the
//! triggering value; it re-reads whatever is latest when it fires.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Observable debouncer phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    /// Nothing scheduled
    Idle,
    /// A trigger is waiting for the cooldown to expire
    Pending,
    /// Cooldown after a run, nothing waiting
    Armed,
    /// Action running
    Fired,
}

enum Phase {
    Idle,
    Pending { deadline: Instant },
    Armed { deadline: Instant },
    Fired,
}

impl Phase {
    fn public(&self) -> DebounceState {
        match self {
            Phase::Idle => DebounceState::Idle,
            Phase::Pending { .. } => DebounceState::Pending,
            Phase::Armed { .. } => DebounceState::Armed,
            Phase::Fired => DebounceState::Fired,
        }
    }
}

pub struct Debouncer {
    tx: mpsc::Sender<()>,
    state: watch::Receiver<DebounceState>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Debouncer {
    /// Spawn a debouncer task running `action` at most once per `cooldown`
    pub fn spawn<F, Fut>(cooldown: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // One slot is enough: a queued trigger already means "run again"
        let (tx, rx) = mpsc::channel(1);
        let (state_tx, state) = watch::channel(DebounceState::Idle);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(cooldown, action, rx, state_tx, cancel.clone()));
        Self {
            tx,
            state,
            cancel,
            handle,
        }
    }

    /// Request a run. Never blocks.
    pub fn trigger(&self) {
        let _ = self.tx.try_send(());
    }

    pub fn state(&self) -> DebounceState {
        *self.state.borrow()
    }

    /// Stop the task. A pending run is dropped and a running action is
    /// interrupted at its next await point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<F, Fut>(
    cooldown: Duration,
    action: F,
    mut rx: mpsc::Receiver<()>,
    state: watch::Sender<DebounceState>,
    cancel: CancellationToken,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut phase = Phase::Idle;

    loop {
        let _ = state.send(phase.public());

        phase = match phase {
            Phase::Idle => tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(()) => Phase::Pending { deadline: Instant::now() + cooldown },
                    None => break,
                },
            },
            Phase::Pending { deadline } => tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(deadline) => Phase::Fired,
                msg = rx.recv() => match msg {
                    Some(()) => Phase::Pending { deadline },
                    None => break,
                },
            },
            Phase::Fired => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = action() => {}
                }
                Phase::Armed {
                    deadline: Instant::now() + cooldown,
                }
            }
            Phase::Armed { deadline } => tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(deadline) => Phase::Idle,
                msg = rx.recv() => match msg {
                    Some(()) => Phase::Pending { deadline },
                    None => break,
                },
            },
        };
    }

    let _ = state.send(DebounceState::Idle);
}

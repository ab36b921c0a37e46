//! Signals from the orchestrator (and the lock keeper) to a running executor.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, watch};

/// What the executor should do next. The first non-`Proceed` signal wins,
/// except `LockLost`, which overrides anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Proceed,
    Cancel { reason: String },
    /// Abandon forward progress and run the rollback plan.
    Rollback,
    LockLost,
}

/// Post a signal. Returns `false` when an earlier signal already stands.
pub fn signal(tx: &watch::Sender<Control>, next: Control) -> bool {
    tx.send_if_modified(|current| {
        if *current == Control::Proceed || next == Control::LockLost {
            *current = next.clone();
            true
        } else {
            false
        }
    })
}

/// Resolves with the first signal other than `Proceed`.
pub async fn signalled(rx: &mut watch::Receiver<Control>) -> Control {
    match rx.wait_for(|c| *c != Control::Proceed).await {
        Ok(c) => c.clone(),
        // Sender gone: the orchestrator dropped the run.
        Err(_) => Control::Cancel {
            reason: "orchestrator shut down".into(),
        },
    }
}

/// Manual promotion hand-off between an approval gate and `promote`.
#[derive(Default)]
pub struct ApprovalGate {
    waiting: AtomicBool,
    notify: Notify,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn wait(&self) {
        self.waiting.store(true, Ordering::SeqCst);
        self.notify.notified().await;
        self.waiting.store(false, Ordering::SeqCst);
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Release a waiting gate; `false` when nothing is waiting.
    pub fn approve(&self) -> bool {
        if self.waiting.swap(false, Ordering::SeqCst) {
            self.notify.notify_one();
            true
        } else {
            false
        }
    }
}

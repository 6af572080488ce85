//! Cooperative cancellation tokens
//!
//! Every long-running wait in the crate (watchdogs, quote races, relay
//! sync passes) takes a [`CancelToken`] and aborts within one poll tick
//! of [`CancelHandle::cancel`] being called.

use lazy_static::lazy_static;
use tokio::sync::watch;

lazy_static! {
    static ref NEVER: (watch::Sender<bool>, watch::Receiver<bool>) = watch::channel(false);
}

/// Sender side; owned by whoever may abort the operation
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Receiver side; cloned into every wait that must honor the abort
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/token pair
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Mint another token connected to this handle
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// A token that can never fire, for callers without a cancellation path
    pub fn never() -> Self {
        CancelToken {
            rx: NEVER.1.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the handle fired. If the handle was dropped without
    /// firing, this pends forever so `select!` arms do not wake spuriously.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

//! The initialization gate.
//!
//! ```text
//! Unopened ──begin_opening──▶ Opening ──mark_ready──▶ Ready
//!     ▲                          │
//!     │                          └──mark_failed──▶ Failed(reason)
//!     └────────────── reset (emergency recovery only) ───────────┘
//! ```
//!
//! Store operations call [`InitGate::ensure_ready`] and fail fast while the
//! gate is anywhere but `Ready`. Consumers that want to block instead call
//! [`InitGate::wait_until_ready`], which any number of tasks may await at
//! once; they all observe the same outcome.

use crate::error::{CoreError, CoreResult};
use std::fmt;
use tokio::sync::watch;
use tracing::{error, info};

/// Readiness of the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Nothing has been opened yet, or recovery tore the store down.
    Unopened,
    /// Opening, migrating and rebuilding the sync queue.
    Opening,
    /// Open and serving reads and writes.
    Ready,
    /// Opening failed with the given reason.
    Failed(String),
}

impl Readiness {
    fn is_settled(&self) -> bool {
        matches!(self, Readiness::Ready | Readiness::Failed(_))
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Unopened => f.write_str("unopened"),
            Readiness::Opening => f.write_str("opening"),
            Readiness::Ready => f.write_str("ready"),
            Readiness::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Process-wide readiness state machine.
pub struct InitGate {
    state: watch::Sender<Readiness>,
}

impl InitGate {
    /// Creates a gate in the `Unopened` state.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(Readiness::Unopened);
        Self { state }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> Readiness {
        self.state.borrow().clone()
    }

    /// Moves `Unopened` to `Opening`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` from any other state.
    pub fn begin_opening(&self) -> CoreResult<()> {
        self.transition(&Readiness::Unopened, Readiness::Opening)?;
        info!("store opening");
        Ok(())
    }

    /// Moves `Opening` to `Ready`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` from any other state.
    pub fn mark_ready(&self) -> CoreResult<()> {
        self.transition(&Readiness::Opening, Readiness::Ready)?;
        info!("store ready");
        Ok(())
    }

    /// Moves `Opening` to `Failed(reason)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` from any other state.
    pub fn mark_failed(&self, reason: impl Into<String>) -> CoreResult<()> {
        let reason = reason.into();
        self.transition(&Readiness::Opening, Readiness::Failed(reason.clone()))?;
        error!(%reason, "store failed to open");
        Ok(())
    }

    /// Tears the gate down to `Unopened`.
    ///
    /// Only emergency recovery does this; every store operation fails with
    /// `NotReady` until the store is opened again.
    pub fn reset(&self) {
        let previous = self.state.send_replace(Readiness::Unopened);
        info!(%previous, "store gate reset");
    }

    /// Fails fast unless the gate is `Ready`.
    ///
    /// # Errors
    ///
    /// `NotReady` while unopened or opening, `InitializationFailed` after a
    /// failed open.
    pub fn ensure_ready(&self) -> CoreResult<()> {
        match &*self.state.borrow() {
            Readiness::Ready => Ok(()),
            Readiness::Failed(reason) => Err(CoreError::InitializationFailed {
                reason: reason.clone(),
            }),
            Readiness::Unopened | Readiness::Opening => Err(CoreError::NotReady),
        }
    }

    /// Waits until the gate reaches `Ready` or `Failed`.
    ///
    /// # Errors
    ///
    /// Returns `InitializationFailed` with the recorded reason if opening
    /// failed.
    pub async fn wait_until_ready(&self) -> CoreResult<()> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(Readiness::is_settled)
            .await
            .map_err(|_| CoreError::NotReady)?
            .clone();
        match settled {
            Readiness::Failed(reason) => Err(CoreError::InitializationFailed { reason }),
            _ => Ok(()),
        }
    }

    fn transition(&self, from: &Readiness, to: Readiness) -> CoreResult<()> {
        let mut rejected = None;
        self.state.send_if_modified(|state| {
            if state == from {
                *state = to.clone();
                true
            } else {
                rejected = Some(state.clone());
                false
            }
        });
        match rejected {
            None => Ok(()),
            Some(current) => Err(CoreError::invalid_operation(format!(
                "cannot move store gate from {current} to {to}"
            ))),
        }
    }
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InitGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitGate")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

//! Shutdown coordination for in-flight work
//!
//! [`ShutdownCoordinator`] counts outstanding units of work behind a one-way
//! gate. Tasks register before they start and complete when they finish; a
//! supervisor closes the gate and waits for the count to drop to zero.
//!
//! The gate moves `open -> closing` exactly once. "Drained" is not a stored
//! state: it is what [`ShutdownCoordinator::wait_for_drain`] observes when
//! the outstanding count reaches zero.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct GateState {
    outstanding: usize,
    closing: bool,
}

/// Counts in-flight work and lets one caller drain it
///
/// Cheap to clone; all clones share the same counter and gate. Every update
/// goes through the watch channel's lock, so registration, completion and
/// the gate transition are serialized.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    state: Arc<watch::Sender<GateState>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create an open coordinator with nothing in flight
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::default());
        Self {
            state: Arc::new(tx),
        }
    }

    /// Record `n` additional units of outstanding work
    ///
    /// Must be paired with `n` calls to [`complete`](Self::complete). This
    /// does not consult the gate; use [`try_register`](Self::try_register)
    /// when late work must be refused.
    pub fn register(&self, n: usize) {
        self.state.send_modify(|s| s.outstanding += n);
        debug!(added = n, "Coordinator: register ok");
    }

    /// Record one unit of work as finished
    pub fn complete(&self) {
        let mut underflow = false;
        self.state.send_modify(|s| match s.outstanding.checked_sub(1) {
            Some(n) => s.outstanding = n,
            None => underflow = true,
        });
        debug_assert!(!underflow, "complete() called more often than register()");
        debug!("Coordinator: complete ok");
    }

    /// Register one unit of work unless the gate is closing
    ///
    /// The gate check and the increment happen under the same lock, so a
    /// unit is either counted before any drain can observe zero, or refused.
    /// The returned guard completes the unit when dropped.
    pub fn try_register(&self) -> Option<InFlight> {
        let admitted = self.state.send_if_modified(|s| {
            if s.closing {
                false
            } else {
                s.outstanding += 1;
                true
            }
        });

        admitted.then(|| InFlight {
            coordinator: self.clone(),
        })
    }

    /// Close the gate
    ///
    /// Returns `true` for the call that performed the transition and `false`
    /// for every later call.
    pub fn request_close(&self) -> bool {
        let transitioned = self.state.send_if_modified(|s| {
            if s.closing {
                false
            } else {
                s.closing = true;
                true
            }
        });

        if transitioned {
            debug!(outstanding = self.in_flight(), "Coordinator: gate closed");
        }
        transitioned
    }

    /// Wait until nothing is outstanding
    ///
    /// Has no timeout of its own. May be called before or after
    /// [`request_close`](Self::request_close).
    pub async fn wait_for_drain(&self) {
        let mut rx = self.state.subscribe();
        // The sender outlives `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|s| s.outstanding == 0).await;
    }

    /// Close the gate and wait for all registered work to finish
    pub async fn close_and_wait(&self) {
        self.request_close();
        debug!("Coordinator: waiting for shutdown to finish");
        self.wait_for_drain().await;
    }

    /// Close the gate without waiting for registered work
    pub fn close_not_wait(&self) {
        self.request_close();
        debug!("Coordinator: marked as closed, not waiting for shutdown to finish");
    }

    /// Resolve once the gate is closing
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.closing).await;
    }

    /// Whether the gate has been closed
    pub fn is_closing(&self) -> bool {
        self.state.borrow().closing
    }

    /// Number of units registered but not yet completed
    pub fn in_flight(&self) -> usize {
        self.state.borrow().outstanding
    }
}

/// One registered unit of work; completes on drop
#[must_use = "dropping the guard completes the unit immediately"]
#[derive(Debug)]
pub struct InFlight {
    coordinator: ShutdownCoordinator,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.coordinator.complete();
    }
}

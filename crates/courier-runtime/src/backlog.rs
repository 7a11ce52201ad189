//! Backlog queue
//!
//! Bounded FIFO of outbound envelopes waiting for a delivery worker. Callers
//! offer, workers take one envelope each. The queue never holds more than its
//! capacity.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use courier_core::{CourierError, Envelope, Result};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

#[derive(Debug)]
struct BacklogState {
    items: VecDeque<Envelope>,
    capacity: usize,
}

#[derive(Debug)]
pub struct BacklogQueue {
    state: Mutex<BacklogState>,
    space: Notify,
}

impl BacklogQueue {
    /// Create an empty queue; zero capacity is rejected
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CourierError::invalid_argument("backlog capacity must be positive"));
        }

        Ok(Self {
            state: Mutex::new(BacklogState {
                items: VecDeque::with_capacity(capacity),
                capacity,
            }),
            space: Notify::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, BacklogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_offer(&self, envelope: Envelope) -> core::result::Result<(), Envelope> {
        let mut state = self.state();
        if state.items.len() >= state.capacity {
            return Err(envelope);
        }
        state.items.push_back(envelope);
        Ok(())
    }

    /// Append an envelope. Returns false, leaving the queue untouched, when it
    /// is full.
    pub fn offer(&self, envelope: Envelope) -> bool {
        self.try_offer(envelope).is_ok()
    }

    /// Append an envelope, waiting up to `timeout` for space
    pub async fn offer_timeout(&self, envelope: Envelope, timeout: Duration) -> bool {
        // `None` when the timeout is too large to represent; wait without one
        let deadline = Instant::now().checked_add(timeout);
        let mut pending = envelope;

        loop {
            // Registered before the capacity check so a concurrent take or
            // clear cannot slip between the two.
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_offer(pending) {
                Ok(()) => return true,
                Err(back) => pending = back,
            }

            match deadline {
                Some(deadline) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        debug!("Backlog still full after {:?}, rejecting {}", timeout, pending);
                        return false;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Remove and return the oldest envelope
    pub fn take(&self) -> Option<Envelope> {
        let envelope = self.state().items.pop_front();
        if envelope.is_some() {
            self.space.notify_one();
        }
        envelope
    }

    /// Drop every queued envelope, returning how many were removed
    pub fn clear(&self) -> usize {
        let removed = {
            let mut state = self.state();
            let removed = state.items.len();
            state.items.clear();
            removed
        };
        if removed > 0 {
            self.space.notify_waiters();
        }
        removed
    }

    /// Change the capacity. When shrinking below the current length the newest
    /// envelopes are discarded; their count is returned.
    pub fn set_capacity(&self, capacity: usize) -> Result<usize> {
        if capacity == 0 {
            return Err(CourierError::invalid_argument("backlog capacity must be positive"));
        }

        let mut state = self.state();
        state.capacity = capacity;

        let mut discarded = 0;
        while state.items.len() > capacity {
            if let Some(envelope) = state.items.pop_back() {
                warn!("Backlog shrunk to {}, discarding {}", capacity, envelope);
                discarded += 1;
            }
        }
        drop(state);

        self.space.notify_waiters();
        Ok(discarded)
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state().capacity
    }
}

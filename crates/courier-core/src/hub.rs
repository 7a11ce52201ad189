//! Notification hub
//!
//! Publish/subscribe fan-out that decouples senders and receivers from the code
//! observing them. A peer owns two hubs: one for inbound arrivals and one for
//! "sent" acknowledgements.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use smallvec::SmallVec;
use tracing::{debug, error};

use crate::envelope::Envelope;
use crate::errors::Result;
use crate::types::{PeerName, SubscriptionId};

/// Payload of the acknowledgement published on the sent hub
pub const SENT_MARKER: &str = "sent";

/// Observer of envelopes published on a hub
pub trait MessageObserver: Send + Sync {
    fn on_message(&self, envelope: &Envelope);
}

impl<F> MessageObserver for F
where
    F: Fn(&Envelope) + Send + Sync,
{
    fn on_message(&self, envelope: &Envelope) {
        self(envelope)
    }
}

type ObserverList = Vec<(SubscriptionId, Arc<dyn MessageObserver>)>;

// ----------------------------------------------------------------------------
// Notification Hub
// ----------------------------------------------------------------------------

pub struct NotificationHub {
    name: &'static str,
    next_id: Arc<AtomicU64>,
    observers: RwLock<ObserverList>,
}

impl NotificationHub {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: Arc::new(AtomicU64::new(1)),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// New hub drawing subscription ids from the same sequence as `other`, so
    /// a handle identifies exactly one subscription across both hubs
    pub fn sharing_ids(name: &'static str, other: &NotificationHub) -> Self {
        Self {
            name,
            next_id: other.next_id.clone(),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register an observer; it is called after every observer registered
    /// before it
    pub fn subscribe(&self, observer: Arc<dyn MessageObserver>) -> SubscriptionId {
        let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, observer));
        debug!("{} hub: added subscriber {}", self.name, id);
        id
    }

    /// Remove an observer. Returns false when the handle is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        before != observers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Deliver an envelope to every observer in subscription order.
    ///
    /// A panicking observer is logged and skipped; the rest still run and the
    /// panic does not reach the caller. Returns how many observers completed.
    pub fn publish(&self, envelope: &Envelope) -> usize {
        let snapshot: SmallVec<[Arc<dyn MessageObserver>; 4]> = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        let mut delivered = 0;
        for observer in snapshot {
            match catch_unwind(AssertUnwindSafe(|| observer.on_message(envelope))) {
                Ok(()) => delivered += 1,
                Err(_) => error!("{} hub: observer panicked while handling {}", self.name, envelope),
            }
        }
        delivered
    }
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("name", &self.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Build the acknowledgement for a delivered envelope: a text envelope from the
/// local peer back to the original source, carrying [`SENT_MARKER`]
pub fn sent_acknowledgement(local: &PeerName, delivered: &Envelope) -> Result<Envelope> {
    Envelope::new_text(local.as_str(), delivered.source().as_str(), SENT_MARKER)
}

//! Observer that records envelopes for later assertions

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use courier_core::{Envelope, MessageObserver};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct EnvelopeCollector {
    envelopes: Mutex<Vec<Envelope>>,
    arrived: Notify,
}

impl EnvelopeCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn envelopes_mut(&self) -> MutexGuard<'_, Vec<Envelope>> {
        self.envelopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of everything received so far, in arrival order
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes_mut().clone()
    }

    pub fn len(&self) -> usize {
        self.envelopes_mut().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` envelopes arrived. Returns false on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.len() >= count {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.len() >= count;
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl MessageObserver for EnvelopeCollector {
    fn on_message(&self, envelope: &Envelope) {
        self.envelopes_mut().push(envelope.clone());
        self.arrived.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_arrivals() {
        let collector = EnvelopeCollector::new();
        let sink = collector.clone();
        tokio::spawn(async move {
            for i in 0..3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let envelope = Envelope::new_text("alice", "bob", format!("m{}", i)).unwrap();
                sink.on_message(&envelope);
            }
        });

        assert!(collector.wait_for(3, Duration::from_secs(2)).await);
        assert_eq!(collector.len(), 3);
        assert!(!collector.wait_for(4, Duration::from_millis(20)).await);
        assert!(collector.wait_for(3, Duration::MAX).await);
    }
}

//! Delivery worker
//!
//! One-shot unit of work that carries a single envelope from the backlog to its
//! destination. Per envelope the worker walks
//!
//! ```text
//! Queued -> Resolving -> Sending -> Retransmitting -> Delivered | Dropped
//! ```
//!
//! Resolution makes one lookup and then up to `retry` more, each after a
//! cancellable sleep. Sending makes one attempt and then up to `retry`
//! retransmissions while the channel stays bound. Every loop boundary checks
//! the cancel token. Failures never reach the caller of `send`; they are
//! logged and counted, and the envelope is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_core::{
    sent_acknowledgement, Advertisement, ChannelHandle, ChannelKind, CourierError, DeliveryConfig,
    DirectoryClient, Envelope, MessageListener, NameFilter, NotificationHub, OverlayTransport,
    PeerName, TransportError, WireMessage,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::backlog::BacklogQueue;
use crate::channels::ChannelPool;
use crate::fabric::CancelToken;

// ----------------------------------------------------------------------------
// States and Outcomes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Queued,
    Resolving,
    Sending,
    Retransmitting,
    Delivered,
    Dropped,
}

#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered {
        /// Sends made, the first one included
        attempts: u32,
    },
    Dropped(CourierError),
    /// The backlog was empty when the worker ran
    Idle,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

// ----------------------------------------------------------------------------
// Delivery Statistics
// ----------------------------------------------------------------------------

/// Counters shared by every worker of a peer
#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    retransmissions: AtomicU64,
    resolutions: AtomicU64,
    idle: AtomicU64,
}

/// Point-in-time copy of [`DeliveryStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryStatsSnapshot {
    pub delivered: u64,
    pub dropped: u64,
    pub retransmissions: u64,
    pub resolutions: u64,
    pub idle: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            resolutions: self.resolutions.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Delivery Context
// ----------------------------------------------------------------------------

/// Everything a worker needs besides its envelope, shared per peer
pub struct DeliveryContext {
    pub local: PeerName,
    /// Kind of channel opened towards destinations
    pub channel_kind: ChannelKind,
    pub directory: DirectoryClient,
    pub transport: Arc<dyn OverlayTransport>,
    pub channels: Arc<ChannelPool>,
    pub sent_hub: Arc<NotificationHub>,
    /// Receives frames the destination sends back on duplex channels
    pub response_listener: Option<Arc<dyn MessageListener>>,
    pub config: DeliveryConfig,
    pub stats: Arc<DeliveryStats>,
}

// ----------------------------------------------------------------------------
// Delivery Worker
// ----------------------------------------------------------------------------

pub struct DeliveryWorker {
    context: Arc<DeliveryContext>,
    envelope: Option<Envelope>,
    retry: u32,
    cancel: CancelToken,
    state: DeliveryState,
}

impl DeliveryWorker {
    /// Worker for the oldest envelope in the backlog, if any
    pub fn from_backlog(
        context: Arc<DeliveryContext>,
        backlog: &BacklogQueue,
        retry: u32,
        cancel: CancelToken,
    ) -> Self {
        Self::new(context, backlog.take(), retry, cancel)
    }

    pub fn new(
        context: Arc<DeliveryContext>,
        envelope: Option<Envelope>,
        retry: u32,
        cancel: CancelToken,
    ) -> Self {
        Self {
            context,
            envelope,
            retry,
            cancel,
            state: DeliveryState::Queued,
        }
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    fn transition(&mut self, next: DeliveryState) {
        debug!("Delivery worker {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Drive the envelope to a terminal state
    pub async fn run(mut self) -> DeliveryOutcome {
        let Some(envelope) = self.envelope.take() else {
            debug!("Backlog empty, nothing to deliver");
            self.context.stats.idle.fetch_add(1, Ordering::Relaxed);
            return DeliveryOutcome::Idle;
        };

        self.transition(DeliveryState::Resolving);
        let advertisement = match self.resolve(&envelope).await {
            Ok(advertisement) => advertisement,
            Err(reason) => return self.drop_envelope(&envelope, None, reason),
        };

        self.transition(DeliveryState::Sending);
        if self.cancel.is_cancelled() {
            return self.drop_envelope(&envelope, None, cancelled("before sending"));
        }

        let channel = match self.acquire_channel(&advertisement).await {
            Ok(channel) => channel,
            Err(reason) => return self.drop_envelope(&envelope, None, reason),
        };

        let wire = envelope.to_wire();
        let mut attempts = 1;
        if self.try_send(&channel, &wire).await {
            return self.deliver(&envelope, &advertisement.name, channel, attempts);
        }

        self.transition(DeliveryState::Retransmitting);
        let interval = self.context.config.retry_interval();
        let mut remaining = self.retry;
        while remaining > 0 {
            if !self.cancel.sleep(interval).await {
                return self.drop_envelope(
                    &envelope,
                    Some((&advertisement.name, channel)),
                    cancelled("while retransmitting"),
                );
            }
            if !channel.is_bound() {
                let reason = TransportError::NotBound {
                    address: channel.address().to_string(),
                };
                return self.drop_envelope(&envelope, Some((&advertisement.name, channel)), reason.into());
            }

            remaining -= 1;
            attempts += 1;
            self.context.stats.retransmissions.fetch_add(1, Ordering::Relaxed);
            debug!("Retransmission {} of {} for {}", attempts - 1, self.retry, envelope);

            if self.try_send(&channel, &wire).await {
                return self.deliver(&envelope, &advertisement.name, channel, attempts);
            }
        }

        let reason = CourierError::delivery_exhausted(envelope.destination().as_str(), attempts);
        self.drop_envelope(&envelope, Some((&advertisement.name, channel)), reason)
    }

    /// One lookup, then up to `retry` more after a sleep each
    async fn resolve(&self, envelope: &Envelope) -> Result<Advertisement, CourierError> {
        let destination = envelope.destination();
        if let Some(advertisement) = self.lookup(destination).await {
            return Ok(advertisement);
        }

        let interval = self.context.config.retry_interval();
        let mut remaining = self.retry;
        while remaining > 0 {
            if !self.cancel.sleep(interval).await {
                return Err(cancelled("while resolving"));
            }
            remaining -= 1;

            if let Some(advertisement) = self.lookup(destination).await {
                return Ok(advertisement);
            }
        }

        Err(CourierError::delivery_exhausted(
            destination.as_str(),
            self.retry.saturating_add(1),
        ))
    }

    async fn lookup(&self, destination: &PeerName) -> Option<Advertisement> {
        self.context.stats.resolutions.fetch_add(1, Ordering::Relaxed);
        match self
            .context
            .directory
            .resolve(destination.as_str(), self.context.channel_kind)
            .await
        {
            Ok(found) => {
                let filter = NameFilter::parse(destination.as_str());
                found.into_iter().find(|ad| filter.matches(ad.name.as_str()))
            }
            Err(e) => {
                warn!("Directory lookup for {} failed: {}", destination, e);
                None
            }
        }
    }

    async fn acquire_channel(&self, advertisement: &Advertisement) -> Result<ChannelHandle, CourierError> {
        let kind = self.context.channel_kind;
        if kind.is_duplex() {
            if let Some(channel) = self.context.channels.get(&advertisement.name) {
                debug!("Reusing open channel to {}", advertisement.name);
                return Ok(channel);
            }
        }

        let timeout = self.context.config.channel_open_timeout();
        let listener = if kind.is_duplex() {
            self.context.response_listener.clone()
        } else {
            None
        };

        let open = self
            .context
            .transport
            .open_channel(&advertisement.address, kind, timeout, listener);
        match tokio::time::timeout(timeout, open).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    async fn try_send(&self, channel: &ChannelHandle, wire: &WireMessage) -> bool {
        match channel.send(wire).await {
            Ok(true) => true,
            Ok(false) => {
                debug!("Send to {} reported failure", channel.address());
                false
            }
            Err(e) => {
                warn!("Send to {} failed: {}", channel.address(), e);
                false
            }
        }
    }

    fn deliver(
        &mut self,
        envelope: &Envelope,
        peer: &PeerName,
        channel: ChannelHandle,
        attempts: u32,
    ) -> DeliveryOutcome {
        self.transition(DeliveryState::Delivered);
        self.context.stats.delivered.fetch_add(1, Ordering::Relaxed);

        if channel.kind().is_duplex() {
            self.context.channels.put(peer.clone(), channel);
        } else {
            channel.close();
        }

        match sent_acknowledgement(&self.context.local, envelope) {
            Ok(ack) => {
                self.context.sent_hub.publish(&ack);
            }
            Err(e) => warn!("Could not build sent notification for {}: {}", envelope, e),
        }

        debug!("Delivered {} after {} attempt(s)", envelope, attempts);
        DeliveryOutcome::Delivered { attempts }
    }

    fn drop_envelope(
        &mut self,
        envelope: &Envelope,
        channel: Option<(&PeerName, ChannelHandle)>,
        reason: CourierError,
    ) -> DeliveryOutcome {
        self.transition(DeliveryState::Dropped);
        self.context.stats.dropped.fetch_add(1, Ordering::Relaxed);

        if let Some((peer, channel)) = channel {
            self.context.channels.evict(peer, &channel);
        }

        warn!(
            "Could not send message, as result the message [{}] is dropped: {}",
            envelope, reason
        );
        DeliveryOutcome::Dropped(reason)
    }
}

fn cancelled(stage: &str) -> CourierError {
    CourierError::execution_rejected(format!("delivery cancelled {}", stage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::CancelTrigger;
    use courier_core::{
        AcceptListener, ChannelAddress, DirectoryConfig, DirectoryService, EnvelopeKind,
        OverlayTransport,
    };
    use courier_harness::{EnvelopeCollector, MemoryNode, MemoryOverlay};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Keeps accepted channels alive without reading them
    #[derive(Default)]
    struct Sink(Mutex<Vec<ChannelHandle>>);

    impl AcceptListener for Sink {
        fn on_accept(&self, channel: ChannelHandle) {
            self.0.lock().unwrap().push(channel);
        }
    }

    struct Fixture {
        alice: Arc<MemoryNode>,
        context: Arc<DeliveryContext>,
        sent: Arc<EnvelopeCollector>,
        sink: Arc<Sink>,
    }

    async fn fixture(kind: ChannelKind, reachable: bool) -> Fixture {
        let overlay = MemoryOverlay::ideal();
        let alice = overlay.node("alice");
        let bob = overlay.node("bob");
        let sink = Arc::new(Sink::default());

        if reachable {
            let ad = Advertisement::new(
                PeerName::new("bob").unwrap(),
                ChannelAddress::generate(),
                kind,
                Duration::from_secs(60),
            );
            bob.accept_incoming(&ad, sink.clone()).await.unwrap();
            bob.publish(ad).await.unwrap();
        }

        let sent_hub = Arc::new(NotificationHub::new("sent"));
        let sent = EnvelopeCollector::new();
        sent_hub.subscribe(sent.clone());

        let context = Arc::new(DeliveryContext {
            local: PeerName::new("alice").unwrap(),
            channel_kind: kind,
            directory: DirectoryClient::new(alice.clone(), DirectoryConfig::testing()),
            transport: alice.clone(),
            channels: Arc::new(ChannelPool::new()),
            sent_hub,
            response_listener: None,
            config: DeliveryConfig {
                retry_interval_ms: 5,
                ..DeliveryConfig::testing()
            },
            stats: Arc::new(DeliveryStats::default()),
        });

        Fixture {
            alice,
            context,
            sent,
            sink,
        }
    }

    fn envelope() -> Envelope {
        Envelope::new_text("alice", "bob", "hello").unwrap()
    }

    #[tokio::test]
    async fn test_empty_backlog_is_idle() {
        let fx = fixture(ChannelKind::BiDi, true).await;
        let (_trigger, cancel) = CancelTrigger::pair();
        let backlog = BacklogQueue::new(4).unwrap();

        let outcome = DeliveryWorker::from_backlog(fx.context.clone(), &backlog, 3, cancel)
            .run()
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Idle));
        assert_eq!(fx.alice.stats().remote_queries(), 0);
        assert_eq!(fx.context.stats.snapshot().idle, 1);
    }

    #[tokio::test]
    async fn test_delivers_and_acknowledges() {
        let fx = fixture(ChannelKind::BiDi, true).await;
        let (_trigger, cancel) = CancelTrigger::pair();

        let outcome = DeliveryWorker::new(fx.context.clone(), Some(envelope()), 3, cancel)
            .run()
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered { attempts: 1 }));

        let acks = fx.sent.envelopes();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind(), EnvelopeKind::Text);
        assert_eq!(acks[0].text().unwrap(), "sent");
        assert_eq!(acks[0].destination().as_str(), "alice");
    }

    #[tokio::test]
    async fn test_unresolvable_destination_exhausts_resolution() {
        let fx = fixture(ChannelKind::BiDi, false).await;
        let (_trigger, cancel) = CancelTrigger::pair();

        let outcome = DeliveryWorker::new(fx.context.clone(), Some(envelope()), 3, cancel)
            .run()
            .await;
        match outcome {
            DeliveryOutcome::Dropped(CourierError::DeliveryExhausted { attempts, .. }) => {
                assert_eq!(attempts, 4)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(fx.alice.stats().remote_queries(), 4);
        assert_eq!(fx.context.stats.snapshot().resolutions, 4);
        assert!(fx.sent.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_resolution_loop() {
        let mut fx = fixture(ChannelKind::BiDi, false).await;
        Arc::get_mut(&mut fx.context).unwrap().config.retry_interval_ms = 20;
        let (trigger, cancel) = CancelTrigger::pair();

        let worker = DeliveryWorker::new(fx.context.clone(), Some(envelope()), 1_000, cancel);
        let task = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Dropped(CourierError::ExecutionRejected { .. })
        ));

        let queries = fx.alice.stats().remote_queries();
        assert!(queries < 10);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fx.alice.stats().remote_queries(), queries);
    }

    #[tokio::test]
    async fn test_retransmission_succeeds_within_budget() {
        let fx = fixture(ChannelKind::BiDi, true).await;
        fx.alice.fail_next_sends(2);
        let (_trigger, cancel) = CancelTrigger::pair();

        let outcome = DeliveryWorker::new(fx.context.clone(), Some(envelope()), 3, cancel)
            .run()
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered { attempts: 3 }));
        assert_eq!(fx.context.stats.snapshot().retransmissions, 2);
        assert_eq!(fx.sent.len(), 1);
    }

    #[tokio::test]
    async fn test_retransmission_budget_exceeded_drops() {
        let fx = fixture(ChannelKind::BiDi, true).await;
        fx.alice.fail_next_sends(10);
        let (_trigger, cancel) = CancelTrigger::pair();

        let outcome = DeliveryWorker::new(fx.context.clone(), Some(envelope()), 2, cancel)
            .run()
            .await;
        match outcome {
            DeliveryOutcome::Dropped(CourierError::DeliveryExhausted { attempts, .. }) => {
                assert_eq!(attempts, 3)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(fx.sent.is_empty());
        assert!(fx.context.channels.is_empty());
    }

    #[tokio::test]
    async fn test_unbound_channel_stops_retransmission() {
        let fx = fixture(ChannelKind::BiDi, true).await;
        fx.alice.fail_next_sends(1);
        fx.alice.unbind_on_failure(true);
        let (_trigger, cancel) = CancelTrigger::pair();

        let outcome = DeliveryWorker::new(fx.context.clone(), Some(envelope()), 3, cancel)
            .run()
            .await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Dropped(CourierError::Transport(TransportError::NotBound { .. }))
        ));
        assert_eq!(fx.context.stats.snapshot().retransmissions, 0);
    }

    #[tokio::test]
    async fn test_duplex_channel_is_pooled_and_reused() {
        let fx = fixture(ChannelKind::BiDi, true).await;

        for _ in 0..2 {
            let (_trigger, cancel) = CancelTrigger::pair();
            let outcome = DeliveryWorker::new(fx.context.clone(), Some(envelope()), 3, cancel)
                .run()
                .await;
            assert!(outcome.is_delivered());
        }
        assert_eq!(fx.alice.stats().channels_opened(), 1);
        assert_eq!(fx.context.channels.len(), 1);
    }

    #[tokio::test]
    async fn test_wildcard_destination_resolves_by_containment() {
        let fx = fixture(ChannelKind::BiDi, true).await;
        let (_trigger, cancel) = CancelTrigger::pair();
        let wildcard = Envelope::new_text("alice", "*ob*", "hello").unwrap();

        let outcome = DeliveryWorker::new(fx.context.clone(), Some(wildcard), 3, cancel)
            .run()
            .await;
        assert!(outcome.is_delivered());
        assert!(fx
            .context
            .channels
            .get(&PeerName::new("bob").unwrap())
            .is_some());
    }

    #[tokio::test]
    async fn test_one_way_channel_closed_after_delivery() {
        let fx = fixture(ChannelKind::Unicast, true).await;
        let (_trigger, cancel) = CancelTrigger::pair();

        let outcome = DeliveryWorker::new(fx.context.clone(), Some(envelope()), 3, cancel)
            .run()
            .await;
        assert!(outcome.is_delivered());
        assert!(fx.context.channels.is_empty());

        let accepted = fx.sink.0.lock().unwrap();
        assert_eq!(accepted.len(), 1);
        assert!(!accepted[0].is_bound());
    }
}

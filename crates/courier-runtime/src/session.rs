//! Inbound session manager
//!
//! Accepts incoming duplex connections. Each accepted channel gets a listener
//! that forwards frames to a long-lived session task on the execution fabric,
//! outside the worker budget used by delivery workers;
//! the task decodes every frame into an envelope and publishes it on the
//! inbound hub. A frame that fails to decode is logged and skipped without
//! disturbing the session or any other session.

use std::sync::{Arc, Mutex, PoisonError};

use courier_core::{
    AcceptListener, ChannelEvent, ChannelHandle, CourierError, Envelope, MessageListener,
    NotificationHub, Result, SessionConfig, SessionId, TransportError, WireMessage,
};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::fabric::{unit_of_work, CancelToken, ExecutionFabric};

/// Decode a frame and publish the envelope. Returns false when the frame was
/// discarded.
pub fn publish_inbound(hub: &NotificationHub, message: WireMessage) -> bool {
    match Envelope::from_wire(message) {
        Ok(envelope) => {
            debug!("Inbound {}", envelope);
            hub.publish(&envelope);
            true
        }
        Err(e) => {
            error!("Dropping inbound message that failed to decode: {}", e);
            false
        }
    }
}

/// Unwraps a channel event, logging the null cases
fn event_message(event: Option<ChannelEvent>) -> Option<WireMessage> {
    let Some(event) = event else {
        warn!("EVENT IS NULL");
        return None;
    };
    if event.message.is_none() {
        warn!("MESSAGE IS NULL");
    }
    event.message
}

// ----------------------------------------------------------------------------
// Listeners
// ----------------------------------------------------------------------------

/// Forwards frames from an accepted channel to its session task
struct SessionListener {
    session: SessionId,
    frames: mpsc::Sender<WireMessage>,
}

impl MessageListener for SessionListener {
    fn on_event(&self, event: Option<ChannelEvent>) {
        let Some(message) = event_message(event) else {
            return;
        };

        if let Err(e) = self.frames.try_send(message) {
            warn!("Session {} could not queue inbound frame: {}", self.session, e);
        }
    }
}

/// Publishes frames arriving on channels this peer opened itself (replies
/// sent back over a duplex channel)
pub struct ResponseListener {
    hub: Arc<NotificationHub>,
}

impl ResponseListener {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self { hub }
    }
}

impl MessageListener for ResponseListener {
    fn on_event(&self, event: Option<ChannelEvent>) {
        if let Some(message) = event_message(event) {
            publish_inbound(&self.hub, message);
        }
    }
}

// ----------------------------------------------------------------------------
// Session Manager
// ----------------------------------------------------------------------------

struct SessionShared {
    hub: Arc<NotificationHub>,
    fabric: Arc<dyn ExecutionFabric>,
    config: SessionConfig,
    sessions: DashMap<SessionId, ChannelHandle>,
    /// Sessions in accept order, newest last
    recent: Mutex<Vec<(SessionId, ChannelHandle)>>,
}

#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<SessionShared>,
}

impl SessionManager {
    pub fn new(
        hub: Arc<NotificationHub>,
        fabric: Arc<dyn ExecutionFabric>,
        config: SessionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                hub,
                fabric,
                config,
                sessions: DashMap::new(),
                recent: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bind a listener to an accepted channel and start its session task
    pub fn open_session(&self, channel: ChannelHandle) -> Result<SessionId> {
        let session = SessionId::generate();
        let (frames, inbox) = mpsc::channel(self.shared.config.inbound_buffer);

        self.shared.sessions.insert(session, channel.clone());
        self.recent().push((session, channel.clone()));
        channel.set_message_listener(Arc::new(SessionListener { session, frames }));

        let shared = self.shared.clone();
        let submitted = self.shared.fabric.submit_long_lived(
            "inbound-session",
            unit_of_work(move |cancel| run_session(shared, session, inbox, cancel)),
        );

        if let Err(e) = submitted {
            warn!("Rejecting inbound connection on {}: {}", channel.address(), e);
            self.forget(session);
            channel.close();
            return Err(e);
        }

        info!("Accepted inbound session {} on {}", session, channel.address());
        Ok(session)
    }

    /// Send a frame back on the most recently accepted session that is still
    /// bound, bypassing the backlog
    pub async fn respond(&self, envelope: &Envelope) -> Result<()> {
        let (session, channel) = self.latest_bound().ok_or(CourierError::NoSession)?;

        if channel.send(&envelope.to_wire()).await? {
            debug!("Responded on session {} with {}", session, envelope);
            Ok(())
        } else {
            Err(TransportError::SendFailed {
                reason: format!("response on session {} was refused", session),
            }
            .into())
        }
    }

    /// Close every session channel
    pub fn close_all(&self) -> usize {
        let channels: Vec<ChannelHandle> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.shared.sessions.clear();
        self.recent().clear();

        for channel in &channels {
            channel.close();
        }
        channels.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.shared.sessions.len()
    }

    fn forget(&self, session: SessionId) {
        if let Some(channel) = forget(&self.shared, session) {
            channel.close();
        }
    }

    /// Newest bound session; unbound ones found on the way are forgotten
    fn latest_bound(&self) -> Option<(SessionId, ChannelHandle)> {
        loop {
            let (session, channel) = self.recent().last().cloned()?;
            if channel.is_bound() {
                return Some((session, channel));
            }
            debug!("Session {} is no longer bound", session);
            self.forget(session);
        }
    }

    fn recent(&self) -> std::sync::MutexGuard<'_, Vec<(SessionId, ChannelHandle)>> {
        self.shared.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AcceptListener for SessionManager {
    fn on_accept(&self, channel: ChannelHandle) {
        if let Err(e) = self.open_session(channel) {
            error!("Inbound session could not start: {}", e);
        }
    }
}

fn forget(shared: &SessionShared, session: SessionId) -> Option<ChannelHandle> {
    let removed = shared.sessions.remove(&session).map(|(_, channel)| channel);
    shared
        .recent
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|(id, _)| *id != session);
    removed
}

async fn run_session(
    shared: Arc<SessionShared>,
    session: SessionId,
    mut inbox: mpsc::Receiver<WireMessage>,
    cancel: CancelToken,
) {
    debug!("Session {} started", session);
    let mut received = 0usize;

    loop {
        tokio::select! {
            frame = inbox.recv() => match frame {
                Some(message) => {
                    if publish_inbound(&shared.hub, message) {
                        received += 1;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }

    if let Some(channel) = forget(&shared, session) {
        channel.close();
    }
    debug!("Session {} ended after {} envelope(s)", session, received);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::HostPool;
    use courier_core::{
        Advertisement, Channel, ChannelAddress, ChannelKind, OverlayTransport, PeerName,
    };
    use courier_harness::{EnvelopeCollector, MemoryNode, MemoryOverlay};
    use std::time::Duration;
    use tokio::runtime::Handle;

    struct Fixture {
        manager: SessionManager,
        inbox: Arc<EnvelopeCollector>,
        opener: Arc<MemoryNode>,
        address: ChannelAddress,
    }

    async fn fixture() -> Fixture {
        let overlay = MemoryOverlay::ideal();
        let hub = Arc::new(NotificationHub::new("inbound"));
        let inbox = EnvelopeCollector::new();
        hub.subscribe(inbox.clone());

        let fabric: Arc<dyn ExecutionFabric> =
            Arc::new(HostPool::new(Duration::from_millis(50), Handle::current()));
        let manager = SessionManager::new(hub, fabric, SessionConfig::default());

        let ad = Advertisement::new(
            PeerName::new("bob").unwrap(),
            ChannelAddress::generate(),
            ChannelKind::BiDi,
            Duration::from_secs(60),
        );
        overlay
            .node("bob")
            .accept_incoming(&ad, Arc::new(manager.clone()))
            .await
            .unwrap();

        Fixture {
            manager,
            inbox,
            opener: overlay.node("alice"),
            address: ad.address,
        }
    }

    fn text_frame(text: &str) -> WireMessage {
        Envelope::new_text("alice", "bob", text).unwrap().to_wire()
    }

    #[test]
    fn test_publish_inbound_skips_undecodable_frames() {
        let hub = NotificationHub::new("inbound");
        let corrupt = WireMessage {
            from: "alice".to_string(),
            to: "bob".to_string(),
            binary: Some(vec![1, 2, 3]),
            ..WireMessage::default()
        };
        assert!(!publish_inbound(&hub, corrupt));
        assert!(!publish_inbound(&hub, WireMessage::default()));
        assert!(publish_inbound(&hub, text_frame("ok")));
    }

    #[test]
    fn test_null_events_are_ignored() {
        assert!(event_message(None).is_none());
        let empty = ChannelEvent {
            address: ChannelAddress::generate(),
            message: None,
        };
        assert!(event_message(Some(empty)).is_none());
    }

    #[tokio::test]
    async fn test_session_publishes_frames() {
        let fx = fixture().await;
        let channel = fx
            .opener
            .open_channel(&fx.address, ChannelKind::BiDi, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(fx.manager.active_sessions(), 1);

        channel.send(&text_frame("one")).await.unwrap();
        channel.send(&text_frame("two")).await.unwrap();
        assert!(fx.inbox.wait_for(2, Duration::from_secs(1)).await);

        let texts: Vec<String> = fx
            .inbox
            .envelopes()
            .iter()
            .map(|e| e.text().unwrap().into_owned())
            .collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_respond_without_session() {
        let fx = fixture().await;
        let reply = Envelope::new_text("bob", "alice", "pong").unwrap();
        assert!(matches!(
            fx.manager.respond(&reply).await,
            Err(CourierError::NoSession)
        ));
    }

    #[tokio::test]
    async fn test_respond_skips_closed_sessions() {
        let fx = fixture().await;
        let replies = EnvelopeCollector::new();
        let hub = Arc::new(NotificationHub::new("responses"));
        hub.subscribe(replies.clone());
        let listener: Arc<dyn MessageListener> = Arc::new(ResponseListener::new(hub));

        let first = fx
            .opener
            .open_channel(
                &fx.address,
                ChannelKind::BiDi,
                Duration::from_secs(1),
                Some(listener.clone()),
            )
            .await
            .unwrap();
        let second = fx
            .opener
            .open_channel(&fx.address, ChannelKind::BiDi, Duration::from_secs(1), Some(listener))
            .await
            .unwrap();
        second.close();

        let reply = Envelope::new_text("bob", "alice", "pong").unwrap();
        fx.manager.respond(&reply).await.unwrap();
        assert!(replies.wait_for(1, Duration::from_secs(1)).await);
        assert!(first.is_bound());
    }

    #[tokio::test]
    async fn test_close_all_unbinds_channels() {
        let fx = fixture().await;
        let channel = fx
            .opener
            .open_channel(&fx.address, ChannelKind::BiDi, Duration::from_secs(1), None)
            .await
            .unwrap();

        assert_eq!(fx.manager.close_all(), 1);
        assert_eq!(fx.manager.active_sessions(), 0);
        assert!(!channel.is_bound());
    }
}

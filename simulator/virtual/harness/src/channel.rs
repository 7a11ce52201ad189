//! In-memory channels
//!
//! A [`MemoryChannel`] is one end of a link created when a node opens a
//! channel to an advertised endpoint. Frames sent on one end reach the
//! listener of the other end synchronously; frames that arrive before a
//! listener is attached are buffered and replayed once it is.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use courier_core::{
    Channel, ChannelAddress, ChannelEvent, ChannelKind, MessageListener, Result, TransportError,
    WireMessage,
};
use tracing::debug;

use crate::overlay::{Faults, NodeStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Opener,
    Acceptor,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Opener => 0,
            Side::Acceptor => 1,
        }
    }

    fn other(self) -> Side {
        match self {
            Side::Opener => Side::Acceptor,
            Side::Acceptor => Side::Opener,
        }
    }
}

#[derive(Default)]
struct Inbox {
    listener: Option<Arc<dyn MessageListener>>,
    pending: VecDeque<WireMessage>,
}

/// State shared by both ends of a link
struct Link {
    address: ChannelAddress,
    kind: ChannelKind,
    bound: AtomicBool,
    inboxes: [Mutex<Inbox>; 2],
}

impl Link {
    fn inbox(&self, side: Side) -> std::sync::MutexGuard<'_, Inbox> {
        self.inboxes[side.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, to: Side, message: WireMessage) {
        let listener = {
            let mut inbox = self.inbox(to);
            match inbox.listener.clone() {
                Some(listener) => listener,
                None => {
                    inbox.pending.push_back(message);
                    return;
                }
            }
        };
        listener.on_event(Some(ChannelEvent::new(self.address.clone(), message)));
    }

    fn attach(&self, side: Side, listener: Arc<dyn MessageListener>) {
        let pending: Vec<WireMessage> = {
            let mut inbox = self.inbox(side);
            inbox.listener = Some(listener.clone());
            inbox.pending.drain(..).collect()
        };
        for message in pending {
            listener.on_event(Some(ChannelEvent::new(self.address.clone(), message)));
        }
    }

    fn unbind(&self) {
        if self.bound.swap(false, Ordering::SeqCst) {
            debug!("Link {} unbound", self.address);
        }
        for side in [Side::Opener, Side::Acceptor] {
            let mut inbox = self.inbox(side);
            inbox.listener = None;
            inbox.pending.clear();
        }
    }
}

/// Fault and accounting hooks applied to frames sent from the opening node
#[derive(Clone)]
pub(crate) struct SendPolicy {
    pub(crate) faults: Arc<Faults>,
    pub(crate) stats: Arc<NodeStats>,
    pub(crate) drop_rate: f64,
}

// ----------------------------------------------------------------------------
// Memory Channel
// ----------------------------------------------------------------------------

pub struct MemoryChannel {
    link: Arc<Link>,
    side: Side,
    policy: Option<SendPolicy>,
}

impl MemoryChannel {
    /// Create both ends of a link. The opener end applies `policy` to its
    /// sends.
    pub(crate) fn pair(
        address: ChannelAddress,
        kind: ChannelKind,
        policy: SendPolicy,
    ) -> (MemoryChannel, MemoryChannel) {
        let link = Arc::new(Link {
            address,
            kind,
            bound: AtomicBool::new(true),
            inboxes: [Mutex::new(Inbox::default()), Mutex::new(Inbox::default())],
        });

        let opener = MemoryChannel {
            link: link.clone(),
            side: Side::Opener,
            policy: Some(policy),
        };
        let acceptor = MemoryChannel {
            link,
            side: Side::Acceptor,
            policy: None,
        };
        (opener, acceptor)
    }

    /// Frames waiting for a listener on this end
    pub fn pending(&self) -> usize {
        self.link.inbox(self.side).pending.len()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn address(&self) -> &ChannelAddress {
        &self.link.address
    }

    fn kind(&self) -> ChannelKind {
        self.link.kind
    }

    async fn send(&self, message: &WireMessage) -> Result<bool> {
        if !self.is_bound() {
            return Err(TransportError::NotBound {
                address: self.link.address.to_string(),
            }
            .into());
        }
        if self.side == Side::Acceptor && !self.link.kind.is_duplex() {
            return Err(TransportError::SendFailed {
                reason: format!("{} channel {} is one-way", self.link.kind, self.link.address),
            }
            .into());
        }

        if let Some(policy) = &self.policy {
            if policy.faults.take_send_failure() {
                policy.stats.record_dropped();
                if policy.faults.unbinds_on_failure() {
                    self.link.unbind();
                }
                return Ok(false);
            }
            if policy.drop_rate > 0.0 && fastrand::f64() < policy.drop_rate {
                policy.stats.record_dropped();
                return Ok(false);
            }
            policy.stats.record_sent();
        }

        self.link.deliver(self.side.other(), message.clone());
        Ok(true)
    }

    fn is_bound(&self) -> bool {
        self.link.bound.load(Ordering::SeqCst)
    }

    fn set_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.link.attach(self.side, listener);
    }

    fn close(&self) {
        self.link.unbind();
    }
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("address", &self.link.address)
            .field("kind", &self.link.kind)
            .field("side", &self.side)
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn policy() -> SendPolicy {
        SendPolicy {
            faults: Arc::new(Faults::default()),
            stats: Arc::new(NodeStats::default()),
            drop_rate: 0.0,
        }
    }

    fn frame(text: &str) -> WireMessage {
        WireMessage {
            from: "alice".to_string(),
            to: "bob".to_string(),
            payload: Some(text.to_string()),
            ..WireMessage::default()
        }
    }

    fn counting_listener() -> (Arc<AtomicUsize>, Arc<dyn MessageListener>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let listener: Arc<dyn MessageListener> = Arc::new(move |event: Option<ChannelEvent>| {
            if event.and_then(|e| e.message).is_some() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        (count, listener)
    }

    #[tokio::test]
    async fn test_frames_buffer_until_listener_attached() {
        let (opener, acceptor) =
            MemoryChannel::pair(ChannelAddress::generate(), ChannelKind::BiDi, policy());

        assert!(opener.send(&frame("one")).await.unwrap());
        assert!(opener.send(&frame("two")).await.unwrap());
        assert_eq!(acceptor.pending(), 2);

        let (count, listener) = counting_listener();
        acceptor.set_message_listener(listener);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(acceptor.pending(), 0);

        assert!(opener.send(&frame("three")).await.unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_duplex_reply_reaches_opener() {
        let (opener, acceptor) =
            MemoryChannel::pair(ChannelAddress::generate(), ChannelKind::BiDi, policy());
        let (count, listener) = counting_listener();
        opener.set_message_listener(listener);

        assert!(acceptor.send(&frame("reply")).await.unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_way_channel_refuses_reply() {
        let (_opener, acceptor) =
            MemoryChannel::pair(ChannelAddress::generate(), ChannelKind::Unicast, policy());
        assert!(acceptor.send(&frame("reply")).await.is_err());
    }

    #[tokio::test]
    async fn test_close_unbinds_both_ends() {
        let (opener, acceptor) =
            MemoryChannel::pair(ChannelAddress::generate(), ChannelKind::BiDi, policy());
        acceptor.close();
        acceptor.close();

        assert!(!opener.is_bound());
        assert!(opener.send(&frame("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure_can_unbind() {
        let policy = policy();
        policy.faults.fail_next_sends(1);
        policy.faults.set_unbind_on_failure(true);
        let stats = policy.stats.clone();
        let (opener, _acceptor) =
            MemoryChannel::pair(ChannelAddress::generate(), ChannelKind::BiDi, policy);

        assert!(!opener.send(&frame("lost")).await.unwrap());
        assert!(!opener.is_bound());
        assert_eq!(stats.frames_dropped(), 1);
    }
}

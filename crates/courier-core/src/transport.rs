//! Overlay transport contract
//!
//! The pipeline never talks to the network itself. It opens channels to
//! resolved addresses and accepts inbound connections through
//! [`OverlayTransport`], and moves frames through [`Channel`] handles.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::directory::{Advertisement, ChannelKind};
use crate::envelope::WireMessage;
use crate::errors::Result;
use crate::types::ChannelAddress;

// ----------------------------------------------------------------------------
// Listeners
// ----------------------------------------------------------------------------

/// Frame received on a channel
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    /// Address of the channel the frame arrived on
    pub address: ChannelAddress,
    pub message: Option<WireMessage>,
}

impl ChannelEvent {
    pub fn new(address: ChannelAddress, message: WireMessage) -> Self {
        Self {
            address,
            message: Some(message),
        }
    }
}

/// Callback invoked for every frame arriving on a channel.
///
/// Transports may deliver an absent event or an event without a message; the
/// listener is expected to tolerate both.
pub trait MessageListener: Send + Sync {
    fn on_event(&self, event: Option<ChannelEvent>);
}

/// Callback invoked for every accepted inbound connection
pub trait AcceptListener: Send + Sync {
    fn on_accept(&self, channel: ChannelHandle);
}

// ----------------------------------------------------------------------------
// Channel
// ----------------------------------------------------------------------------

/// Open overlay channel
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    fn address(&self) -> &ChannelAddress;

    fn kind(&self) -> ChannelKind;

    /// Send one frame. `Ok(false)` means the overlay refused the frame but the
    /// channel may still be usable.
    async fn send(&self, message: &WireMessage) -> Result<bool>;

    fn is_bound(&self) -> bool;

    /// Replace the listener receiving frames sent by the remote end
    fn set_message_listener(&self, listener: Arc<dyn MessageListener>);

    /// Unbind the channel and release its listener. Idempotent.
    fn close(&self);
}

pub type ChannelHandle = Arc<dyn Channel>;

// ----------------------------------------------------------------------------
// Overlay Transport
// ----------------------------------------------------------------------------

#[async_trait]
pub trait OverlayTransport: Send + Sync {
    /// Open a channel to a resolved address. Frames sent back by the remote end
    /// are handed to `listener` when one is given.
    async fn open_channel(
        &self,
        address: &ChannelAddress,
        kind: ChannelKind,
        timeout: Duration,
        listener: Option<Arc<dyn MessageListener>>,
    ) -> Result<ChannelHandle>;

    /// Register a callback invoked per connection accepted on the endpoint
    /// described by `advertisement`
    async fn accept_incoming(
        &self,
        advertisement: &Advertisement,
        listener: Arc<dyn AcceptListener>,
    ) -> Result<()>;
}

impl<F> MessageListener for F
where
    F: Fn(Option<ChannelEvent>) + Send + Sync,
{
    fn on_event(&self, event: Option<ChannelEvent>) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_closure_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn MessageListener> = Arc::new(move |event: Option<ChannelEvent>| {
            sink.lock().unwrap().push(event.and_then(|e| e.message).is_some());
        });

        let wire = WireMessage {
            from: "alice".to_string(),
            to: "bob".to_string(),
            payload: Some("hi".to_string()),
            ..WireMessage::default()
        };
        listener.on_event(Some(ChannelEvent::new(ChannelAddress::new("a"), wire)));
        listener.on_event(None);

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }
}

//! Peer: the public face of the pipeline
//!
//! A [`Peer`] composes the backlog, execution fabric, delivery workers, session
//! manager and the two notification hubs. Its [`PeerRole`] decides which halves
//! are active: a sender only dispatches, a receiver only accepts, a duplex peer
//! does both over bidirectional channels.
//!
//! Peers are started through [`PeerBuilder`], which validates configuration,
//! builds the fabric, registers the inbound endpoint and publishes the peer's
//! advertisement.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use courier_core::config::defaults;
use courier_core::{
    Advertisement, ChannelAddress, ChannelKind, CourierConfig, CourierError, DirectoryClient,
    DirectoryService, Envelope, MessageListener, MessageObserver, NotificationHub, OfferPolicy,
    OverlayTransport, PeerName, Result, SubscriptionId,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::backlog::BacklogQueue;
use crate::channels::ChannelPool;
use crate::fabric::{build_fabric, unit_of_work, ExecutionFabric, ShutdownReport};
use crate::session::{ResponseListener, SessionManager};
use crate::worker::{DeliveryContext, DeliveryStats, DeliveryStatsSnapshot, DeliveryWorker};

// ----------------------------------------------------------------------------
// Peer Role
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Dispatches over one-way channels, accepts nothing
    Sender,
    /// Accepts one-way channels, sends nothing
    Receiver,
    /// Dispatches and accepts over bidirectional channels
    Duplex,
}

impl PeerRole {
    pub fn sends(&self) -> bool {
        matches!(self, PeerRole::Sender | PeerRole::Duplex)
    }

    pub fn accepts(&self) -> bool {
        matches!(self, PeerRole::Receiver | PeerRole::Duplex)
    }

    /// Kind of channel this role opens and advertises
    pub fn channel_kind(&self) -> ChannelKind {
        match self {
            PeerRole::Duplex => ChannelKind::BiDi,
            PeerRole::Sender | PeerRole::Receiver => ChannelKind::Unicast,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Sender => write!(f, "sender"),
            PeerRole::Receiver => write!(f, "receiver"),
            PeerRole::Duplex => write!(f, "duplex"),
        }
    }
}

// ----------------------------------------------------------------------------
// Peer
// ----------------------------------------------------------------------------

pub struct Peer {
    name: PeerName,
    role: PeerRole,
    offer_policy: OfferPolicy,
    backlog: Arc<BacklogQueue>,
    retry: AtomicU32,
    fabric: Arc<dyn ExecutionFabric>,
    delivery: Arc<DeliveryContext>,
    sessions: SessionManager,
    inbound: Arc<NotificationHub>,
    sent: Arc<NotificationHub>,
    advertisement: Option<Advertisement>,
    destroyed: AtomicBool,
}

impl Peer {
    pub fn builder<T: Into<String>>(name: T) -> PeerBuilder {
        PeerBuilder::new(name)
    }

    pub fn name(&self) -> &PeerName {
        &self.name
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Advertisement published for this peer, if its role accepts connections
    pub fn advertisement(&self) -> Option<&Advertisement> {
        self.advertisement.as_ref()
    }

    /// Queue an envelope for asynchronous delivery.
    ///
    /// Returns once the backlog accepted the envelope. Delivery failures are not
    /// reported here; subscribe to sent notifications to observe completion.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        if !self.role.sends() {
            return Err(CourierError::invalid_argument(format!(
                "a {} peer cannot send",
                self.role
            )));
        }
        if self.destroyed.load(Ordering::SeqCst) || !self.fabric.is_accepting() {
            return Err(CourierError::execution_rejected(format!(
                "peer {} is shutting down",
                self.name
            )));
        }

        let accepted = match self.offer_policy {
            OfferPolicy::Reject => self.backlog.offer(envelope),
            OfferPolicy::Wait { timeout_ms } => {
                self.backlog
                    .offer_timeout(envelope, std::time::Duration::from_millis(timeout_ms))
                    .await
            }
        };
        if !accepted {
            return Err(CourierError::BacklogFull {
                capacity: self.backlog.capacity(),
            });
        }

        let context = self.delivery.clone();
        let backlog = self.backlog.clone();
        let retry = self.retry();
        let submitted = self.fabric.submit(
            "delivery-worker",
            unit_of_work(move |cancel| async move {
                DeliveryWorker::from_backlog(context, &backlog, retry, cancel)
                    .run()
                    .await;
            }),
        );

        // Every queued envelope needs a worker; without one, give the slot back
        if let Err(e) = submitted {
            if let Some(orphan) = self.backlog.take() {
                debug!("Withdrew {} after rejected submission", orphan);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Send an envelope immediately on the most recently accepted session,
    /// bypassing the backlog
    pub async fn send_response(&self, envelope: &Envelope) -> Result<()> {
        self.sessions.respond(envelope).await
    }

    /// Observe inbound envelopes
    pub fn subscribe(&self, observer: Arc<dyn MessageObserver>) -> SubscriptionId {
        self.inbound.subscribe(observer)
    }

    /// Observe "sent" acknowledgements of delivered envelopes
    pub fn subscribe_sent(&self, observer: Arc<dyn MessageObserver>) -> SubscriptionId {
        self.sent.subscribe(observer)
    }

    /// Remove a subscription from whichever hub holds it
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inbound.unsubscribe(id) || self.sent.unsubscribe(id)
    }

    /// Resize the backlog; shrinking discards the newest envelopes beyond the
    /// new size
    pub fn set_buffer_size(&self, size: usize) -> Result<()> {
        let discarded = self.backlog.set_capacity(size)?;
        if discarded > 0 {
            warn!("Peer {} discarded {} queued envelope(s) on resize", self.name, discarded);
        }
        Ok(())
    }

    /// Retry budget for envelopes sent from now on; zero restores the default
    pub fn set_retry(&self, retry: u32) {
        let retry = if retry == 0 { defaults::RETRY } else { retry };
        self.retry.store(retry, Ordering::SeqCst);
    }

    pub fn retry(&self) -> u32 {
        self.retry.load(Ordering::SeqCst)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active_sessions()
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.delivery.stats.snapshot()
    }

    /// Shut the peer down: close sessions, stop the fabric (graceful, then
    /// forced), clear the backlog and close pooled channels. Later calls do
    /// nothing.
    pub async fn destroy(&self) -> Option<ShutdownReport> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return None;
        }
        info!("Destroying peer {}", self.name);

        let sessions = self.sessions.close_all();
        let report = self.fabric.shutdown().await;
        let cleared = self.backlog.clear();
        let channels = self.delivery.channels.close_all();

        info!(
            "Peer {} destroyed: {} session(s), {} pooled channel(s) closed, {} queued envelope(s) discarded, {} unit(s) cancelled",
            self.name, sessions, channels, cleared, report.cancelled
        );
        Some(report)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("backlog", &self.backlog.len())
            .field("retry", &self.retry())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Peer Builder
// ----------------------------------------------------------------------------

pub struct PeerBuilder {
    name: String,
    role: PeerRole,
    config: CourierConfig,
    directory: Option<Arc<dyn DirectoryService>>,
    transport: Option<Arc<dyn OverlayTransport>>,
    host: Option<Handle>,
}

impl PeerBuilder {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            role: PeerRole::Duplex,
            config: CourierConfig::default(),
            directory: None,
            transport: None,
            host: None,
        }
    }

    pub fn with_role(mut self, role: PeerRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_config(mut self, config: CourierConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn DirectoryService>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn OverlayTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use one object as both directory service and transport
    pub fn with_overlay<O>(self, overlay: Arc<O>) -> Self
    where
        O: DirectoryService + OverlayTransport + 'static,
    {
        let directory: Arc<dyn DirectoryService> = overlay.clone();
        let transport: Arc<dyn OverlayTransport> = overlay;
        self.with_directory(directory).with_transport(transport)
    }

    /// Runtime used by the host-managed fabric
    pub fn with_host_runtime(mut self, handle: Handle) -> Self {
        self.host = Some(handle);
        self
    }

    /// Build the peer, register its inbound endpoint and publish its
    /// advertisement
    pub async fn start(self) -> Result<Peer> {
        let name = PeerName::new(self.name)?;
        self.config.validate().map_err(CourierError::config_error)?;
        let directory = self
            .directory
            .ok_or_else(|| CourierError::config_error("a directory service is required"))?;
        let transport = self
            .transport
            .ok_or_else(|| CourierError::config_error("an overlay transport is required"))?;

        let fabric = build_fabric(&self.config.fabric, self.host)?;
        let backlog = Arc::new(BacklogQueue::new(self.config.backlog.capacity)?);
        let inbound = Arc::new(NotificationHub::new("inbound"));
        let sent = Arc::new(NotificationHub::sharing_ids("sent", &inbound));
        let sessions = SessionManager::new(inbound.clone(), fabric.clone(), self.config.session.clone());

        let response_listener: Option<Arc<dyn MessageListener>> = match self.role {
            PeerRole::Duplex => Some(Arc::new(ResponseListener::new(inbound.clone()))),
            PeerRole::Sender | PeerRole::Receiver => None,
        };

        let delivery = Arc::new(DeliveryContext {
            local: name.clone(),
            channel_kind: self.role.channel_kind(),
            directory: DirectoryClient::new(directory.clone(), self.config.directory.clone()),
            transport: transport.clone(),
            channels: Arc::new(ChannelPool::new()),
            sent_hub: sent.clone(),
            response_listener,
            config: self.config.delivery.clone(),
            stats: Arc::new(DeliveryStats::default()),
        });

        let advertisement = if self.role.accepts() {
            let advertisement = Advertisement::new(
                name.clone(),
                ChannelAddress::generate(),
                self.role.channel_kind(),
                self.config.directory.advertisement_lifetime(),
            );
            transport
                .accept_incoming(&advertisement, Arc::new(sessions.clone()))
                .await?;
            directory.publish(advertisement.clone()).await?;
            debug!("Published {} on {}", name, advertisement.address);
            Some(advertisement)
        } else {
            None
        };

        let retry = if self.config.delivery.retry == 0 {
            defaults::RETRY
        } else {
            self.config.delivery.retry
        };

        info!("Peer {} started as {}", name, self.role);
        Ok(Peer {
            name,
            role: self.role,
            offer_policy: self.config.backlog.offer_policy,
            backlog,
            retry: AtomicU32::new(retry),
            fabric,
            delivery,
            sessions,
            inbound,
            sent,
            advertisement,
            destroyed: AtomicBool::new(false),
        })
    }
}

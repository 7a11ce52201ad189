//! In-memory overlay network
//!
//! A [`MemoryOverlay`] is a shared registry of advertisements and listening
//! endpoints. Each peer gets its own [`MemoryNode`], which implements both
//! [`DirectoryService`] and [`OverlayTransport`] with a private local cache,
//! like a real overlay where remote answers arrive in the background.
//!
//! Nodes expose fault injection for tests: failing sends, unbinding on
//! failure, an unavailable directory and refused channel opens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::directory::NAME_ATTRIBUTE;
use courier_core::{
    AcceptListener, Advertisement, Channel, ChannelAddress, ChannelHandle, ChannelKind,
    CourierError, DirectoryService, MessageListener, NameFilter, OverlayTransport, PeerName, Result,
};
use tracing::{debug, info};

use crate::channel::{MemoryChannel, SendPolicy};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Overlay Configuration
// ----------------------------------------------------------------------------

/// Network behaviour shared by every node of an overlay
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayConfig {
    /// Delay before answers to a remote query land in the asking node's cache
    pub propagation_delay: Duration,
    /// Probability that a frame sent by an opener is lost (0.0 = never)
    pub drop_rate: f64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self::ideal()
    }
}

impl OverlayConfig {
    /// Instant propagation, no loss
    pub fn ideal() -> Self {
        Self {
            propagation_delay: Duration::ZERO,
            drop_rate: 0.0,
        }
    }

    /// Frames are lost with the given probability
    pub fn lossy(drop_rate: f64) -> Self {
        Self {
            drop_rate: drop_rate.clamp(0.0, 1.0),
            ..Self::ideal()
        }
    }

    /// Remote query answers take `delay` to arrive
    pub fn slow_directory(delay: Duration) -> Self {
        Self {
            propagation_delay: delay,
            ..Self::ideal()
        }
    }
}

// ----------------------------------------------------------------------------
// Node Statistics and Faults
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct NodeStats {
    local_queries: AtomicU64,
    remote_queries: AtomicU64,
    channels_opened: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl NodeStats {
    pub fn local_queries(&self) -> u64 {
        self.local_queries.load(Ordering::Relaxed)
    }

    pub fn remote_queries(&self) -> u64 {
        self.remote_queries.load(Ordering::Relaxed)
    }

    pub fn channels_opened(&self) -> u64 {
        self.channels_opened.load(Ordering::Relaxed)
    }

    /// Frames handed to the remote end
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Frames lost to injected failures or the drop rate
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub(crate) struct Faults {
    failing_sends: AtomicU32,
    unbind_on_failure: AtomicBool,
    directory_down: AtomicBool,
    refuse_open: AtomicBool,
}

impl Faults {
    pub(crate) fn fail_next_sends(&self, count: u32) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_unbind_on_failure(&self, enabled: bool) {
        self.unbind_on_failure.store(enabled, Ordering::SeqCst);
    }

    /// Consume one injected send failure, if any are left
    pub(crate) fn take_send_failure(&self) -> bool {
        self.failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn unbinds_on_failure(&self) -> bool {
        self.unbind_on_failure.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Memory Overlay
// ----------------------------------------------------------------------------

struct Endpoint {
    owner: PeerName,
    kind: ChannelKind,
    listener: Arc<dyn AcceptListener>,
}

struct OverlayState {
    config: OverlayConfig,
    registry: Mutex<Vec<Advertisement>>,
    endpoints: Mutex<HashMap<ChannelAddress, Endpoint>>,
}

/// Shared in-memory network; cheap to clone
#[derive(Clone)]
pub struct MemoryOverlay {
    state: Arc<OverlayState>,
}

impl MemoryOverlay {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            state: Arc::new(OverlayState {
                config,
                registry: Mutex::new(Vec::new()),
                endpoints: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn ideal() -> Self {
        Self::new(OverlayConfig::ideal())
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.state.config
    }

    /// Attach a node with an empty cache
    pub fn node<T: Into<String>>(&self, name: T) -> Arc<MemoryNode> {
        Arc::new(MemoryNode {
            name: name.into(),
            state: self.state.clone(),
            cache: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Faults::default()),
            stats: Arc::new(NodeStats::default()),
        })
    }

    /// Every advertisement published so far
    pub fn advertisements(&self) -> Vec<Advertisement> {
        lock(&self.state.registry).clone()
    }

    /// Remove a peer's advertisements and endpoints, as if it left the
    /// overlay. Caches that already hold its advertisements keep them.
    pub fn withdraw(&self, name: &str) -> usize {
        let mut registry = lock(&self.state.registry);
        let before = registry.len();
        registry.retain(|ad| ad.name.as_str() != name);
        let removed = before - registry.len();
        drop(registry);

        lock(&self.state.endpoints).retain(|_, endpoint| endpoint.owner.as_str() != name);
        info!("Withdrew {} advertisement(s) of {}", removed, name);
        removed
    }
}

impl Default for MemoryOverlay {
    fn default() -> Self {
        Self::ideal()
    }
}

// ----------------------------------------------------------------------------
// Memory Node
// ----------------------------------------------------------------------------

/// One peer's view of the overlay
pub struct MemoryNode {
    name: String,
    state: Arc<OverlayState>,
    cache: Arc<Mutex<Vec<Advertisement>>>,
    faults: Arc<Faults>,
    stats: Arc<NodeStats>,
}

impl MemoryNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// The next `count` sends on channels opened by this node report failure
    pub fn fail_next_sends(&self, count: u32) {
        self.faults.fail_next_sends(count);
    }

    /// Unbind the channel whenever an injected send failure fires
    pub fn unbind_on_failure(&self, enabled: bool) {
        self.faults.set_unbind_on_failure(enabled);
    }

    /// Make every directory call fail while unavailable
    pub fn set_directory_available(&self, available: bool) {
        self.faults.directory_down.store(!available, Ordering::SeqCst);
    }

    /// Refuse every channel open while set
    pub fn refuse_channels(&self, refuse: bool) {
        self.faults.refuse_open.store(refuse, Ordering::SeqCst);
    }

    /// Advertisements in this node's cache
    pub fn cached(&self) -> usize {
        lock(&self.cache).len()
    }

    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
    }

    fn ensure_directory(&self) -> Result<()> {
        if self.faults.directory_down.load(Ordering::SeqCst) {
            return Err(CourierError::directory_unavailable(format!(
                "directory unreachable from {}",
                self.name
            )));
        }
        Ok(())
    }

    fn send_policy(&self) -> SendPolicy {
        SendPolicy {
            faults: self.faults.clone(),
            stats: self.stats.clone(),
            drop_rate: self.state.config.drop_rate,
        }
    }
}

fn cache_insert(cache: &Mutex<Vec<Advertisement>>, answers: Vec<Advertisement>) {
    let mut cache = lock(cache);
    for answer in answers {
        cache.retain(|ad| ad.address != answer.address);
        cache.push(answer);
    }
}

#[async_trait]
impl DirectoryService for MemoryNode {
    async fn publish(&self, advertisement: Advertisement) -> Result<()> {
        self.ensure_directory()?;
        debug!("{} publishes {} on {}", self.name, advertisement.name, advertisement.address);

        {
            let mut registry = lock(&self.state.registry);
            registry.retain(|ad| ad.address != advertisement.address);
            registry.push(advertisement.clone());
        }
        cache_insert(&self.cache, vec![advertisement]);
        Ok(())
    }

    fn query_local(&self, kind: ChannelKind, filter: &NameFilter) -> Result<Vec<Advertisement>> {
        self.ensure_directory()?;
        self.stats.local_queries.fetch_add(1, Ordering::Relaxed);

        Ok(lock(&self.cache)
            .iter()
            .filter(|ad| ad.kind == kind && filter.matches(&ad.name))
            .cloned()
            .collect())
    }

    async fn query_remote(
        &self,
        peer: Option<&PeerName>,
        kind: ChannelKind,
        attribute: &str,
        value: &str,
        threshold: u32,
    ) -> Result<()> {
        self.ensure_directory()?;
        self.stats.remote_queries.fetch_add(1, Ordering::Relaxed);
        if attribute != NAME_ATTRIBUTE {
            debug!("{} ignores query on unknown attribute {}", self.name, attribute);
            return Ok(());
        }

        let filter = NameFilter::parse(value);
        let answers: Vec<Advertisement> = lock(&self.state.registry)
            .iter()
            .filter(|ad| ad.kind == kind && filter.matches(&ad.name))
            .filter(|ad| peer.map_or(true, |peer| &ad.name == peer))
            .take(threshold as usize)
            .cloned()
            .collect();
        debug!("{} remote query for {} found {} answer(s)", self.name, filter, answers.len());

        let delay = self.state.config.propagation_delay;
        if delay.is_zero() {
            cache_insert(&self.cache, answers);
        } else {
            let cache = self.cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                cache_insert(&cache, answers);
            });
        }
        Ok(())
    }

    async fn wait_for_connectivity(&self, timeout: Duration) -> bool {
        tokio::time::sleep(timeout).await;
        !self.faults.directory_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OverlayTransport for MemoryNode {
    async fn open_channel(
        &self,
        address: &ChannelAddress,
        kind: ChannelKind,
        _timeout: Duration,
        listener: Option<Arc<dyn MessageListener>>,
    ) -> Result<ChannelHandle> {
        if self.faults.refuse_open.load(Ordering::SeqCst) {
            return Err(CourierError::open_failed(address.as_str(), "channel refused"));
        }

        let accept = {
            let endpoints = lock(&self.state.endpoints);
            let endpoint = endpoints
                .get(address)
                .ok_or_else(|| CourierError::open_failed(address.as_str(), "nothing listening"))?;
            if endpoint.kind != kind {
                return Err(CourierError::open_failed(
                    address.as_str(),
                    format!("endpoint accepts {} channels, not {}", endpoint.kind, kind),
                ));
            }
            endpoint.listener.clone()
        };

        let (local, remote) = MemoryChannel::pair(address.clone(), kind, self.send_policy());
        if let Some(listener) = listener {
            local.set_message_listener(listener);
        }
        self.stats.channels_opened.fetch_add(1, Ordering::Relaxed);
        debug!("{} opened {} channel to {}", self.name, kind, address);

        accept.on_accept(Arc::new(remote));
        Ok(Arc::new(local))
    }

    async fn accept_incoming(
        &self,
        advertisement: &Advertisement,
        listener: Arc<dyn AcceptListener>,
    ) -> Result<()> {
        let mut endpoints = lock(&self.state.endpoints);
        if endpoints.contains_key(&advertisement.address) {
            return Err(CourierError::open_failed(
                advertisement.address.as_str(),
                "address already bound",
            ));
        }

        endpoints.insert(
            advertisement.address.clone(),
            Endpoint {
                owner: advertisement.name.clone(),
                kind: advertisement.kind,
                listener,
            },
        );
        Ok(())
    }
}

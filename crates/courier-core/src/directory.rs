//! Directory client
//!
//! Resolves a destination name to the advertisements currently published for
//! it. The external directory service is consumed through the
//! [`DirectoryService`] trait; [`DirectoryClient`] layers the resolution policy
//! on top: local cache first, then a bounded remote query, a bounded wait for
//! connectivity, and a second local lookup.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use smallvec::SmallVec;
use tracing::debug;

use crate::config::{defaults, DirectoryConfig};
use crate::errors::Result;
use crate::types::{ChannelAddress, PeerName};

/// Attribute name used for remote queries by advertisement name
pub const NAME_ATTRIBUTE: &str = "Name";

// ----------------------------------------------------------------------------
// Advertisement
// ----------------------------------------------------------------------------

/// Kind of channel an advertisement offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChannelKind {
    /// One-way, point to point
    Unicast,
    /// One-way, point to point, encrypted by the overlay
    UnicastSecure,
    /// One-to-many
    Propagate,
    /// Duplex
    BiDi,
}

impl ChannelKind {
    pub fn is_duplex(&self) -> bool {
        matches!(self, ChannelKind::BiDi)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Unicast => write!(f, "unicast"),
            ChannelKind::UnicastSecure => write!(f, "unicast-secure"),
            ChannelKind::Propagate => write!(f, "propagate"),
            ChannelKind::BiDi => write!(f, "bidi"),
        }
    }
}

/// Directory record mapping a name to a reachable address.
///
/// Owned by the directory service; the client only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: PeerName,
    pub address: ChannelAddress,
    pub kind: ChannelKind,
    pub expires_at: Instant,
}

impl Advertisement {
    /// Lifetimes beyond [`defaults::MAX_ADVERTISEMENT_LIFETIME_SECS`] are capped
    pub fn new(name: PeerName, address: ChannelAddress, kind: ChannelKind, lifetime: Duration) -> Self {
        let lifetime = lifetime.min(Duration::from_secs(defaults::MAX_ADVERTISEMENT_LIFETIME_SECS));
        Self {
            name,
            address,
            kind,
            expires_at: Instant::now() + lifetime,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

// ----------------------------------------------------------------------------
// Name Filter
// ----------------------------------------------------------------------------

/// Name matching used by local cache lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameFilter {
    Any,
    Exact(String),
    /// `*substring*`, case-sensitive containment
    Contains(String),
}

impl NameFilter {
    /// Parse a filter expression. Empty means any name; `*x*` means names
    /// containing `x`; anything else is an exact match.
    pub fn parse(expression: &str) -> Self {
        if expression.is_empty() || expression == "*" || expression == "**" {
            return NameFilter::Any;
        }

        match expression
            .strip_prefix('*')
            .and_then(|rest| rest.strip_suffix('*'))
        {
            Some(inner) => NameFilter::Contains(inner.to_string()),
            None => NameFilter::Exact(expression.to_string()),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameFilter::Any => true,
            NameFilter::Exact(expected) => name == expected,
            NameFilter::Contains(fragment) => name.contains(fragment.as_str()),
        }
    }
}

impl fmt::Display for NameFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameFilter::Any => write!(f, "*"),
            NameFilter::Exact(name) => write!(f, "{}", name),
            NameFilter::Contains(fragment) => write!(f, "*{}*", fragment),
        }
    }
}

// ----------------------------------------------------------------------------
// Directory Service Contract
// ----------------------------------------------------------------------------

/// External directory service consumed by the pipeline
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Announce a nameable endpoint
    async fn publish(&self, advertisement: Advertisement) -> Result<()>;

    /// Synchronous lookup in the local cache
    fn query_local(&self, kind: ChannelKind, filter: &NameFilter) -> Result<Vec<Advertisement>>;

    /// Broadcast a query whose answers feed the local cache later on
    async fn query_remote(
        &self,
        peer: Option<&PeerName>,
        kind: ChannelKind,
        attribute: &str,
        value: &str,
        threshold: u32,
    ) -> Result<()>;

    /// Best-effort wait for overlay reachability
    async fn wait_for_connectivity(&self, timeout: Duration) -> bool;
}

// ----------------------------------------------------------------------------
// Directory Client
// ----------------------------------------------------------------------------

/// Local-cache-first resolver over a [`DirectoryService`]
#[derive(Clone)]
pub struct DirectoryClient {
    service: Arc<dyn DirectoryService>,
    config: DirectoryConfig,
}

impl DirectoryClient {
    pub fn new(service: Arc<dyn DirectoryService>, config: DirectoryConfig) -> Self {
        Self { service, config }
    }

    pub fn service(&self) -> &Arc<dyn DirectoryService> {
        &self.service
    }

    /// Resolve a destination name (exact or `*substring*`) to fresh
    /// advertisements of the given kind.
    ///
    /// Returns an empty list when nothing is found. Only a failing directory
    /// service produces an error (`DirectoryUnavailable`).
    pub async fn resolve(&self, name: &str, kind: ChannelKind) -> Result<Vec<Advertisement>> {
        let filter = NameFilter::parse(name);

        let cached = self.lookup_local(kind, &filter)?;
        if !cached.is_empty() {
            debug!("Resolved {} from local cache ({} entries)", filter, cached.len());
            return Ok(cached.into_vec());
        }

        debug!(
            "Querying remote directory for {} (kind {}, threshold {})",
            filter, kind, self.config.query_threshold
        );
        self.service
            .query_remote(None, kind, NAME_ATTRIBUTE, name, self.config.query_threshold)
            .await?;
        self.service
            .wait_for_connectivity(self.config.connectivity_wait())
            .await;

        let found = self.lookup_local(kind, &filter)?;
        debug!("Resolved {} after remote query ({} entries)", filter, found.len());
        Ok(found.into_vec())
    }

    fn lookup_local(
        &self,
        kind: ChannelKind,
        filter: &NameFilter,
    ) -> Result<SmallVec<[Advertisement; 4]>> {
        let now = Instant::now();
        Ok(self
            .service
            .query_local(kind, filter)?
            .into_iter()
            .filter(|ad| ad.kind == kind && filter.matches(&ad.name) && ad.is_fresh(now))
            .collect())
    }
}

impl fmt::Debug for DirectoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

//! Courier Core
//!
//! Foundational types for the Courier reliable asynchronous delivery pipeline:
//! the typed [`Envelope`] and its wire frame, the [`DirectoryClient`] that
//! resolves destination names, the overlay transport contract, the
//! [`NotificationHub`], configuration and errors.
//!
//! The pipeline itself (backlog, execution fabric, delivery workers, sessions)
//! lives in `courier-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod directory;
pub mod envelope;
pub mod errors;
pub mod hub;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    BacklogConfig, CourierConfig, DeliveryConfig, DirectoryConfig, FabricConfig, FabricKind,
    LogConfig, LogLevel, OfferPolicy, SessionConfig,
};
pub use directory::{Advertisement, ChannelKind, DirectoryClient, DirectoryService, NameFilter};
pub use envelope::{Envelope, EnvelopeKind, ObjectBlob, WireMessage};
pub use errors::{CourierError, CourierResult, DecodeError, Result, TransportError};
pub use hub::{sent_acknowledgement, MessageObserver, NotificationHub, SENT_MARKER};
pub use transport::{
    AcceptListener, Channel, ChannelEvent, ChannelHandle, MessageListener, OverlayTransport,
};
pub use types::{ChannelAddress, PeerName, SessionId, SubscriptionId};

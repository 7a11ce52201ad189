//! Courier Runtime
//!
//! The delivery pipeline built on `courier-core`:
//! - `BacklogQueue`: bounded FIFO of envelopes awaiting dispatch
//! - `ExecutionFabric`: pluggable pool running workers and sessions, with
//!   two-phase shutdown
//! - `DeliveryWorker`: resolve, send and retransmit one envelope
//! - `SessionManager`: accept inbound connections and publish what arrives
//! - `Peer`: composes the above behind `send`, `subscribe` and `destroy`

pub mod backlog;
pub mod channels;
pub mod fabric;
pub mod peer;
pub mod session;
pub mod worker;

pub use backlog::BacklogQueue;
pub use channels::ChannelPool;
pub use fabric::{
    build_fabric, unit_of_work, CancelToken, CancelTrigger, ExecutionFabric, FixedPool, HostPool,
    ShutdownReport, UnitOfWork,
};
pub use peer::{Peer, PeerBuilder, PeerRole};
pub use session::{publish_inbound, ResponseListener, SessionManager};
pub use worker::{
    DeliveryContext, DeliveryOutcome, DeliveryState, DeliveryStats, DeliveryStatsSnapshot,
    DeliveryWorker,
};

// Re-export core types for convenience
pub use courier_core::{
    CourierConfig, CourierError, CourierResult, Envelope, EnvelopeKind, MessageObserver,
    NotificationHub, PeerName, SubscriptionId,
};

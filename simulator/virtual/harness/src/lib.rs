//! Courier Harness - In-Memory Overlay for Testing
//!
//! Provides an overlay network that lives entirely in process, so peers can be
//! exercised end to end without a real directory or transport.
//!
//! # Overview
//!
//! - **MemoryOverlay**: shared registry of advertisements and listening endpoints
//! - **MemoryNode**: one peer's directory cache and transport, with fault injection
//! - **MemoryChannel**: linked channel ends with buffered delivery
//! - **EnvelopeCollector**: observer that records envelopes and waits for arrivals
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use courier_harness::{EnvelopeCollector, MemoryOverlay};
//! use courier_runtime::{CourierConfig, Envelope, Peer, PeerRole};
//! use std::time::Duration;
//!
//! #[tokio::test]
//! async fn test_basic_delivery() {
//!     let overlay = MemoryOverlay::ideal();
//!     let bob = Peer::builder("bob")
//!         .with_config(CourierConfig::testing())
//!         .with_overlay(overlay.node("bob"))
//!         .start()
//!         .await
//!         .unwrap();
//!     let alice = Peer::builder("alice")
//!         .with_config(CourierConfig::testing())
//!         .with_overlay(overlay.node("alice"))
//!         .start()
//!         .await
//!         .unwrap();
//!
//!     let inbox = EnvelopeCollector::new();
//!     bob.subscribe(inbox.clone());
//!     alice.send(Envelope::new_text("alice", "bob", "hello").unwrap()).await.unwrap();
//!
//!     assert!(inbox.wait_for(1, Duration::from_secs(1)).await);
//! }
//! ```
//!
//! # Fault Injection
//!
//! - **Failing sends**: `fail_next_sends(n)` makes the next `n` sends report failure
//! - **Unbinding**: `unbind_on_failure(true)` unbinds the channel on those failures
//! - **Directory outage**: `set_directory_available(false)` fails every query
//! - **Refused opens**: `refuse_channels(true)` fails every channel open
//! - **Loss and latency**: `OverlayConfig::lossy` and `OverlayConfig::slow_directory`

pub mod channel;
pub mod collector;
pub mod overlay;

pub use channel::MemoryChannel;
pub use collector::EnvelopeCollector;
pub use overlay::{MemoryNode, MemoryOverlay, NodeStats, OverlayConfig};

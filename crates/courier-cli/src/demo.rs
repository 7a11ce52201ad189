//! In-memory delivery demo
//!
//! Starts two duplex peers, `alice` and `bob`, on a [`MemoryOverlay`] and sends
//! a round-robin mix of binary, text and object envelopes from alice to bob.
//! Bob answers the last envelope in place with `send_response`. Sends back off
//! while alice's backlog is full, so any number of envelopes can be queued.

use std::time::Duration;

use courier_core::CourierConfig;
use courier_harness::{EnvelopeCollector, MemoryOverlay, OverlayConfig};
use courier_runtime::{CourierError, DeliveryStatsSnapshot, Envelope, Peer, PeerRole};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sequence: u32,
    pub celsius: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemoOptions {
    pub messages: u32,
    pub retry: Option<u32>,
    pub loss: f64,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            messages: 7,
            retry: None,
            loss: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub sent: u32,
    pub received: usize,
    pub acknowledged: usize,
    pub replied: bool,
    pub stats: DeliveryStatsSnapshot,
}

impl DemoReport {
    pub fn all_delivered(&self) -> bool {
        self.received == self.sent as usize
    }
}

fn demo_envelope(i: u32) -> Result<Envelope> {
    let envelope = match i % 3 {
        0 => Envelope::new_binary("alice", "bob", format!("frame-{:04}", i).as_bytes())?,
        1 => Envelope::new_text("alice", "bob", format!("hello #{}", i))?,
        _ => Envelope::new_object(
            "alice",
            "bob",
            &SensorReading {
                sequence: i,
                celsius: 20.0 + i as f32 / 10.0,
            },
        )?,
    };
    Ok(envelope)
}

/// Upper bound on how long one envelope can take to settle
fn settle_time(config: &CourierConfig, retry: u32) -> Duration {
    let lookups = config
        .directory
        .connectivity_wait()
        .saturating_mul(retry.saturating_add(1));
    let sleeps = config
        .delivery
        .retry_interval()
        .saturating_mul(retry.saturating_mul(2));
    lookups
        .saturating_add(sleeps)
        .saturating_add(config.delivery.channel_open_timeout())
        .saturating_add(Duration::from_secs(1))
}

const PACE_INTERVAL: Duration = Duration::from_millis(5);

/// Send, waiting for backlog space for up to `patience`
async fn send_paced(peer: &Peer, envelope: Envelope, patience: Duration) -> Result<()> {
    let deadline = Instant::now().checked_add(patience);
    loop {
        match peer.send(envelope.clone()).await {
            Ok(()) => return Ok(()),
            Err(CourierError::BacklogFull { capacity })
                if deadline.map_or(true, |deadline| Instant::now() < deadline) =>
            {
                debug!("Backlog full ({} queued), pacing {}", capacity, envelope);
                tokio::time::sleep(PACE_INTERVAL).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn start_peer(overlay: &MemoryOverlay, name: &str, config: &CourierConfig) -> Result<Peer> {
    let peer = Peer::builder(name)
        .with_role(PeerRole::Duplex)
        .with_config(config.clone())
        .with_overlay(overlay.node(name))
        .start()
        .await?;
    Ok(peer)
}

pub async fn run_demo(config: &CourierConfig, options: &DemoOptions) -> Result<DemoReport> {
    let overlay = MemoryOverlay::new(OverlayConfig::lossy(options.loss));
    let bob = start_peer(&overlay, "bob", config).await?;
    let alice = start_peer(&overlay, "alice", config).await?;
    if let Some(retry) = options.retry {
        alice.set_retry(retry);
    }

    let inbox = EnvelopeCollector::new();
    let acks = EnvelopeCollector::new();
    let replies = EnvelopeCollector::new();
    bob.subscribe(inbox.clone());
    alice.subscribe_sent(acks.clone());
    alice.subscribe(replies.clone());

    let patience = settle_time(config, alice.retry());
    for i in 0..options.messages {
        let envelope = demo_envelope(i)?;
        info!("Sending {}", envelope);
        send_paced(&alice, envelope, patience).await?;
    }

    let expected = options.messages as usize;
    let budget = settle_time(config, alice.retry()).saturating_mul(options.messages.max(1));
    if !inbox.wait_for(expected, budget).await {
        warn!("Only {} of {} envelopes arrived", inbox.len(), expected);
    }
    acks.wait_for(inbox.len(), Duration::from_millis(500)).await;

    let mut replied = false;
    if !inbox.is_empty() {
        let reply = Envelope::new_text("bob", "alice", format!("received {}", inbox.len()))?;
        match bob.send_response(&reply).await {
            Ok(()) => replied = replies.wait_for(1, Duration::from_secs(1)).await,
            Err(e) => warn!("Reply failed: {}", e),
        }
    }

    for envelope in inbox.envelopes() {
        info!("bob received {}", envelope);
    }

    let report = DemoReport {
        sent: options.messages,
        received: inbox.len(),
        acknowledged: acks.len(),
        replied,
        stats: alice.stats(),
    };

    alice.destroy().await;
    bob.destroy().await;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_delivers_everything() {
        let report = run_demo(&CourierConfig::testing(), &DemoOptions::default())
            .await
            .unwrap();

        assert!(report.all_delivered());
        assert_eq!(report.acknowledged, 7);
        assert!(report.replied);
        assert_eq!(report.stats.delivered, 7);
    }

    #[tokio::test]
    async fn test_demo_paces_sends_beyond_backlog_capacity() {
        let mut config = CourierConfig::testing();
        config.backlog.capacity = 2;
        config.fabric.kind = courier_core::FabricKind::FixedPool { workers: 1 };
        let options = DemoOptions {
            messages: 9,
            ..DemoOptions::default()
        };

        let report = run_demo(&config, &options).await.unwrap();
        assert!(report.all_delivered());
        assert_eq!(report.stats.delivered, 9);
    }

    #[tokio::test]
    async fn test_demo_with_no_messages() {
        let options = DemoOptions {
            messages: 0,
            ..DemoOptions::default()
        };
        let report = run_demo(&CourierConfig::testing(), &options).await.unwrap();

        assert_eq!(report.received, 0);
        assert!(!report.replied);
    }

    #[test]
    fn test_envelope_mix() {
        let kinds: Vec<_> = (0..3).map(|i| demo_envelope(i).unwrap().kind()).collect();
        assert_eq!(
            kinds,
            vec![
                courier_core::EnvelopeKind::Binary,
                courier_core::EnvelopeKind::Text,
                courier_core::EnvelopeKind::Object
            ]
        );
    }
}

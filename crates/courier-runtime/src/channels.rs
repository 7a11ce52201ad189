//! Pool of open duplex channels, keyed by destination
//!
//! Duplex channels that delivered successfully stay open so later envelopes to
//! the same destination skip the open step. Channels that fail or unbind are
//! removed and closed.

use std::sync::Arc;

use courier_core::{ChannelHandle, PeerName};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ChannelPool {
    channels: DashMap<PeerName, ChannelHandle>,
}

impl ChannelPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound channel for a destination, evicting a stale entry
    pub fn get(&self, destination: &PeerName) -> Option<ChannelHandle> {
        let channel = self.channels.get(destination).map(|entry| entry.value().clone())?;
        if channel.is_bound() {
            return Some(channel);
        }

        debug!("Evicting unbound channel to {}", destination);
        self.evict(destination, &channel);
        None
    }

    /// Keep a channel that just delivered. When another bound channel to the
    /// same destination is already pooled, the new one is closed instead.
    pub fn put(&self, destination: PeerName, channel: ChannelHandle) {
        let redundant = match self.channels.entry(destination) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if Arc::ptr_eq(existing, &channel) {
                    None
                } else if existing.is_bound() {
                    Some(channel)
                } else {
                    Some(entry.insert(channel))
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(channel);
                None
            }
        };

        if let Some(channel) = redundant {
            channel.close();
        }
    }

    /// Remove and close `channel` if it is the one pooled for `destination`
    pub fn evict(&self, destination: &PeerName, channel: &ChannelHandle) {
        self.channels
            .remove_if(destination, |_, pooled| Arc::ptr_eq(pooled, channel));
        channel.close();
    }

    /// Close every pooled channel
    pub fn close_all(&self) -> usize {
        let drained: Vec<ChannelHandle> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.channels.clear();

        for channel in &drained {
            channel.close();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

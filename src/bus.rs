use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};

/// Interception events consumed by the observer panel.
pub const PROMPT_CHANNEL: &str = "prompt_intercept";
/// Agent activity events (timing, errors) from the activity monitor.
pub const ACTIVITY_CHANNEL: &str = "agent_activity";
/// Per-request trace events, only populated in dev mode.
pub const DEBUG_CHANNEL: &str = "debug_traces";

const DEFAULT_CAPACITY: usize = 256;

/// Named-channel publish/subscribe bus.
///
/// Backed by in-process broadcast channels. Publishing never blocks: a
/// subscriber that falls more than the channel capacity behind skips the
/// overwritten messages and is told how many it missed. Delivery is
/// at-most-once; events published before a subscriber attaches are not
/// replayed.
#[derive(Debug, Clone)]
pub struct ObserverBus {
    capacity: usize,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
}

impl Default for ObserverBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish a JSON-serializable payload. Fire-and-forget: having no
    /// subscribers is not an error, and serialization failures are logged
    /// and swallowed (observer events are advisory).
    pub async fn publish<T: Serialize>(&self, channel: &str, payload: &T) {
        match serde_json::to_string(payload) {
            Ok(json) => self.publish_raw(channel, json).await,
            Err(err) => warn!("Dropping unserializable event on '{channel}': {err}"),
        }
    }

    pub async fn publish_raw(&self, channel: &str, payload: String) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(channel) {
            // Err means every subscriber is gone; nothing to deliver.
            let _ = tx.send(payload);
        }
    }

    /// Subscribe to a channel. One message per publish, in publish order.
    /// Dropping the receiver unsubscribes.
    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

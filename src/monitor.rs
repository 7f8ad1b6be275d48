use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::bus::{ACTIVITY_CHANNEL, ObserverBus};

/// Agent activity monitoring with automatic timing.
///
/// Timing state machine, keyed by `agent:session:base`:
/// - `X_start` captures a monotonic timestamp
/// - `X_complete` / `X_error` reads and removes it, attaching `duration_ms`
///
/// Purely observational; never gates request handling.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    bus: ObserverBus,
    enabled: bool,
    timers: Arc<Mutex<HashMap<String, Instant>>>,
}

impl ActivityMonitor {
    pub fn new(bus: ObserverBus, enabled: bool) -> Self {
        Self {
            bus,
            enabled,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn publish(
        &self,
        agent: &str,
        session_id: &str,
        model: &str,
        state: &str,
        mut data: Value,
    ) {
        if !self.enabled {
            return;
        }

        if let Some(base) = state.strip_suffix("_start") {
            let key = format!("{agent}:{session_id}:{base}");
            self.timers.lock().await.insert(key, Instant::now());
        } else if let Some(base) = state
            .strip_suffix("_complete")
            .or_else(|| state.strip_suffix("_error"))
        {
            let key = format!("{agent}:{session_id}:{base}");
            if let Some(started) = self.timers.lock().await.remove(&key)
                && let Some(map) = data.as_object_mut()
            {
                let duration_ms = started.elapsed().as_millis() as u64;
                map.insert("duration_ms".into(), json!(duration_ms));
            }
        }

        let event = json!({
            "state": state,
            "agent": agent,
            "session_id": session_id,
            "model": model,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "data": data,
        });

        self.bus.publish(ACTIVITY_CHANNEL, &event).await;
    }
}

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::model::DeviceId;
use crate::targets;

/// Per-device cooldown register for devices that failed with a connection error.
///
/// Entries are never cleared explicitly; they stop matching once `now` passes
/// their deadline. A new failure replaces the deadline instead of extending it.
#[derive(Debug, Default)]
pub struct BackoffTracker {
    entries: Mutex<HashMap<DeviceId, Instant>>,
}

impl BackoffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the register, recovering it if a holder panicked.
    fn entries(&self) -> MutexGuard<'_, HashMap<DeviceId, Instant>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!(target: targets::BACKOFF, "Backoff register lock was poisoned, recovering");
            self.entries.clear_poison();
            PoisonError::into_inner(poisoned)
        })
    }

    pub fn should_skip(&self, device_id: &DeviceId, now: Instant) -> bool {
        let mut entries = self.entries();

        match entries.get(device_id) {
            Some(valid_until) if now <= *valid_until => {
                trace!(
                    target: targets::BACKOFF,
                    device = %device_id,
                    remaining_ms = valid_until.saturating_duration_since(now).as_millis() as u64,
                    "Device inside backoff window"
                );
                true
            }
            Some(_) => {
                entries.remove(device_id);
                false
            }
            None => false,
        }
    }

    pub fn record_failure(&self, device_id: &DeviceId, now: Instant, window: Duration) {
        let valid_until = now + window;
        self.entries().insert(device_id.clone(), valid_until);
        debug!(
            target: targets::BACKOFF,
            device = %device_id,
            window_ms = window.as_millis() as u64,
            "Backoff recorded"
        );
    }

    /// Devices whose window is still open at `now`.
    pub fn active(&self, now: Instant) -> Vec<DeviceId> {
        let entries = self.entries();
        let mut ids: Vec<DeviceId> = entries
            .iter()
            .filter(|(_, valid_until)| now <= **valid_until)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

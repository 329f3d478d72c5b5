use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::AdapterSet;
use crate::backoff::BackoffTracker;
use crate::limiter::ConcurrencyLimiter;
use crate::model::{
    now_epoch_seconds, Device, DeviceId, DeviceSnapshot, EpochSeconds, OperationalState,
    ProtocolKind,
};
use crate::store::{DeviceRegistry, SnapshotSink};
use crate::{targets, Error, Result};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// One device's outcome for a poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PollUpdate {
    Snapshot(DeviceSnapshot),
    /// Device is not actively managed; only its last-seen time moves.
    Touch {
        device_id: DeviceId,
        at: EpochSeconds,
    },
}

impl PollUpdate {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            PollUpdate::Snapshot(snapshot) => &snapshot.device_id,
            PollUpdate::Touch { device_id, .. } => device_id,
        }
    }

    pub fn snapshot(&self) -> Option<&DeviceSnapshot> {
        match self {
            PollUpdate::Snapshot(snapshot) => Some(snapshot),
            PollUpdate::Touch { .. } => None,
        }
    }
}

/// Runs one status cycle across a fleet.
///
/// Every device resolves to a [`PollUpdate`]; failures become offline or error
/// snapshots and never abort the batch. Calls are bounded by the poll
/// limiter and by a per-call deadline, and devices that recently failed with
/// a connection error are skipped without any network call.
#[derive(Debug, Clone)]
pub struct StatusPoller {
    adapters: AdapterSet,
    backoff: Arc<BackoffTracker>,
    limiter: ConcurrencyLimiter,
    backoff_window: Duration,
    call_timeout: Duration,
    protocol_timeouts: HashMap<ProtocolKind, Duration>,
}

impl StatusPoller {
    pub fn new(
        adapters: AdapterSet,
        backoff: Arc<BackoffTracker>,
        limiter: ConcurrencyLimiter,
        backoff_window: Duration,
    ) -> Self {
        Self {
            adapters,
            backoff,
            limiter,
            backoff_window,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            protocol_timeouts: HashMap::new(),
        }
    }

    /// Deadline applied around every status call.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Overrides the deadline for one protocol.
    pub fn with_protocol_timeout(mut self, protocol: ProtocolKind, timeout: Duration) -> Self {
        self.protocol_timeouts.insert(protocol, timeout);
        self
    }

    pub fn backoff(&self) -> &BackoffTracker {
        &self.backoff
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    fn timeout_for(&self, protocol: ProtocolKind) -> Duration {
        self.protocol_timeouts
            .get(&protocol)
            .copied()
            .unwrap_or(self.call_timeout)
    }

    pub async fn poll_all(&self, devices: &[Device]) -> Vec<PollUpdate> {
        let started = Instant::now();
        let updates = join_all(devices.iter().map(|device| self.poll_device(device))).await;

        let offline = updates
            .iter()
            .filter_map(PollUpdate::snapshot)
            .filter(|snapshot| snapshot.state == OperationalState::Offline)
            .count();
        info!(
            target: targets::POLLING,
            devices = devices.len(),
            offline,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Poll cycle finished"
        );
        updates
    }

    /// Polls every device the registry lists.
    ///
    /// Only a registry failure is returned as an error; device failures are
    /// folded into the updates.
    pub async fn poll_registry(&self, registry: &dyn DeviceRegistry) -> Result<Vec<PollUpdate>> {
        let devices = registry.list_devices().await?;
        Ok(self.poll_all(&devices).await)
    }

    pub async fn poll_device(&self, device: &Device) -> PollUpdate {
        if !device.is_pollable() {
            debug!(
                target: targets::POLLING,
                device = %device.id,
                management = ?device.management,
                "Device not active, touching only"
            );
            return PollUpdate::Touch {
                device_id: device.id.clone(),
                at: now_epoch_seconds(),
            };
        }

        if self.backoff.should_skip(&device.id, Instant::now()) {
            debug!(
                target: targets::POLLING,
                device = %device.id,
                "Skipping device in backoff"
            );
            return PollUpdate::Snapshot(DeviceSnapshot::offline(
                device.id.clone(),
                now_epoch_seconds(),
            ));
        }

        PollUpdate::Snapshot(self.fetch(device).await)
    }

    async fn fetch(&self, device: &Device) -> DeviceSnapshot {
        let adapter = match self.adapters.for_device(device) {
            Ok(adapter) => adapter,
            Err(error) => {
                warn!(
                    target: targets::POLLING,
                    device = %device.id,
                    error = %error.technical_detail(),
                    "No adapter for device"
                );
                return DeviceSnapshot::offline(device.id.clone(), now_epoch_seconds());
            }
        };

        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(error) => {
                warn!(
                    target: targets::POLLING,
                    device = %device.id,
                    error = %error.technical_detail(),
                    "Poll limiter unavailable"
                );
                return DeviceSnapshot::offline(device.id.clone(), now_epoch_seconds());
            }
        };

        let timeout = self.timeout_for(device.protocol);
        let result = match tokio::time::timeout(timeout, adapter.fetch_status(device)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                device: device.id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(snapshot) => {
                debug!(
                    target: targets::POLLING,
                    device = %device.id,
                    state = %snapshot.state,
                    "Device polled"
                );
                snapshot.normalized()
            }
            Err(error) => {
                if error.is_connection() {
                    self.backoff
                        .record_failure(&device.id, Instant::now(), self.backoff_window);
                }
                let state = adapter.state_for_error(&error);
                warn!(
                    target: targets::POLLING,
                    device = %device.id,
                    class = ?error.class(),
                    state = %state,
                    error = %error.technical_detail(),
                    "Device poll failed"
                );
                DeviceSnapshot::new(device.id.clone(), state, now_epoch_seconds()).normalized()
            }
        }
    }
}

/// Counts from writing one cycle's updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub written: usize,
    pub failed: usize,
}

/// Writes a cycle's updates through `sink`, bounded by `limiter`.
///
/// Updates are reduced to one per device first (the last one wins), so two
/// writes for the same device never run at the same time.
pub async fn persist_updates(
    sink: &dyn SnapshotSink,
    updates: Vec<PollUpdate>,
    limiter: &ConcurrencyLimiter,
) -> PersistReport {
    let mut latest = BTreeMap::new();
    for update in updates {
        latest.insert(update.device_id().clone(), update);
    }

    let writes = latest.into_values().map(|update| async move {
        let device_id = update.device_id().clone();
        let result = limiter
            .run(async {
                match update {
                    PollUpdate::Snapshot(snapshot) => sink.apply_snapshot(snapshot).await,
                    PollUpdate::Touch { device_id, at } => sink.touch(device_id, at).await,
                }
            })
            .await
            .and_then(|written| written);
        if let Err(error) = &result {
            warn!(
                target: targets::STORAGE,
                device = %device_id,
                error = %error.technical_detail(),
                "Failed to persist poll update"
            );
        }
        result.is_ok()
    });

    let outcomes = join_all(writes).await;
    let written = outcomes.iter().filter(|ok| **ok).count();
    let report = PersistReport {
        written,
        failed: outcomes.len() - written,
    };
    debug!(
        target: targets::STORAGE,
        written = report.written,
        failed = report.failed,
        "Poll updates persisted"
    );
    report
}

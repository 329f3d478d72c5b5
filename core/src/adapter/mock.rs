use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{AdapterFuture, ConnectionInfo, PrinterAdapter, UploadRequest, UploadResult};
use crate::model::{
    now_epoch_seconds, Device, DeviceId, DeviceSnapshot, FileFormat, OperationalState,
    ProtocolKind,
};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Status(DeviceId),
    Upload {
        device: DeviceId,
        remote_name: String,
        bytes: usize,
    },
    Start {
        device: DeviceId,
        remote_name: String,
    },
    Stop(DeviceId),
    Connection(DeviceId),
    Gcode {
        device: DeviceId,
        script: String,
    },
}

type Queue<T> = Arc<Mutex<VecDeque<Result<T>>>>;

/// Scripted stand-in for a vendor adapter.
///
/// Status answers are queued per device; an empty queue answers with an idle
/// snapshot. Upload, start and stop answers share one queue each and succeed
/// when empty. G-code commands behave the same way.
#[derive(Debug, Clone)]
pub struct MockAdapter {
    kind: ProtocolKind,
    delay: Option<Duration>,
    status: Arc<Mutex<HashMap<DeviceId, VecDeque<Result<DeviceSnapshot>>>>>,
    uploads: Queue<()>,
    starts: Queue<()>,
    stops: Queue<()>,
    gcode: Queue<()>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockAdapter {
    pub fn new(kind: ProtocolKind) -> Self {
        Self {
            kind,
            delay: None,
            status: Arc::new(Mutex::new(HashMap::new())),
            uploads: Arc::default(),
            starts: Arc::default(),
            stops: Arc::default(),
            gcode: Arc::default(),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_status(&self, device_id: &DeviceId, result: Result<DeviceSnapshot>) {
        if let Ok(mut status) = self.status.lock() {
            status.entry(device_id.clone()).or_default().push_back(result);
        }
    }

    pub fn push_upload(&self, result: Result<()>) {
        push(&self.uploads, result);
    }

    pub fn push_start(&self, result: Result<()>) {
        push(&self.starts, result);
    }

    pub fn push_stop(&self, result: Result<()>) {
        push(&self.stops, result);
    }

    pub fn push_gcode(&self, result: Result<()>) {
        push(&self.gcode, result);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn status_calls(&self, device_id: &DeviceId) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MockCall::Status(id) if id == device_id))
            .count()
    }

    /// Highest number of calls that were in progress at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn answer<T>(&self, call: MockCall, result: Result<T>) -> Result<T> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    fn next_status(&self, device: &Device) -> Result<DeviceSnapshot> {
        let queued = self
            .status
            .lock()
            .ok()
            .and_then(|mut status| status.get_mut(&device.id).and_then(VecDeque::pop_front));
        queued.unwrap_or_else(|| {
            Ok(DeviceSnapshot::new(
                device.id.clone(),
                OperationalState::Idle,
                now_epoch_seconds(),
            ))
        })
    }
}

/// Decrements the in-flight count even when the caller gives up early.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn push(queue: &Queue<()>, result: Result<()>) {
    if let Ok(mut queue) = queue.lock() {
        queue.push_back(result);
    }
}

fn pop(queue: &Queue<()>) -> Result<()> {
    queue
        .lock()
        .ok()
        .and_then(|mut queue| queue.pop_front())
        .unwrap_or(Ok(()))
}

impl PrinterAdapter for MockAdapter {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn accepted_formats(&self) -> &'static [FileFormat] {
        match self.kind {
            ProtocolKind::PrusaLink => &[FileFormat::BinaryGcode],
            ProtocolKind::Moonraker => &[FileFormat::Gcode],
            ProtocolKind::BambuLab => &[FileFormat::ThreeMf, FileFormat::Gcode],
        }
    }

    fn fetch_status<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, DeviceSnapshot> {
        let result = self.next_status(device);
        Box::pin(self.answer(MockCall::Status(device.id.clone()), result))
    }

    fn upload<'a>(&'a self, device: &'a Device, request: UploadRequest) -> AdapterFuture<'a, UploadResult> {
        let call = MockCall::Upload {
            device: device.id.clone(),
            remote_name: request.remote_name.clone(),
            bytes: request.data.len(),
        };
        let result = pop(&self.uploads).map(|()| UploadResult {
            remote_name: request.remote_name,
            bytes: request.data.len(),
        });
        Box::pin(self.answer(call, result))
    }

    fn start_print<'a>(&'a self, device: &'a Device, remote_name: &'a str) -> AdapterFuture<'a, ()> {
        let call = MockCall::Start {
            device: device.id.clone(),
            remote_name: remote_name.to_string(),
        };
        Box::pin(self.answer(call, pop(&self.starts)))
    }

    fn stop_print<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, ()> {
        Box::pin(self.answer(MockCall::Stop(device.id.clone()), pop(&self.stops)))
    }

    fn test_connection<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, ConnectionInfo> {
        let info = ConnectionInfo {
            protocol: self.kind,
            version: Some("mock".to_string()),
            hostname: None,
        };
        Box::pin(self.answer(MockCall::Connection(device.id.clone()), Ok(info)))
    }

    fn send_gcode<'a>(&'a self, device: &'a Device, script: &'a str) -> AdapterFuture<'a, ()> {
        let call = MockCall::Gcode {
            device: device.id.clone(),
            script: script.to_string(),
        };
        Box::pin(self.answer(call, pop(&self.gcode)))
    }
}

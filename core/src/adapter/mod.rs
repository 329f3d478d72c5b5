//! Vendor adapters.
//!
//! Each adapter turns one vendor protocol into the canonical model. The set of
//! adapters is looked up by [`ProtocolKind`] once per device.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::model::{Device, DeviceSnapshot, FileFormat, OperationalState, ProtocolKind};
use crate::{Error, Result};

pub mod bambu;
mod http;
pub mod mock;
pub mod moonraker;
pub mod prusalink;

pub use bambu::BambuAdapter;
pub use mock::MockAdapter;
pub use moonraker::MoonrakerAdapter;
pub use prusalink::PrusaLinkAdapter;

pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Clone)]
pub struct UploadRequest {
    pub remote_name: String,
    pub data: Vec<u8>,
}

impl fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadRequest")
            .field("remote_name", &self.remote_name)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub remote_name: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub protocol: ProtocolKind,
    pub version: Option<String>,
    pub hostname: Option<String>,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.protocol)?;
        if let Some(version) = &self.version {
            write!(f, " {version}")?;
        }
        if let Some(hostname) = &self.hostname {
            write!(f, " on {hostname}")?;
        }
        Ok(())
    }
}

pub trait PrinterAdapter: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    fn accepted_formats(&self) -> &'static [FileFormat];

    fn fetch_status<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, DeviceSnapshot>;

    fn upload<'a>(
        &'a self,
        device: &'a Device,
        request: UploadRequest,
    ) -> AdapterFuture<'a, UploadResult>;

    fn start_print<'a>(&'a self, device: &'a Device, remote_name: &'a str)
        -> AdapterFuture<'a, ()>;

    fn stop_print<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, ()>;

    fn test_connection<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, ConnectionInfo>;

    /// Runs a console G-code script on the device. Protocols without a
    /// console endpoint answer with [`Error::Unsupported`].
    fn send_gcode<'a>(&'a self, _device: &'a Device, _script: &'a str) -> AdapterFuture<'a, ()> {
        let protocol = self.kind();
        Box::pin(async move {
            Err(Error::Unsupported {
                protocol,
                operation: "G-code commands",
            })
        })
    }

    /// Rejects files this protocol cannot print. Runs before any I/O.
    fn check_format(&self, file_name: &str) -> Result<FileFormat> {
        let format = FileFormat::detect(file_name);
        let accepted = self.accepted_formats();
        if accepted.contains(&format) {
            return Ok(format);
        }
        Err(Error::IncompatibleFormat {
            file_name: file_name.to_string(),
            protocol: self.kind(),
            format,
            accepted: accepted.to_vec(),
        })
    }

    /// State reported for a device whose status fetch failed with `error`.
    fn state_for_error(&self, error: &Error) -> OperationalState {
        match error {
            Error::Parse { .. } => OperationalState::Error,
            _ => OperationalState::Offline,
        }
    }
}

/// Adapter lookup table keyed by protocol.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<ProtocolKind, Arc<dyn PrinterAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn PrinterAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn insert(&mut self, adapter: Arc<dyn PrinterAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, protocol: ProtocolKind) -> Result<Arc<dyn PrinterAdapter>> {
        self.adapters
            .get(&protocol)
            .cloned()
            .ok_or(Error::NoAdapter { protocol })
    }

    pub fn for_device(&self, device: &Device) -> Result<Arc<dyn PrinterAdapter>> {
        self.get(device.protocol)
    }

    pub fn protocols(&self) -> Vec<ProtocolKind> {
        ProtocolKind::ALL
            .into_iter()
            .filter(|protocol| self.adapters.contains_key(protocol))
            .collect()
    }
}

impl fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSet")
            .field("protocols", &self.protocols())
            .finish()
    }
}

/// Follows `path` through nested objects.
pub(crate) fn json_at<'v>(value: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))
        .filter(|found| !found.is_null())
}

/// Reads a number, accepting numeric strings as some firmwares send them.
pub(crate) fn json_f64(value: &Value, path: &[&str]) -> Option<f64> {
    let found = json_at(value, path)?;
    found
        .as_f64()
        .or_else(|| found.as_str().and_then(|text| text.trim().parse().ok()))
        .filter(|number| number.is_finite())
}

pub(crate) fn json_seconds(value: &Value, path: &[&str]) -> Option<u64> {
    json_f64(value, path)
        .filter(|seconds| *seconds >= 0.0)
        .map(|seconds| seconds.round() as u64)
}

pub(crate) fn json_str<'v>(value: &'v Value, path: &[&str]) -> Option<&'v str> {
    json_at(value, path)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

pub(crate) fn json_bool(value: &Value, path: &[&str]) -> bool {
    json_at(value, path)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Splits `name.ext` into `(name, .ext)`, keeping `.gcode.3mf` together.
pub(crate) fn split_extension(file_name: &str) -> (&str, &str) {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".gcode.3mf") {
        let cut = file_name.len() - ".gcode.3mf".len();
        return file_name.split_at(cut);
    }
    match file_name.rfind('.') {
        Some(0) | None => (file_name, ""),
        Some(index) => file_name.split_at(index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_helpers_walk_nested_objects() {
        let value = json!({
            "temperature": {"bed": {"actual": 60.1}},
            "telemetry": {"temp-bed": "58.5"},
            "state": {"text": "  "},
            "job": null
        });

        assert_eq!(json_f64(&value, &["temperature", "bed", "actual"]), Some(60.1));
        assert_eq!(json_f64(&value, &["telemetry", "temp-bed"]), Some(58.5));
        assert_eq!(json_f64(&value, &["temperature", "tool0", "actual"]), None);
        assert_eq!(json_str(&value, &["state", "text"]), None);
        assert!(json_at(&value, &["job"]).is_none());
        assert!(!json_bool(&value, &["state", "flags", "printing"]));
    }

    #[test]
    fn split_extension_keeps_compound_suffix() {
        assert_eq!(split_extension("benchy.gcode"), ("benchy", ".gcode"));
        assert_eq!(split_extension("plate.gcode.3mf"), ("plate", ".gcode.3mf"));
        assert_eq!(split_extension("noext"), ("noext", ""));
        assert_eq!(split_extension(".hidden"), (".hidden", ""));
    }

    #[test]
    fn adapter_set_reports_missing_protocols() {
        let set = AdapterSet::new().with(Arc::new(MockAdapter::new(ProtocolKind::Moonraker)));
        assert!(set.get(ProtocolKind::Moonraker).is_ok());
        assert!(matches!(
            set.get(ProtocolKind::BambuLab),
            Err(Error::NoAdapter {
                protocol: ProtocolKind::BambuLab
            })
        ));
        assert_eq!(set.protocols(), vec![ProtocolKind::Moonraker]);
    }

    #[tokio::test]
    async fn gcode_is_unsupported_unless_overridden() {
        struct Silent;

        impl PrinterAdapter for Silent {
            fn kind(&self) -> ProtocolKind {
                ProtocolKind::PrusaLink
            }

            fn accepted_formats(&self) -> &'static [FileFormat] {
                &[]
            }

            fn fetch_status<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, DeviceSnapshot> {
                let snapshot = DeviceSnapshot::offline(device.id.clone(), 0);
                Box::pin(async move { Ok(snapshot) })
            }

            fn upload<'a>(&'a self, _device: &'a Device, request: UploadRequest) -> AdapterFuture<'a, UploadResult> {
                Box::pin(async move {
                    Ok(UploadResult {
                        remote_name: request.remote_name,
                        bytes: 0,
                    })
                })
            }

            fn start_print<'a>(&'a self, _device: &'a Device, _remote_name: &'a str) -> AdapterFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }

            fn stop_print<'a>(&'a self, _device: &'a Device) -> AdapterFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }

            fn test_connection<'a>(&'a self, _device: &'a Device) -> AdapterFuture<'a, ConnectionInfo> {
                Box::pin(async {
                    Ok(ConnectionInfo {
                        protocol: ProtocolKind::PrusaLink,
                        version: None,
                        hostname: None,
                    })
                })
            }
        }

        let device = Device::new(
            "mk4",
            ProtocolKind::PrusaLink,
            crate::model::Endpoint::http("http://mk4"),
        );
        let error = Silent
            .send_gcode(&device, "G28")
            .await
            .expect_err("unsupported");
        assert!(matches!(
            error,
            Error::Unsupported {
                protocol: ProtocolKind::PrusaLink,
                ..
            }
        ));
    }

    #[test]
    fn check_format_uses_accepted_list() {
        let mock = MockAdapter::new(ProtocolKind::PrusaLink);
        assert_eq!(
            mock.check_format("part.bgcode").expect("accepted"),
            FileFormat::BinaryGcode
        );
        let error = mock.check_format("part.gcode").expect_err("rejected");
        assert!(matches!(error, Error::IncompatibleFormat { .. }));
    }
}

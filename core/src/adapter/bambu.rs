use serde_json::{json, Value};
use tracing::debug;

use super::{
    json_f64, json_str, AdapterFuture, ConnectionInfo, PrinterAdapter, UploadRequest,
    UploadResult,
};
use crate::bridge::{BridgeRequest, ProcessBridge};
use crate::config::BridgeConfig;
use crate::model::{
    now_epoch_seconds, Device, DeviceId, DeviceSnapshot, Endpoint, EpochSeconds, FileFormat,
    OperationalState, ProtocolKind,
};
use crate::{targets, Error, Result};

const ACCEPTED: &[FileFormat] = &[FileFormat::ThreeMf, FileFormat::Gcode];

/// Share of the status timeout the helper may spend waiting for the first MQTT push.
const PUSH_WAIT_SHARE: f64 = 0.6;

/// Helper run by the bridge. Reads one JSON request from stdin and prints one
/// result envelope.
const HELPER_SCRIPT: &str = r#"
import json
import sys
import time


def reply(success, data=None, error=None):
    print(json.dumps({"success": success, "data": data, "error": error}))
    sys.stdout.flush()


def state_name(state):
    return getattr(state, "name", None) or str(state)


def wait_for_push(printer, seconds):
    deadline = time.monotonic() + seconds
    while time.monotonic() < deadline:
        if state_name(printer.get_state()) not in ("UNKNOWN", "None", ""):
            return True
        time.sleep(0.2)
    return False


def main():
    request = json.loads(sys.stdin.readline())
    try:
        import bambulabs_api as bl
    except ImportError:
        reply(False, error="bambulabs_api is not installed")
        return 1

    printer = bl.Printer(request["host"], request["access_code"], request["serial"])
    printer.connect()
    try:
        op = request["op"]
        if op == "status":
            if not wait_for_push(printer, request.get("wait_secs", 5)):
                reply(False, error="printer sent no status before the deadline")
                return 1
            reply(True, {
                "gcode_state": state_name(printer.get_state()),
                "bed_temper": printer.get_bed_temperature(),
                "nozzle_temper": printer.get_nozzle_temperature(),
                "mc_percent": printer.get_percentage(),
                "mc_remaining_time": printer.get_time(),
                "gcode_file": printer.get_file_name(),
            })
        elif op == "upload":
            with open(request["local_path"], "rb") as handle:
                result = printer.upload_file(handle, request["remote_name"])
            if "226" not in str(result):
                reply(False, error="upload rejected: %s" % result)
                return 1
            reply(True, {"remote_name": request["remote_name"]})
        elif op == "start":
            if not printer.start_print(request["remote_name"], 1):
                reply(False, error="printer refused to start the job")
                return 1
            reply(True, {})
        elif op == "stop":
            if not printer.stop_print():
                reply(False, error="printer refused to stop the job")
                return 1
            reply(True, {})
        elif op == "info":
            reply(True, {"firmware": printer.get_firmware_version(), "serial": request["serial"]})
        else:
            reply(False, error="unknown operation %s" % op)
            return 2
    except Exception as error:
        reply(False, error=str(error))
        return 1
    finally:
        printer.disconnect()
    return 0


if __name__ == "__main__":
    sys.exit(main())
"#;

pub fn map_state(raw: &str) -> OperationalState {
    match raw.trim().to_ascii_uppercase().as_str() {
        "RUNNING" | "PRINTING" => OperationalState::Printing,
        "PAUSE" | "PAUSED" => OperationalState::Paused,
        "FAILED" | "ERROR" => OperationalState::Error,
        "FINISH" | "IDLE" => OperationalState::Idle,
        "PREPARE" | "SLICING" => OperationalState::Busy,
        "OFFLINE" => OperationalState::Offline,
        _ => OperationalState::Idle,
    }
}

/// Builds a snapshot from the helper's status data.
pub fn parse_status(device_id: DeviceId, data: &Value, captured_at: EpochSeconds) -> Result<DeviceSnapshot> {
    let raw_state = json_str(data, &["gcode_state"])
        .or_else(|| json_str(data, &["state"]))
        .ok_or_else(|| Error::Parse {
            device: device_id.to_string(),
            details: "helper status carries no state".to_string(),
        })?;

    let mut snapshot = DeviceSnapshot::new(device_id, map_state(raw_state), captured_at);
    snapshot.bed_temp_c = json_f64(data, &["bed_temper"]).or_else(|| json_f64(data, &["bed_temperature"]));
    snapshot.tool_temp_c =
        json_f64(data, &["nozzle_temper"]).or_else(|| json_f64(data, &["nozzle_temperature"]));
    snapshot.progress = json_f64(data, &["mc_percent"]).map(|percent| percent / 100.0);
    snapshot.remaining_seconds = json_f64(data, &["mc_remaining_time"])
        .filter(|minutes| *minutes >= 0.0)
        .map(|minutes| (minutes * 60.0).round() as u64);
    snapshot.job_file_name = json_str(data, &["gcode_file"])
        .or_else(|| json_str(data, &["subtask_name"]))
        .map(str::to_string);

    Ok(snapshot.normalized())
}

/// Bambu Lab printers, reached through the vendor SDK in a helper process.
#[derive(Debug, Clone)]
pub struct BambuAdapter {
    bridge: ProcessBridge,
    config: BridgeConfig,
}

impl BambuAdapter {
    pub fn new(bridge: ProcessBridge, config: BridgeConfig) -> Self {
        Self { bridge, config }
    }

    fn request(&self, device: &Device, op: &str, extra: Value) -> Result<BridgeRequest> {
        let Endpoint::Lan { host, serial } = &device.endpoint else {
            return Err(Error::InvalidEndpoint {
                device: device.id.to_string(),
                details: format!("expected a LAN host and serial, got {}", device.endpoint),
            });
        };
        let access_code = device
            .credential
            .as_ref()
            .filter(|code| !code.is_empty())
            .ok_or_else(|| Error::InvalidEndpoint {
                device: device.id.to_string(),
                details: "access code missing".to_string(),
            })?;

        let mut input = json!({
            "op": op,
            "host": host,
            "serial": serial,
            "access_code": access_code.expose(),
        });
        if let (Some(fields), Value::Object(extra)) = (input.as_object_mut(), extra) {
            fields.extend(extra);
        }

        let (timeout, lifetime) = if op == "upload" {
            (self.config.transfer_timeout(), self.config.transfer_lifetime())
        } else {
            (self.config.status_timeout(), self.config.status_lifetime())
        };

        Ok(BridgeRequest::new(format!("bambu-{op}:{}", device.id), timeout)
            .with_script(HELPER_SCRIPT)
            .with_input(input)
            .with_max_lifetime(lifetime))
    }

    pub async fn fetch_status(&self, device: &Device) -> Result<DeviceSnapshot> {
        debug!(target: targets::ADAPTER, device = %device.id, protocol = "bambu", "Fetching status");
        let wait_secs = self.config.status_timeout().as_secs_f64() * PUSH_WAIT_SHARE;
        let extra = json!({"wait_secs": wait_secs});
        let data = self.bridge.run(self.request(device, "status", extra)?).await?;
        parse_status(device.id.clone(), &data, now_epoch_seconds())
    }

    pub async fn upload(&self, device: &Device, request: UploadRequest) -> Result<UploadResult> {
        let UploadRequest { remote_name, data } = request;
        let bytes = data.len();

        // Removed when this function returns.
        let staged = tempfile::Builder::new()
            .prefix("printfleet-upload-")
            .tempfile()
            .map_err(|source| Error::FileRead {
                path: std::env::temp_dir().display().to_string(),
                source,
            })?;
        tokio::fs::write(staged.path(), &data)
            .await
            .map_err(|source| Error::FileRead {
                path: staged.path().display().to_string(),
                source,
            })?;

        let extra = json!({
            "local_path": staged.path().display().to_string(),
            "remote_name": remote_name,
        });
        self.bridge.run(self.request(device, "upload", extra)?).await?;

        debug!(target: targets::ADAPTER, device = %device.id, remote = %remote_name, bytes, "Upload complete");
        Ok(UploadResult { remote_name, bytes })
    }

    pub async fn start_print(&self, device: &Device, remote_name: &str) -> Result<()> {
        let extra = json!({"remote_name": remote_name});
        self.bridge.run(self.request(device, "start", extra)?).await?;
        Ok(())
    }

    pub async fn stop_print(&self, device: &Device) -> Result<()> {
        self.bridge.run(self.request(device, "stop", Value::Null)?).await?;
        Ok(())
    }

    pub async fn test_connection(&self, device: &Device) -> Result<ConnectionInfo> {
        let data = self.bridge.run(self.request(device, "info", Value::Null)?).await?;
        Ok(ConnectionInfo {
            protocol: ProtocolKind::BambuLab,
            version: json_str(&data, &["firmware"]).map(str::to_string),
            hostname: json_str(&data, &["serial"]).map(str::to_string),
        })
    }
}

impl PrinterAdapter for BambuAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::BambuLab
    }

    fn accepted_formats(&self) -> &'static [FileFormat] {
        ACCEPTED
    }

    fn fetch_status<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, DeviceSnapshot> {
        Box::pin(BambuAdapter::fetch_status(self, device))
    }

    fn upload<'a>(&'a self, device: &'a Device, request: UploadRequest) -> AdapterFuture<'a, UploadResult> {
        Box::pin(BambuAdapter::upload(self, device, request))
    }

    fn start_print<'a>(&'a self, device: &'a Device, remote_name: &'a str) -> AdapterFuture<'a, ()> {
        Box::pin(BambuAdapter::start_print(self, device, remote_name))
    }

    fn stop_print<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, ()> {
        Box::pin(BambuAdapter::stop_print(self, device))
    }

    fn test_connection<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, ConnectionInfo> {
        Box::pin(BambuAdapter::test_connection(self, device))
    }
}

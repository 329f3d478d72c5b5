use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::debug;

use super::http::{base_url, build_client, check_status, map_request_error, read_json};
use super::{
    json_at, json_f64, json_seconds, json_str, AdapterFuture, ConnectionInfo, PrinterAdapter,
    UploadRequest, UploadResult,
};
use crate::config::AdapterTimeouts;
use crate::model::{
    estimate_remaining, now_epoch_seconds, Device, DeviceId, DeviceSnapshot, EpochSeconds,
    FileFormat, OperationalState, ProtocolKind,
};
use crate::{targets, Error, Result};

const STATUS_QUERY: &str = "/printer/objects/query?print_stats&extruder&heater_bed&display_status";
const ACCEPTED: &[FileFormat] = &[FileFormat::Gcode];

pub fn map_state(raw: &str) -> OperationalState {
    match raw.trim().to_ascii_lowercase().as_str() {
        "printing" => OperationalState::Printing,
        "complete" | "standby" | "cancelled" => OperationalState::Idle,
        "paused" => OperationalState::Paused,
        "error" => OperationalState::Error,
        _ => OperationalState::Idle,
    }
}

/// Builds a snapshot from a `printer/objects/query` answer.
pub fn parse_status(
    device_id: DeviceId,
    payload: &Value,
    captured_at: EpochSeconds,
) -> Result<DeviceSnapshot> {
    let status = json_at(payload, &["result", "status"]).ok_or_else(|| Error::Parse {
        device: device_id.to_string(),
        details: "response has no result.status object".to_string(),
    })?;

    let state = json_str(status, &["print_stats", "state"])
        .map(map_state)
        .unwrap_or(OperationalState::Idle);
    let mut snapshot = DeviceSnapshot::new(device_id, state, captured_at);
    snapshot.bed_temp_c = json_f64(status, &["heater_bed", "temperature"]);
    snapshot.tool_temp_c = json_f64(status, &["extruder", "temperature"]);
    snapshot.progress = json_f64(status, &["display_status", "progress"]);
    snapshot.elapsed_seconds = json_seconds(status, &["print_stats", "print_duration"]);
    snapshot.remaining_seconds = estimate_remaining(snapshot.elapsed_seconds, snapshot.progress);
    snapshot.job_file_name = json_str(status, &["print_stats", "filename"]).map(str::to_string);

    Ok(snapshot.normalized())
}

/// URL of the largest thumbnail listed in a `server/files/metadata` answer.
pub fn largest_thumbnail(base_url: &str, file_name: &str, metadata: &Value) -> Option<String> {
    let thumbnails = json_at(metadata, &["result", "thumbnails"])?.as_array()?;
    let best = thumbnails
        .iter()
        .filter_map(|thumbnail| {
            let path = json_str(thumbnail, &["relative_path"])?;
            let width = json_f64(thumbnail, &["width"]).unwrap_or(0.0);
            let height = json_f64(thumbnail, &["height"]).unwrap_or(0.0);
            Some((width * height, path))
        })
        .max_by(|left, right| left.0.total_cmp(&right.0))?;

    // Thumbnail paths are relative to the directory holding the G-code file.
    let directory = file_name
        .rsplit_once('/')
        .map(|(directory, _)| format!("{directory}/"))
        .unwrap_or_default();
    Some(format!("{base_url}/server/files/gcodes/{directory}{}", best.1))
}

#[derive(Debug, Clone)]
pub struct MoonrakerAdapter {
    client: Client,
    timeouts: AdapterTimeouts,
}

impl MoonrakerAdapter {
    pub fn new(timeouts: AdapterTimeouts) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            timeouts,
        })
    }

    async fn send(
        &self,
        device: &Device,
        builder: RequestBuilder,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let mut builder = builder.header(ACCEPT, "application/json").timeout(timeout);
        if let Some(key) = device.credential.as_ref().filter(|key| !key.is_empty()) {
            builder = builder.header("X-Api-Key", key.expose());
        }
        let response = builder
            .send()
            .await
            .map_err(|error| map_request_error(device, timeout, error))?;
        check_status(device, response).await
    }

    pub async fn fetch_status(&self, device: &Device) -> Result<DeviceSnapshot> {
        let base = base_url(device)?;
        let timeout = self.timeouts.status();
        debug!(target: targets::ADAPTER, device = %device.id, protocol = "moonraker", "Fetching status");

        let response = self
            .send(device, self.client.get(format!("{base}{STATUS_QUERY}")), timeout)
            .await?;
        let payload = read_json(device, timeout, response).await?;
        let mut snapshot = parse_status(device.id.clone(), &payload, now_epoch_seconds())?;

        if snapshot.is_printing() {
            if let Some(file_name) = snapshot.job_file_name.clone() {
                snapshot.preview_image_url = self.preview_url(device, base, &file_name).await;
            }
        }
        Ok(snapshot)
    }

    /// Secondary lookup; failures only cost the preview.
    async fn preview_url(&self, device: &Device, base: &str, file_name: &str) -> Option<String> {
        let timeout = self.timeouts.status();
        let request = self
            .client
            .get(format!("{base}/server/files/metadata"))
            .query(&[("filename", file_name)]);
        let result = match self.send(device, request, timeout).await {
            Ok(response) => read_json(device, timeout, response).await,
            Err(error) => Err(error),
        };
        match result {
            Ok(metadata) => largest_thumbnail(base, file_name, &metadata),
            Err(error) => {
                debug!(
                    target: targets::ADAPTER,
                    device = %device.id,
                    error = %error.technical_detail(),
                    "Thumbnail metadata unavailable"
                );
                None
            }
        }
    }

    pub async fn upload(&self, device: &Device, request: UploadRequest) -> Result<UploadResult> {
        let base = base_url(device)?;
        let UploadRequest { remote_name, data } = request;
        let bytes = data.len();
        let timeout = self.timeouts.upload();

        let part = Part::bytes(data)
            .file_name(remote_name.clone())
            .mime_str("application/octet-stream")
            .map_err(|error| map_request_error(device, timeout, error))?;
        let form = Form::new().text("root", "gcodes").part("file", part);
        let request = self
            .client
            .post(format!("{base}/server/files/upload"))
            .multipart(form);
        self.send(device, request, timeout).await?;

        debug!(target: targets::ADAPTER, device = %device.id, remote = %remote_name, bytes, "Upload complete");
        Ok(UploadResult { remote_name, bytes })
    }

    pub async fn start_print(&self, device: &Device, remote_name: &str) -> Result<()> {
        let base = base_url(device)?;
        let request = self
            .client
            .post(format!("{base}/printer/print/start"))
            .json(&json!({"filename": remote_name}));
        self.send(device, request, self.timeouts.command()).await?;
        Ok(())
    }

    pub async fn stop_print(&self, device: &Device) -> Result<()> {
        let base = base_url(device)?;
        let request = self.client.post(format!("{base}/printer/print/cancel"));
        self.send(device, request, self.timeouts.command()).await?;
        Ok(())
    }

    /// Runs `script` through the console endpoint, one command per line.
    pub async fn send_gcode(&self, device: &Device, script: &str) -> Result<()> {
        let base = base_url(device)?;
        debug!(target: targets::ADAPTER, device = %device.id, script, "Sending G-code");
        let request = self
            .client
            .post(format!("{base}/printer/gcode/script"))
            .json(&json!({"script": script}));
        self.send(device, request, self.timeouts.command()).await?;
        Ok(())
    }

    pub async fn test_connection(&self, device: &Device) -> Result<ConnectionInfo> {
        let base = base_url(device)?;
        let timeout = self.timeouts.status();
        let response = self
            .send(device, self.client.get(format!("{base}/server/info")), timeout)
            .await?;
        let info = read_json(device, timeout, response).await?;
        let result = json_at(&info, &["result"]).ok_or_else(|| Error::Parse {
            device: device.id.to_string(),
            details: "server info has no result".to_string(),
        })?;
        Ok(ConnectionInfo {
            protocol: ProtocolKind::Moonraker,
            version: json_str(result, &["moonraker_version"]).map(str::to_string),
            hostname: json_str(result, &["hostname"]).map(str::to_string),
        })
    }
}

impl PrinterAdapter for MoonrakerAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Moonraker
    }

    fn accepted_formats(&self) -> &'static [FileFormat] {
        ACCEPTED
    }

    fn fetch_status<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, DeviceSnapshot> {
        Box::pin(MoonrakerAdapter::fetch_status(self, device))
    }

    fn upload<'a>(&'a self, device: &'a Device, request: UploadRequest) -> AdapterFuture<'a, UploadResult> {
        Box::pin(MoonrakerAdapter::upload(self, device, request))
    }

    fn start_print<'a>(&'a self, device: &'a Device, remote_name: &'a str) -> AdapterFuture<'a, ()> {
        Box::pin(MoonrakerAdapter::start_print(self, device, remote_name))
    }

    fn stop_print<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, ()> {
        Box::pin(MoonrakerAdapter::stop_print(self, device))
    }

    fn test_connection<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, ConnectionInfo> {
        Box::pin(MoonrakerAdapter::test_connection(self, device))
    }

    fn send_gcode<'a>(&'a self, device: &'a Device, script: &'a str) -> AdapterFuture<'a, ()> {
        Box::pin(MoonrakerAdapter::send_gcode(self, device, script))
    }
}

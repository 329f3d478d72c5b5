use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::http::{base_url, build_client, check_status, map_request_error, read_json, resolve_url};
use super::{
    json_at, json_bool, json_f64, json_seconds, json_str, AdapterFuture, ConnectionInfo,
    PrinterAdapter, UploadRequest, UploadResult,
};
use crate::config::AdapterTimeouts;
use crate::model::{
    estimate_remaining, now_epoch_seconds, Device, DeviceId, DeviceSnapshot, EpochSeconds,
    FileFormat, OperationalState, ProtocolKind,
};
use crate::{targets, Error, Result};

/// Only a 4xx answer to the raw body is retried as multipart.
fn retries_as_multipart(error: &Error) -> bool {
    matches!(error, Error::Http { status: 400..=499, .. })
}

/// PrusaLink authenticates every local user as `maker`.
const USERNAME: &str = "maker";
const ACCEPTED: &[FileFormat] = &[FileFormat::BinaryGcode];

pub fn map_state(raw: &str) -> OperationalState {
    match raw.trim().to_ascii_lowercase().as_str() {
        "printing" => OperationalState::Printing,
        "operational" | "idle" | "ready" | "finished" | "stopped" => OperationalState::Idle,
        "cancelling" => OperationalState::Idle,
        "paused" | "pausing" => OperationalState::Paused,
        "error" | "attention" => OperationalState::Error,
        "offline" => OperationalState::Offline,
        "busy" => OperationalState::Busy,
        _ => OperationalState::Idle,
    }
}

/// Builds a snapshot from `/api/printer` and the optional `/api/job` payload.
pub fn parse_status(
    device_id: DeviceId,
    printer: &Value,
    job: Option<&Value>,
    base_url: &str,
    captured_at: EpochSeconds,
) -> Result<DeviceSnapshot> {
    let device_state = device_state(printer).ok_or_else(|| Error::Parse {
        device: device_id.to_string(),
        details: "printer payload carries no state".to_string(),
    })?;

    let job_state = job.and_then(|job| json_str(job, &["state"])).map(map_state);
    let mut snapshot = DeviceSnapshot::new(device_id, job_state.unwrap_or(device_state), captured_at);

    snapshot.bed_temp_c = json_f64(printer, &["temperature", "bed", "actual"])
        .or_else(|| json_f64(printer, &["telemetry", "temp-bed"]))
        .or_else(|| json_f64(printer, &["printer", "temp_bed"]));
    snapshot.tool_temp_c = json_f64(printer, &["temperature", "tool0", "actual"])
        .or_else(|| json_f64(printer, &["telemetry", "temp-nozzle"]))
        .or_else(|| json_f64(printer, &["printer", "temp_nozzle"]));

    if let Some(job) = job {
        snapshot.progress = job_progress(job);
        snapshot.elapsed_seconds = json_seconds(job, &["time_printing"])
            .or_else(|| json_seconds(job, &["progress", "printTime"]))
            .or_else(|| json_seconds(job, &["job", "print_time"]));
        snapshot.remaining_seconds = json_seconds(job, &["time_remaining"])
            .or_else(|| json_seconds(job, &["progress", "printTimeLeft"]))
            .or_else(|| json_seconds(job, &["job", "print_time_remaining"]))
            .or_else(|| estimate_remaining(snapshot.elapsed_seconds, snapshot.progress));
        snapshot.job_file_name = json_str(job, &["file", "display_name"])
            .or_else(|| json_str(job, &["file", "display"]))
            .or_else(|| json_str(job, &["file", "name"]))
            .or_else(|| json_str(job, &["job", "file", "name"]))
            .map(str::to_string);
        snapshot.preview_image_url = json_str(job, &["file", "refs", "thumbnail"])
            .or_else(|| json_str(job, &["job", "thumbnail_url"]))
            .or_else(|| json_str(job, &["thumbnail_url"]))
            .map(|reference| resolve_url(base_url, reference));
    }

    Ok(snapshot.normalized())
}

fn device_state(printer: &Value) -> Option<OperationalState> {
    if json_bool(printer, &["state", "flags", "printing"]) {
        return Some(OperationalState::Printing);
    }
    if json_bool(printer, &["state", "flags", "paused"]) {
        return Some(OperationalState::Paused);
    }
    if json_bool(printer, &["state", "flags", "error"]) {
        return Some(OperationalState::Error);
    }
    if let Some(text) = json_str(printer, &["state", "text"]) {
        return Some(map_state(text));
    }
    if let Some(text) = json_str(printer, &["printer", "state", "text"])
        .or_else(|| json_str(printer, &["printer", "state"]))
    {
        return Some(map_state(text));
    }
    json_at(printer, &["state", "flags"]).map(|_| OperationalState::Idle)
}

/// Newer firmware reports a percentage, OctoPrint-style payloads a completion ratio.
fn job_progress(job: &Value) -> Option<f64> {
    match json_at(job, &["progress"])? {
        Value::Object(_) => json_f64(job, &["progress", "completion"]),
        _ => json_f64(job, &["progress"]).map(|percent| percent / 100.0),
    }
}

#[derive(Debug, Clone)]
pub struct PrusaLinkAdapter {
    client: Client,
    timeouts: AdapterTimeouts,
}

impl PrusaLinkAdapter {
    pub fn new(timeouts: AdapterTimeouts) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            timeouts,
        })
    }

    fn authorized(&self, device: &Device, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header(ACCEPT, "application/json");
        match device.credential.as_ref().filter(|secret| !secret.is_empty()) {
            Some(secret) => builder.basic_auth(USERNAME, Some(secret.expose())),
            None => builder,
        }
    }

    async fn send(
        &self,
        device: &Device,
        builder: RequestBuilder,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let response = self
            .authorized(device, builder)
            .timeout(timeout)
            .send()
            .await
            .map_err(|error| map_request_error(device, timeout, error))?;
        Ok(response)
    }

    pub async fn fetch_status(&self, device: &Device) -> Result<DeviceSnapshot> {
        let base = base_url(device)?;
        let timeout = self.timeouts.status();
        debug!(target: targets::ADAPTER, device = %device.id, protocol = "prusalink", "Fetching status");

        let response = self
            .send(device, self.client.get(format!("{base}/api/printer")), timeout)
            .await?;
        let printer = read_json(device, timeout, check_status(device, response).await?).await?;

        let job = match self.fetch_job(device, base, timeout).await {
            Ok(job) => job,
            Err(error) if error.is_connection() => return Err(error),
            Err(error) => {
                debug!(
                    target: targets::ADAPTER,
                    device = %device.id,
                    error = %error.technical_detail(),
                    "Job payload unavailable"
                );
                None
            }
        };

        parse_status(
            device.id.clone(),
            &printer,
            job.as_ref(),
            base,
            now_epoch_seconds(),
        )
    }

    async fn fetch_job(&self, device: &Device, base: &str, timeout: Duration) -> Result<Option<Value>> {
        let response = self
            .send(device, self.client.get(format!("{base}/api/job")), timeout)
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let job = read_json(device, timeout, check_status(device, response).await?).await?;
        Ok(Some(job))
    }

    pub async fn upload(&self, device: &Device, request: UploadRequest) -> Result<UploadResult> {
        let base = base_url(device)?;
        let UploadRequest { remote_name, data } = request;
        let bytes = data.len();
        let payload = Bytes::from(data);
        let timeout = self.timeouts.upload();

        let binary = self
            .client
            .post(format!("{base}/api/files/local"))
            .query(&[("filename", remote_name.as_str())])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(payload.clone());
        let first = match self.send(device, binary, timeout).await {
            Ok(response) => check_status(device, response).await.map(|_| ()),
            Err(error) => Err(error),
        };

        match first {
            Ok(()) => {}
            Err(error) if retries_as_multipart(&error) => {
                warn!(
                    target: targets::ADAPTER,
                    device = %device.id,
                    error = %error.technical_detail(),
                    "Binary upload rejected, retrying as multipart"
                );
                let part = Part::stream_with_length(payload, bytes as u64)
                    .file_name(remote_name.clone())
                    .mime_str("application/octet-stream")
                    .map_err(|error| map_request_error(device, timeout, error))?;
                let form = Form::new().part("file", part).text("print", "false");
                let multipart = self
                    .client
                    .post(format!("{base}/api/files/local"))
                    .multipart(form);
                let response = self.send(device, multipart, timeout).await?;
                check_status(device, response).await?;
            }
            Err(error) => return Err(error),
        }

        debug!(target: targets::ADAPTER, device = %device.id, remote = %remote_name, bytes, "Upload complete");
        Ok(UploadResult { remote_name, bytes })
    }

    pub async fn start_print(&self, device: &Device, remote_name: &str) -> Result<()> {
        let url = file_url(device, remote_name)?;
        let request = self
            .client
            .post(url)
            .json(&json!({"command": "select", "print": true}));
        let response = self.send(device, request, self.timeouts.command()).await?;
        check_status(device, response).await?;
        Ok(())
    }

    pub async fn stop_print(&self, device: &Device) -> Result<()> {
        let base = base_url(device)?;
        let request = self
            .client
            .post(format!("{base}/api/job"))
            .json(&json!({"command": "cancel"}));
        let response = self.send(device, request, self.timeouts.command()).await?;
        check_status(device, response).await?;
        Ok(())
    }

    pub async fn test_connection(&self, device: &Device) -> Result<ConnectionInfo> {
        let base = base_url(device)?;
        let timeout = self.timeouts.status();
        let response = self
            .send(device, self.client.get(format!("{base}/api/version")), timeout)
            .await?;
        let version = read_json(device, timeout, check_status(device, response).await?).await?;
        Ok(ConnectionInfo {
            protocol: ProtocolKind::PrusaLink,
            version: json_str(&version, &["server"])
                .or_else(|| json_str(&version, &["text"]))
                .or_else(|| json_str(&version, &["api"]))
                .map(str::to_string),
            hostname: json_str(&version, &["hostname"]).map(str::to_string),
        })
    }
}

fn file_url(device: &Device, remote_name: &str) -> Result<Url> {
    let base = base_url(device)?;
    let invalid = |details: String| Error::InvalidEndpoint {
        device: device.id.to_string(),
        details,
    };
    let mut url = Url::parse(&format!("{base}/api/files/local")).map_err(|error| invalid(error.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("base URL cannot carry a path".to_string()))?
        .push(remote_name);
    Ok(url)
}

impl PrinterAdapter for PrusaLinkAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::PrusaLink
    }

    fn accepted_formats(&self) -> &'static [FileFormat] {
        ACCEPTED
    }

    fn fetch_status<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, DeviceSnapshot> {
        Box::pin(PrusaLinkAdapter::fetch_status(self, device))
    }

    fn upload<'a>(&'a self, device: &'a Device, request: UploadRequest) -> AdapterFuture<'a, UploadResult> {
        Box::pin(PrusaLinkAdapter::upload(self, device, request))
    }

    fn start_print<'a>(&'a self, device: &'a Device, remote_name: &'a str) -> AdapterFuture<'a, ()> {
        Box::pin(PrusaLinkAdapter::start_print(self, device, remote_name))
    }

    fn stop_print<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, ()> {
        Box::pin(PrusaLinkAdapter::stop_print(self, device))
    }

    fn test_connection<'a>(&'a self, device: &'a Device) -> AdapterFuture<'a, ConnectionInfo> {
        Box::pin(PrusaLinkAdapter::test_connection(self, device))
    }
}

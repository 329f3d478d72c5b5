use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, trace};

use crate::model::Device;
use crate::{targets, Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) fn build_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("printfleet/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|error| Error::Config {
            path: None,
            details: format!("failed to build HTTP client: {error}"),
        })
}

pub(crate) fn base_url(device: &Device) -> Result<&str> {
    device
        .endpoint
        .base_url()
        .filter(|url| !url.is_empty())
        .ok_or_else(|| Error::InvalidEndpoint {
            device: device.id.to_string(),
            details: format!("expected an HTTP base URL, got {}", device.endpoint),
        })
}

pub(crate) fn map_request_error(device: &Device, timeout: Duration, error: reqwest::Error) -> Error {
    let device = device.id.to_string();
    if error.is_timeout() {
        Error::Timeout {
            device,
            timeout_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
        }
    } else if error.is_decode() || error.is_body() {
        Error::Parse {
            device,
            details: error.to_string(),
        }
    } else {
        Error::Connection {
            device,
            details: error.to_string(),
        }
    }
}

/// Turns non-2xx answers into typed errors.
pub(crate) async fn check_status(device: &Device, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    debug!(
        target: targets::ADAPTER,
        device = %device.id,
        url = %response.url(),
        status = status.as_u16(),
        "Device answered with an error status"
    );

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::Auth {
            device: device.id.to_string(),
            status: status.as_u16(),
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::Http {
        device: device.id.to_string(),
        status: status.as_u16(),
        body,
    })
}

pub(crate) async fn read_json(device: &Device, timeout: Duration, response: Response) -> Result<Value> {
    let bytes = response
        .bytes()
        .await
        .map_err(|error| map_request_error(device, timeout, error))?;
    trace!(
        target: targets::ADAPTER,
        device = %device.id,
        body = %String::from_utf8_lossy(&bytes),
        "Device payload"
    );
    serde_json::from_slice(&bytes).map_err(|error| Error::Parse {
        device: device.id.to_string(),
        details: error.to_string(),
    })
}

/// Absolute URL for a path the device reports relative to its root.
pub(crate) fn resolve_url(base_url: &str, reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return reference.to_string();
    }
    format!("{base_url}/{}", reference.trim_start_matches('/'))
}

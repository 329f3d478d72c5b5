use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub type EpochSeconds = u64;

pub fn now_epoch_seconds() -> EpochSeconds {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FileId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    PrusaLink,
    Moonraker,
    BambuLab,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 3] = [
        ProtocolKind::PrusaLink,
        ProtocolKind::Moonraker,
        ProtocolKind::BambuLab,
    ];
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::PrusaLink => f.write_str("PrusaLink"),
            ProtocolKind::Moonraker => f.write_str("Moonraker"),
            ProtocolKind::BambuLab => f.write_str("Bambu Lab"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Http { base_url: String },
    Lan { host: String, serial: String },
}

impl Endpoint {
    pub fn http(base_url: impl Into<String>) -> Self {
        Endpoint::Http {
            base_url: base_url.into(),
        }
    }

    pub fn lan(host: impl Into<String>, serial: impl Into<String>) -> Self {
        Endpoint::Lan {
            host: host.into(),
            serial: serial.into(),
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        match self {
            Endpoint::Http { base_url } => Some(base_url.trim_end_matches('/')),
            Endpoint::Lan { .. } => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Http { base_url } => f.write_str(base_url),
            Endpoint::Lan { host, serial } => write!(f, "{host} ({serial})"),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagementState {
    #[default]
    Active,
    Disabled,
    Maintenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    #[serde(default)]
    pub name: Option<String>,
    pub protocol: ProtocolKind,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub management: ManagementState,
}

impl Device {
    pub fn new(id: impl Into<String>, protocol: ProtocolKind, endpoint: Endpoint) -> Self {
        Self {
            id: DeviceId::new(id),
            name: None,
            protocol,
            endpoint,
            credential: None,
            management: ManagementState::Active,
        }
    }

    pub fn with_credential(mut self, secret: impl Into<String>) -> Self {
        self.credential = Some(Credential::new(secret));
        self
    }

    pub fn with_management(mut self, management: ManagementState) -> Self {
        self.management = management;
        self
    }

    pub fn is_pollable(&self) -> bool {
        self.management == ManagementState::Active
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationalState {
    Printing,
    Idle,
    Paused,
    Error,
    Offline,
    Busy,
}

impl fmt::Display for OperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationalState::Printing => f.write_str("printing"),
            OperationalState::Idle => f.write_str("idle"),
            OperationalState::Paused => f.write_str("paused"),
            OperationalState::Error => f.write_str("error"),
            OperationalState::Offline => f.write_str("offline"),
            OperationalState::Busy => f.write_str("busy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub state: OperationalState,
    pub bed_temp_c: Option<f64>,
    pub tool_temp_c: Option<f64>,
    pub progress: Option<f64>,
    pub elapsed_seconds: Option<u64>,
    pub remaining_seconds: Option<u64>,
    pub job_file_name: Option<String>,
    pub preview_image_url: Option<String>,
    pub captured_at: EpochSeconds,
}

impl DeviceSnapshot {
    pub fn new(device_id: DeviceId, state: OperationalState, captured_at: EpochSeconds) -> Self {
        Self {
            device_id,
            state,
            bed_temp_c: None,
            tool_temp_c: None,
            progress: None,
            elapsed_seconds: None,
            remaining_seconds: None,
            job_file_name: None,
            preview_image_url: None,
            captured_at,
        }
    }

    pub fn offline(device_id: DeviceId, captured_at: EpochSeconds) -> Self {
        Self::new(device_id, OperationalState::Offline, captured_at)
    }

    /// Clears job data unless the device is printing and keeps the progress ratio in `[0, 1]`.
    pub fn normalized(mut self) -> Self {
        if self.state != OperationalState::Printing {
            self.progress = None;
            self.elapsed_seconds = None;
            self.remaining_seconds = None;
            self.job_file_name = None;
            self.preview_image_url = None;
        }
        self.progress = self
            .progress
            .filter(|value| value.is_finite())
            .map(|value| value.clamp(0.0, 1.0));
        self.bed_temp_c = self.bed_temp_c.filter(|value| value.is_finite());
        self.tool_temp_c = self.tool_temp_c.filter(|value| value.is_finite());
        self
    }

    pub fn is_printing(&self) -> bool {
        self.state == OperationalState::Printing
    }
}

/// `remaining = elapsed / progress - elapsed`, only for `0 < progress < 1`.
pub fn estimate_remaining(elapsed_seconds: Option<u64>, progress: Option<f64>) -> Option<u64> {
    let elapsed = elapsed_seconds?;
    let progress = progress?;
    if !(progress > 0.0 && progress < 1.0) {
        return None;
    }
    let elapsed = elapsed as f64;
    let remaining = elapsed / progress - elapsed;
    (remaining.is_finite() && remaining >= 0.0).then(|| remaining.round() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileFormat {
    Gcode,
    BinaryGcode,
    ThreeMf,
    Other,
}

impl FileFormat {
    pub fn detect(file_name: &str) -> Self {
        let lower = file_name.trim().to_ascii_lowercase();
        if lower.ends_with(".bgcode") {
            FileFormat::BinaryGcode
        } else if lower.ends_with(".gcode") {
            FileFormat::Gcode
        } else if lower.ends_with(".3mf") {
            FileFormat::ThreeMf
        } else {
            FileFormat::Other
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Gcode => ".gcode",
            FileFormat::BinaryGcode => ".bgcode",
            FileFormat::ThreeMf => ".3mf",
            FileFormat::Other => "",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Other => f.write_str("unknown"),
            other => f.write_str(other.extension()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    pub path: PathBuf,
}

impl FileRecord {
    pub fn format(&self) -> FileFormat {
        FileFormat::detect(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Uploaded,
    Pending,
    Printing,
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Uploaded, JobStatus::Pending)
                | (JobStatus::Uploaded, JobStatus::Failed)
                | (JobStatus::Pending, JobStatus::Printing)
                | (JobStatus::Pending, JobStatus::Uploaded)
                | (JobStatus::Pending, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Uploaded => f.write_str("uploaded"),
            JobStatus::Pending => f.write_str("pending"),
            JobStatus::Printing => f.write_str("printing"),
            JobStatus::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    pub file_id: FileId,
    pub device_id: DeviceId,
    pub status: JobStatus,
    pub remote_name: Option<String>,
    pub error: Option<String>,
    pub updated_at: EpochSeconds,
}

impl PrintJob {
    pub fn new(id: JobId, file_id: FileId, device_id: DeviceId) -> Self {
        Self {
            id,
            file_id,
            device_id,
            status: JobStatus::Uploaded,
            remote_name: None,
            error: None,
            updated_at: now_epoch_seconds(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Printing | JobStatus::Failed)
    }
}

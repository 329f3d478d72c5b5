use std::fmt;

use crate::model::{FileFormat, JobStatus, ProtocolKind};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection to {device} failed")]
    Connection { device: String, details: String },
    #[error("Request to {device} timed out")]
    Timeout { device: String, timeout_ms: u64 },
    #[error("Authentication rejected by {device}")]
    Auth { device: String, status: u16 },
    #[error("HTTP {status} from {device}")]
    Http {
        device: String,
        status: u16,
        body: String,
    },
    #[error("Malformed response from {device}")]
    Parse { device: String, details: String },
    #[error("{protocol} does not accept {format} files")]
    IncompatibleFormat {
        file_name: String,
        protocol: ProtocolKind,
        format: FileFormat,
        accepted: Vec<FileFormat>,
    },
    #[error("Helper process {label} timed out")]
    ProcessTimeout { label: String, timeout_ms: u64 },
    #[error("Helper process {label} failed")]
    ProcessFailure {
        label: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("Helper process {label} reported an error")]
    ProcessReported { label: String, message: String },
    #[error("Helper process {label} could not be started")]
    ProcessSpawn {
        label: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No adapter registered for {protocol}")]
    NoAdapter { protocol: ProtocolKind },
    #[error("{protocol} does not support {operation}")]
    Unsupported {
        protocol: ProtocolKind,
        operation: &'static str,
    },
    #[error("Invalid endpoint for {device}")]
    InvalidEndpoint { device: String, details: String },
    #[error("Concurrency limiter {name} is closed")]
    LimiterClosed { name: &'static str },
    #[error("Invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("File read error")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unknown job {id}")]
    UnknownJob { id: String },
    #[error("Configuration error")]
    Config { path: Option<String>, details: String },
    #[error("RON {action} error")]
    Ron {
        action: StorageAction,
        path: Option<String>,
        details: String,
    },
    #[error("Storage {action} error")]
    StorageIo {
        action: StorageAction,
        path: Option<String>,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageAction {
    Load,
    Save,
}

impl fmt::Display for StorageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageAction::Load => f.write_str("load"),
            StorageAction::Save => f.write_str("save"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Connection,
    Application,
    IncompatibleFormat,
    Process,
    Storage,
    Configuration,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Connection { .. } | Error::Timeout { .. } => ErrorClass::Connection,
            Error::Auth { .. }
            | Error::Http { .. }
            | Error::Parse { .. }
            | Error::Unsupported { .. } => ErrorClass::Application,
            Error::IncompatibleFormat { .. } => ErrorClass::IncompatibleFormat,
            Error::ProcessTimeout { .. }
            | Error::ProcessFailure { .. }
            | Error::ProcessReported { .. }
            | Error::ProcessSpawn { .. } => ErrorClass::Process,
            Error::FileRead { .. }
            | Error::UnknownJob { .. }
            | Error::Ron { .. }
            | Error::StorageIo { .. } => ErrorClass::Storage,
            Error::NoAdapter { .. }
            | Error::InvalidEndpoint { .. }
            | Error::InvalidTransition { .. }
            | Error::LimiterClosed { .. }
            | Error::Config { .. } => ErrorClass::Configuration,
        }
    }

    /// Transport-level failures, including a helper process that could not
    /// start, timed out or died. A helper that ran and reported an error
    /// reached the device and does not count.
    pub fn is_connection(&self) -> bool {
        match self {
            Error::ProcessReported { .. } => false,
            other => matches!(other.class(), ErrorClass::Connection | ErrorClass::Process),
        }
    }

    pub fn user_summary(&self) -> String {
        match self {
            Error::Connection { device, .. } => format!("Cannot reach {device}."),
            Error::Timeout { device, .. } => format!("{device} did not answer in time."),
            Error::Auth { device, .. } => format!("{device} rejected the credentials."),
            Error::Http { device, status, .. } => {
                format!("{device} answered with HTTP {status}.")
            }
            Error::Parse { device, .. } => format!("{device} sent an unreadable response."),
            Error::IncompatibleFormat {
                protocol, accepted, ..
            } => format!(
                "{protocol} printers only accept {} files.",
                join_formats(accepted)
            ),
            Error::ProcessTimeout { label, .. } => format!("{label} helper timed out."),
            Error::ProcessFailure { label, .. } => format!("{label} helper failed."),
            Error::ProcessReported { message, .. } => message.clone(),
            Error::ProcessSpawn { label, .. } => format!("{label} helper could not start."),
            Error::NoAdapter { protocol } => format!("{protocol} printers are not supported."),
            Error::Unsupported {
                protocol,
                operation,
            } => format!("{protocol} printers do not support {operation}."),
            Error::InvalidEndpoint { device, .. } => {
                format!("{device} has an invalid connection address.")
            }
            Error::InvalidTransition { from, to } => {
                format!("Job cannot move from {from} to {to}.")
            }
            Error::LimiterClosed { .. } => "Shutting down.".to_string(),
            Error::FileRead { path, .. } => format!("Failed to read file {path}."),
            Error::UnknownJob { id } => format!("Job {id} does not exist."),
            Error::Config { .. } => "Invalid fleet configuration.".to_string(),
            Error::Ron { action, .. } => format!("Failed to {action} state data."),
            Error::StorageIo { action, .. } => format!("Failed to {action} state file."),
        }
    }

    pub fn technical_detail(&self) -> String {
        match self {
            Error::Connection { device, details } => {
                format!("Connection to {device} failed: {details}")
            }
            Error::Timeout { device, timeout_ms } => {
                format!("Request to {device} timed out after {timeout_ms}ms.")
            }
            Error::Auth { device, status } => {
                format!("{device} rejected credentials with HTTP {status}.")
            }
            Error::Http {
                device,
                status,
                body,
            } => {
                let body = body.trim();
                if body.is_empty() {
                    format!("HTTP {status} from {device}.")
                } else {
                    format!("HTTP {status} from {device}: {}", truncate(body, 200))
                }
            }
            Error::Parse { device, details } => {
                format!("Malformed response from {device}: {details}")
            }
            Error::IncompatibleFormat {
                file_name,
                protocol,
                format,
                accepted,
            } => format!(
                "{file_name} is {format}; {protocol} accepts {}.",
                join_formats(accepted)
            ),
            Error::ProcessTimeout { label, timeout_ms } => {
                format!("{label} killed after {timeout_ms}ms.")
            }
            Error::ProcessFailure {
                label,
                exit_code,
                stderr,
            } => {
                let code = exit_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    format!("{label} exited with {code}.")
                } else {
                    format!("{label} exited with {code}: {}", truncate(stderr, 400))
                }
            }
            Error::ProcessReported { label, message } => format!("{label}: {message}"),
            Error::ProcessSpawn { label, source } => {
                format!("{label} could not be spawned: {source}")
            }
            Error::NoAdapter { protocol } => format!("No adapter registered for {protocol}."),
            Error::Unsupported {
                protocol,
                operation,
            } => format!("{operation} is not implemented for {protocol}."),
            Error::InvalidEndpoint { device, details } => {
                format!("Invalid endpoint for {device}: {details}")
            }
            Error::InvalidTransition { from, to } => {
                format!("Invalid job transition {from} -> {to}.")
            }
            Error::LimiterClosed { name } => format!("Concurrency limiter {name} was closed."),
            Error::FileRead { path, source } => format!("Reading {path} failed: {source}"),
            Error::UnknownJob { id } => format!("No job with id {id} in the store."),
            Error::Config { path, details } => {
                let path = path
                    .as_ref()
                    .map(|value| format!(" path={value}."))
                    .unwrap_or_default();
                format!("Configuration error.{path} {details}")
            }
            Error::Ron {
                action,
                path,
                details,
            } => {
                let path = path
                    .as_ref()
                    .map(|value| format!(" path={value}."))
                    .unwrap_or_default();
                format!("RON {action} error.{path} {details}")
            }
            Error::StorageIo {
                action,
                path,
                source,
            } => {
                let path = path
                    .as_ref()
                    .map(|value| format!(" path={value}."))
                    .unwrap_or_default();
                format!("Storage {action} error.{path} {source}")
            }
        }
    }
}

fn join_formats(formats: &[FileFormat]) -> String {
    formats
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut out: String = value.chars().take(max_chars).collect();
    out.push('…');
    out
}

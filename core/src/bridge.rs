use std::collections::HashMap;
use std::io::Write;
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::{targets, Error, Result};

/// One helper invocation.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub label: String,
    pub args: Vec<String>,
    pub script: Option<String>,
    pub input: Option<Value>,
    pub timeout: Duration,
    pub max_lifetime: Duration,
}

impl BridgeRequest {
    pub fn new(label: impl Into<String>, timeout: Duration) -> Self {
        Self {
            label: label.into(),
            args: Vec::new(),
            script: None,
            input: None,
            timeout,
            max_lifetime: timeout,
        }
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub id: u64,
    pub label: String,
    pub pid: Option<u32>,
    pub age: Duration,
}

#[derive(Debug)]
struct ActiveProcess {
    label: String,
    pid: Option<u32>,
    started: Instant,
    max_lifetime: Duration,
    kill: Arc<Notify>,
}

type Registry = Arc<Mutex<HashMap<u64, ActiveProcess>>>;

/// Removes a process from the registry on every exit path.
struct RegistryGuard {
    registry: Registry,
    id: u64,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.remove(&self.id);
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
}

enum Outcome {
    Exited(std::io::Result<Output>),
    TimedOut,
    Reaped,
}

/// Runs helper programs as short-lived child processes with a hard deadline.
///
/// Every child is spawned with `kill_on_drop`, so dropping a pending
/// [`ProcessBridge::run`] future kills its process. The reaper started by
/// [`ProcessBridge::spawn_reaper`] kills anything that outlives its
/// `max_lifetime` anyway.
#[derive(Debug, Clone)]
pub struct ProcessBridge {
    program: String,
    next_id: Arc<AtomicU64>,
    registry: Registry,
}

impl ProcessBridge {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            next_id: Arc::new(AtomicU64::new(1)),
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs one helper and returns the `data` of its result envelope.
    pub async fn run(&self, request: BridgeRequest) -> Result<Value> {
        let BridgeRequest {
            label,
            args,
            script,
            input,
            timeout,
            max_lifetime,
        } = request;

        // Dropped (and unlinked) when this function returns or is cancelled.
        let script_file = match script {
            Some(source) => Some(write_script(&label, &source)?),
            None => None,
        };

        let mut command = Command::new(&self.program);
        if let Some(file) = &script_file {
            command.arg(file.path());
        }
        command
            .args(&args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| {
            warn!(
                target: targets::BRIDGE,
                label = %label,
                program = %self.program,
                error = %source,
                "Helper spawn failed"
            );
            Error::ProcessSpawn {
                label: label.clone(),
                source,
            }
        })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        let kill = Arc::new(Notify::new());
        let started = Instant::now();
        if let Ok(mut registry) = self.registry.lock() {
            registry.insert(
                id,
                ActiveProcess {
                    label: label.clone(),
                    pid,
                    started,
                    max_lifetime,
                    kill: kill.clone(),
                },
            );
        }
        let _guard = RegistryGuard {
            registry: self.registry.clone(),
            id,
        };

        debug!(
            target: targets::BRIDGE,
            label = %label,
            id,
            pid = ?pid,
            timeout_ms = duration_ms(timeout),
            "Helper started"
        );

        let stdin = child.stdin.take();
        let exchange = async move {
            if let (Some(mut stdin), Some(input)) = (stdin, input) {
                let mut payload = input.to_string().into_bytes();
                payload.push(b'\n');
                if let Err(error) = stdin.write_all(&payload).await {
                    debug!(target: targets::BRIDGE, error = %error, "Helper closed stdin early");
                }
                drop(stdin);
            }
            child.wait_with_output().await
        };

        let outcome = tokio::select! {
            output = exchange => Outcome::Exited(output),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = kill.notified() => Outcome::Reaped,
        };

        match outcome {
            Outcome::Exited(Ok(output)) => {
                debug!(
                    target: targets::BRIDGE,
                    label = %label,
                    id,
                    exit_code = ?output.status.code(),
                    elapsed_ms = duration_ms(started.elapsed()),
                    "Helper exited"
                );
                interpret_output(&label, output)
            }
            Outcome::Exited(Err(source)) => Err(Error::ProcessFailure {
                label,
                exit_code: None,
                stderr: source.to_string(),
            }),
            Outcome::TimedOut => {
                warn!(
                    target: targets::BRIDGE,
                    label = %label,
                    id,
                    timeout_ms = duration_ms(timeout),
                    "Helper killed after timeout"
                );
                Err(Error::ProcessTimeout {
                    label,
                    timeout_ms: duration_ms(timeout),
                })
            }
            Outcome::Reaped => Err(Error::ProcessTimeout {
                label,
                timeout_ms: duration_ms(max_lifetime),
            }),
        }
    }

    /// Live helper processes, oldest first.
    pub fn active(&self) -> Vec<ProcessInfo> {
        let now = Instant::now();
        let Ok(registry) = self.registry.lock() else {
            return Vec::new();
        };
        let mut processes: Vec<ProcessInfo> = registry
            .iter()
            .map(|(id, process)| ProcessInfo {
                id: *id,
                label: process.label.clone(),
                pid: process.pid,
                age: now.saturating_duration_since(process.started),
            })
            .collect();
        processes.sort_by_key(|process| process.id);
        processes
    }

    /// Kills every helper that has outlived its `max_lifetime` at `now`.
    pub fn reap_expired(&self, now: Instant) -> Vec<ProcessInfo> {
        let Ok(registry) = self.registry.lock() else {
            return Vec::new();
        };

        let mut reaped = Vec::new();
        for (id, process) in registry.iter() {
            let age = now.saturating_duration_since(process.started);
            if age <= process.max_lifetime {
                continue;
            }
            warn!(
                target: targets::BRIDGE,
                label = %process.label,
                id = *id,
                pid = ?process.pid,
                age_ms = duration_ms(age),
                "Reaping helper past its lifetime"
            );
            process.kill.notify_one();
            reaped.push(ProcessInfo {
                id: *id,
                label: process.label.clone(),
                pid: process.pid,
                age,
            });
        }
        reaped.sort_by_key(|process| process.id);
        reaped
    }

    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = bridge.reap_expired(Instant::now());
                trace!(
                    target: targets::BRIDGE,
                    reaped = reaped.len(),
                    "Reaper sweep"
                );
            }
        })
    }
}

fn write_script(label: &str, source: &str) -> Result<tempfile::NamedTempFile> {
    let spawn_error = |source| Error::ProcessSpawn {
        label: label.to_string(),
        source,
    };
    let mut file = tempfile::Builder::new()
        .prefix("printfleet-")
        .suffix(".script")
        .tempfile()
        .map_err(spawn_error)?;
    file.write_all(source.as_bytes()).map_err(spawn_error)?;
    file.flush().map_err(spawn_error)?;
    trace!(target: targets::BRIDGE, label = %label, path = %file.path().display(), "Script written");
    Ok(file)
}

fn parse_envelope(stdout: &str) -> Option<Envelope> {
    let trimmed = stdout.trim();
    if let Ok(envelope) = serde_json::from_str::<Envelope>(trimmed) {
        return Some(envelope);
    }
    // Vendor SDKs sometimes print progress lines before the result.
    trimmed
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<Envelope>(line).ok())
}

fn interpret_output(label: &str, output: Output) -> Result<Value> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        trace!(target: targets::BRIDGE, label = %label, stderr = %stderr.trim(), "Helper stderr");
    }

    let envelope = parse_envelope(&stdout);
    match (output.status.success(), envelope) {
        (true, Some(envelope)) if envelope.success => Ok(envelope.data),
        (_, Some(envelope)) if !envelope.success => Err(Error::ProcessReported {
            label: label.to_string(),
            message: envelope
                .error
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| "helper reported failure".to_string()),
        }),
        (true, _) => Err(Error::Parse {
            device: label.to_string(),
            details: format!("helper output is not a result envelope: {}", stdout.trim()),
        }),
        (false, _) => Err(Error::ProcessFailure {
            label: label.to_string(),
            exit_code: output.status.code(),
            stderr: stderr.into_owned(),
        }),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn shell() -> ProcessBridge {
        ProcessBridge::new("sh")
    }

    fn request(script: &str) -> BridgeRequest {
        BridgeRequest::new("test-helper", Duration::from_secs(5)).with_script(script)
    }

    #[tokio::test]
    async fn returns_envelope_data_on_success() {
        let data = shell()
            .run(request(r#"echo '{"success":true,"data":{"state":"RUNNING"}}'"#))
            .await
            .expect("helper succeeds");
        assert_eq!(data, json!({"state": "RUNNING"}));
    }

    #[tokio::test]
    async fn passes_input_on_stdin() {
        let script = r#"read line; printf '{"success":true,"data":%s}\n' "$line""#;
        let data = shell()
            .run(request(script).with_input(json!({"op": "status", "serial": "01S"})))
            .await
            .expect("helper succeeds");
        assert_eq!(data, json!({"op": "status", "serial": "01S"}));
    }

    #[tokio::test]
    async fn takes_the_last_json_line() {
        let script = "echo connecting...\necho '{\"success\":true,\"data\":1}'";
        let data = shell().run(request(script)).await.expect("helper succeeds");
        assert_eq!(data, json!(1));
    }

    #[tokio::test]
    async fn recovers_structured_error_from_failed_exit() {
        let script = r#"echo '{"success":false,"error":"printer refused"}'; exit 3"#;
        let error = shell().run(request(script)).await.expect_err("reported");
        match error {
            Error::ProcessReported { message, .. } => assert_eq!(message, "printer refused"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn falls_back_to_stderr_without_envelope() {
        let error = shell()
            .run(request("echo boom >&2; exit 2"))
            .await
            .expect_err("failure");
        match error {
            Error::ProcessFailure {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparsable_success_output_is_a_parse_error() {
        let error = shell()
            .run(request("echo not json"))
            .await
            .expect_err("parse");
        assert!(matches!(error, Error::Parse { .. }));
    }

    #[tokio::test]
    async fn hard_timeout_kills_and_unregisters() {
        let bridge = shell();
        let started = std::time::Instant::now();
        let error = bridge
            .run(BridgeRequest::new("sleeper", Duration::from_millis(200)).with_script("sleep 5"))
            .await
            .expect_err("timeout");

        assert!(matches!(error, Error::ProcessTimeout { timeout_ms: 200, .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(bridge.active().is_empty());
        assert!(error.is_connection());
    }

    #[tokio::test]
    async fn reaper_kills_processes_past_their_lifetime() {
        let bridge = shell();
        let request = BridgeRequest::new("stuck", Duration::from_secs(10))
            .with_script("sleep 5")
            .with_max_lifetime(Duration::from_millis(50));

        let sweep = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(bridge.active().len(), 1);
            bridge.reap_expired(Instant::now())
        };
        let (result, reaped) = tokio::join!(bridge.run(request), sweep);

        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].label, "stuck");
        assert!(matches!(result, Err(Error::ProcessTimeout { .. })));
        assert!(bridge.active().is_empty());
    }

    #[tokio::test]
    async fn reaper_leaves_young_processes_alone() {
        let bridge = shell();
        let request = BridgeRequest::new("young", Duration::from_secs(5))
            .with_script(r#"sleep 0.2; echo '{"success":true,"data":null}'"#)
            .with_max_lifetime(Duration::from_secs(30));

        let sweep = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            bridge.reap_expired(Instant::now())
        };
        let (result, reaped) = tokio::join!(bridge.run(request), sweep);
        assert!(reaped.is_empty());
        assert_eq!(result.expect("helper succeeds"), Value::Null);
    }

    #[tokio::test]
    async fn script_file_is_removed_after_the_call() {
        let script = r#"printf '{"success":true,"data":"%s"}\n' "$0""#;
        let data = shell().run(request(script)).await.expect("helper succeeds");
        let path = data.as_str().expect("script path").to_string();
        assert!(path.contains("printfleet-"));
        assert!(!std::path::Path::new(&path).exists());
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_spawn_error() {
        let error = ProcessBridge::new("/nonexistent/printfleet-interpreter")
            .run(request("true"))
            .await
            .expect_err("spawn");
        assert!(matches!(error, Error::ProcessSpawn { .. }));
        assert!(error.is_connection());
    }
}

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use printfleet_core::{
    persist_updates, targets, AdapterSet, BackoffTracker, BambuAdapter, ConcurrencyLimiter, Device,
    DeviceSnapshot, Error, FileId, FileRecord, FleetConfig, JobId, JobStatus, LocalFileStore,
    MoonrakerAdapter, PollUpdate, PrintDispatcher, PrintJob, ProcessBridge, ProtocolKind,
    PrusaLinkAdapter, Result, RonStore, StatusPoller,
};

use crate::logging::{apply_log_level, ReloadHandle};
use crate::{Cli, Command};

/// Extra time the outer poll deadline allows over the adapter's own timeout.
const DEADLINE_SLACK: Duration = Duration::from_secs(1);

/// Aborts the wrapped task when dropped, on every exit path of a command.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Process-lifetime instances shared by every command.
struct Fleet {
    config: FleetConfig,
    adapters: AdapterSet,
    bridge: ProcessBridge,
    backoff: Arc<BackoffTracker>,
    poll_limiter: ConcurrencyLimiter,
    write_limiter: ConcurrencyLimiter,
}

impl Fleet {
    fn build(config: FleetConfig) -> Result<Self> {
        let bridge = ProcessBridge::new(config.bridge.program.clone());
        let adapters = AdapterSet::new()
            .with(Arc::new(PrusaLinkAdapter::new(config.timeouts.clone())?))
            .with(Arc::new(MoonrakerAdapter::new(config.timeouts.clone())?))
            .with(Arc::new(BambuAdapter::new(bridge.clone(), config.bridge.clone())));

        Ok(Self {
            poll_limiter: ConcurrencyLimiter::new("poll", config.polling.poll_concurrency),
            write_limiter: ConcurrencyLimiter::new("write", config.polling.write_concurrency),
            backoff: Arc::new(BackoffTracker::new()),
            adapters,
            bridge,
            config,
        })
    }

    fn poller(&self) -> StatusPoller {
        // A status fetch may issue two requests back to back.
        let http_deadline = self.config.timeouts.status() * 2 + DEADLINE_SLACK;
        StatusPoller::new(
            self.adapters.clone(),
            self.backoff.clone(),
            self.poll_limiter.clone(),
            self.config.polling.backoff_window(),
        )
        .with_call_timeout(http_deadline)
        .with_protocol_timeout(
            ProtocolKind::BambuLab,
            self.config.bridge.status_timeout() + DEADLINE_SLACK,
        )
    }

    fn dispatcher(&self, store: Arc<RonStore>) -> PrintDispatcher {
        PrintDispatcher::new(
            self.adapters.clone(),
            store,
            Arc::new(LocalFileStore),
            self.write_limiter.clone(),
        )
    }

    fn device(&self, id: &str) -> Result<&Device> {
        self.config.device(id).ok_or_else(|| Error::Config {
            path: None,
            details: format!("no device named {id} in the fleet file"),
        })
    }
}

pub async fn run(cli: Cli, reload_handle: ReloadHandle) -> ExitCode {
    match execute(cli, &reload_handle).await {
        Ok(code) => code,
        Err(error) => {
            error!(
                target: targets::CLI,
                class = ?error.class(),
                error = %error.technical_detail(),
                "Command failed"
            );
            eprintln!("{}", error.user_summary());
            eprintln!("  {}", error.technical_detail());
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli, reload_handle: &ReloadHandle) -> Result<ExitCode> {
    let config = FleetConfig::load(&cli.config)?;
    if cli.log_level.is_none() {
        if let Some(level) = config.log_level {
            apply_log_level(reload_handle, level);
        }
    }

    let fleet = Fleet::build(config)?;
    let _reaper = AbortOnDrop(
        fleet
            .bridge
            .spawn_reaper(fleet.config.bridge.sweep_interval()),
    );

    match cli.command {
        Command::Poll => {
            let store = open_store(&fleet).await?;
            poll_once(&fleet, &fleet.poller(), &store).await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch => {
            let store = open_store(&fleet).await?;
            watch(&fleet, &store).await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Submit { device, file, hold } => {
            let store = Arc::new(open_store(&fleet).await?);
            submit(&fleet, store, &device, &file, !hold).await
        }
        Command::Stop { device } => {
            let store = Arc::new(open_store(&fleet).await?);
            let device = fleet.device(&device)?;
            fleet.dispatcher(store).stop(device).await?;
            println!("{}: print cancelled", device.id);
            Ok(ExitCode::SUCCESS)
        }
        Command::Gcode { device, script } => {
            let store = Arc::new(open_store(&fleet).await?);
            let device = fleet.device(&device)?;
            fleet.dispatcher(store).send_gcode(device, &script).await?;
            println!("{}: G-code sent", device.id);
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => Ok(check(&fleet).await),
    }
}

async fn open_store(fleet: &Fleet) -> Result<RonStore> {
    RonStore::open(fleet.config.storage.state_path.clone()).await
}

async fn poll_once(fleet: &Fleet, poller: &StatusPoller, store: &RonStore) {
    let updates = poller.poll_all(&fleet.config.devices).await;
    for update in &updates {
        println!("{}", describe(update));
    }
    let report = persist_updates(store, updates, &fleet.write_limiter).await;
    if report.failed > 0 {
        warn!(
            target: targets::STORAGE,
            failed = report.failed,
            path = %store.path().display(),
            "Some poll results were not saved"
        );
    }
}

async fn watch(fleet: &Fleet, store: &RonStore) {
    let poller = fleet.poller();
    let mut ticker = tokio::time::interval(fleet.config.polling.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        target: targets::CLI,
        interval_secs = fleet.config.polling.interval_secs,
        devices = fleet.config.devices.len(),
        "Watching fleet"
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }
        // Dropping an unfinished cycle kills any helper processes it started.
        tokio::select! {
            _ = &mut shutdown => break,
            () = poll_once(fleet, &poller, store) => {}
        }
    }

    info!(
        target: targets::CLI,
        helpers = fleet.bridge.active().len(),
        "Interrupted, stopping"
    );
}

async fn submit(
    fleet: &Fleet,
    store: Arc<RonStore>,
    device_id: &str,
    path: &Path,
    print_now: bool,
) -> Result<ExitCode> {
    let device = fleet.device(device_id)?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Config {
            path: None,
            details: format!("{} does not name a file", path.display()),
        })?;
    let file = FileRecord {
        id: FileId::new(Uuid::new_v4().to_string()),
        name,
        path: path.to_path_buf(),
    };
    let job = PrintJob::new(
        JobId::new(Uuid::new_v4().to_string()),
        file.id.clone(),
        device.id.clone(),
    );

    let job = fleet
        .dispatcher(store)
        .submit(job, &file, device, print_now)
        .await;

    println!("job {} on {}: {}", job.id, device.id, job.status);
    if let Some(remote) = &job.remote_name {
        println!("  remote file: {remote}");
    }
    if let Some(error) = &job.error {
        println!("  error: {error}");
    }

    Ok(if job.status == JobStatus::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn check(fleet: &Fleet) -> ExitCode {
    let checks = fleet.config.devices.iter().map(|device| async move {
        let result = match fleet.adapters.for_device(device) {
            Ok(adapter) => adapter.test_connection(device).await,
            Err(error) => Err(error),
        };
        (device, result)
    });

    let mut failed = 0;
    for (device, result) in join_all(checks).await {
        match result {
            Ok(info) => println!("{:<16} ok      {info}", device.id.as_str()),
            Err(error) => {
                failed += 1;
                warn!(
                    target: targets::CLI,
                    device = %device.id,
                    error = %error.technical_detail(),
                    "Connection check failed"
                );
                println!("{:<16} failed  {}", device.id.as_str(), error.user_summary());
            }
        }
    }

    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn describe(update: &PollUpdate) -> String {
    match update {
        PollUpdate::Touch { device_id, .. } => format!("{:<16} not managed", device_id.as_str()),
        PollUpdate::Snapshot(snapshot) => describe_snapshot(snapshot),
    }
}

fn describe_snapshot(snapshot: &DeviceSnapshot) -> String {
    let mut line = format!(
        "{:<16} {:<8}",
        snapshot.device_id.as_str(),
        snapshot.state.to_string()
    );
    if let Some(bed) = snapshot.bed_temp_c {
        line.push_str(&format!(" bed={bed:.1}C"));
    }
    if let Some(tool) = snapshot.tool_temp_c {
        line.push_str(&format!(" tool={tool:.1}C"));
    }
    if let Some(progress) = snapshot.progress {
        line.push_str(&format!(" {:.0}%", progress * 100.0));
    }
    if let Some(remaining) = snapshot.remaining_seconds {
        line.push_str(&format!(" {}m left", remaining.div_ceil(60)));
    }
    if let Some(file) = &snapshot.job_file_name {
        line.push_str(&format!(" {file}"));
    }
    line
}

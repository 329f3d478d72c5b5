use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::adapter::{split_extension, AdapterSet, UploadRequest};
use crate::limiter::ConcurrencyLimiter;
use crate::model::{now_epoch_seconds, Device, FileRecord, JobStatus, PrintJob};
use crate::store::{FileStore, JobStore, JobUpdate};
use crate::{targets, Error, Result};

static REMOTE_NAME_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique on-device name for one upload attempt: `<stem>_<millis>-<seq><ext>`.
pub fn remote_file_name(file_name: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    let sequence = REMOTE_NAME_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format_remote_name(file_name, millis, sequence)
}

fn format_remote_name(file_name: &str, millis: u128, sequence: u64) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .trim();
    let (stem, extension) = split_extension(base);
    let stem = if stem.is_empty() { "upload" } else { stem };
    format!("{stem}_{millis}-{sequence}{extension}")
}

/// Drives a print job from upload to print start.
///
/// Jobs move `uploaded -> pending -> printing` on success. A file kept on the
/// device without printing returns to `uploaded`; every failure ends in
/// `failed` with a message naming the step that broke. Each transition is
/// written to the job store before the next step starts.
pub struct PrintDispatcher {
    adapters: AdapterSet,
    jobs: Arc<dyn JobStore>,
    files: Arc<dyn FileStore>,
    write_limiter: ConcurrencyLimiter,
}

impl PrintDispatcher {
    pub fn new(
        adapters: AdapterSet,
        jobs: Arc<dyn JobStore>,
        files: Arc<dyn FileStore>,
        write_limiter: ConcurrencyLimiter,
    ) -> Self {
        Self {
            adapters,
            jobs,
            files,
            write_limiter,
        }
    }

    /// Runs `job` to a final state and returns it. Never fails; problems are
    /// recorded on the job. A job that cannot start over (already printing,
    /// failed or pending) is returned untouched and nothing is stored.
    pub async fn submit(
        &self,
        job: PrintJob,
        file: &FileRecord,
        device: &Device,
        print_now: bool,
    ) -> PrintJob {
        if !job.status.can_transition_to(JobStatus::Pending) {
            let error = Error::InvalidTransition {
                from: job.status,
                to: JobStatus::Pending,
            };
            warn!(
                target: targets::DISPATCH,
                job = %job.id,
                error = %error.technical_detail(),
                "Refusing to resubmit job"
            );
            return job;
        }

        let mut job = match self.write_limiter.run(self.jobs.create_job(job.clone())).await {
            Ok(Ok(created)) => created,
            Ok(Err(error)) | Err(error) => {
                warn!(
                    target: targets::DISPATCH,
                    job = %job.id,
                    error = %error.technical_detail(),
                    "Failed to record new job"
                );
                job
            }
        };

        info!(
            target: targets::DISPATCH,
            job = %job.id,
            device = %device.id,
            file = %file.name,
            print_now,
            "Job submitted"
        );

        let adapter = match self.adapters.for_device(device) {
            Ok(adapter) => adapter,
            Err(error) => {
                self.fail(&mut job, error.user_summary()).await;
                return job;
            }
        };

        if let Err(error) = adapter.check_format(&file.name) {
            debug!(
                target: targets::DISPATCH,
                job = %job.id,
                error = %error.technical_detail(),
                "Rejected incompatible file"
            );
            self.fail(&mut job, error.user_summary()).await;
            return job;
        }

        if self.transition(&mut job, JobStatus::Pending, None).await.is_err() {
            return job;
        }

        let data = match self.files.read_file(&file.path).await {
            Ok(data) => data,
            Err(error) => {
                self.fail(&mut job, error.technical_detail()).await;
                return job;
            }
        };

        let remote_name = remote_file_name(&file.name);
        let request = UploadRequest {
            remote_name: remote_name.clone(),
            data,
        };
        let uploaded = match adapter.upload(device, request).await {
            Ok(uploaded) => uploaded,
            Err(error) => {
                warn!(
                    target: targets::DISPATCH,
                    job = %job.id,
                    device = %device.id,
                    error = %error.technical_detail(),
                    "Upload failed"
                );
                self.fail(&mut job, format!("upload failed: {}", error.technical_detail()))
                    .await;
                return job;
            }
        };

        info!(
            target: targets::DISPATCH,
            job = %job.id,
            device = %device.id,
            remote = %uploaded.remote_name,
            bytes = uploaded.bytes,
            "File uploaded"
        );
        job.remote_name = Some(uploaded.remote_name.clone());

        if !print_now {
            let _ = self.transition(&mut job, JobStatus::Uploaded, None).await;
            return job;
        }

        match adapter.start_print(device, &uploaded.remote_name).await {
            Ok(()) => {
                let _ = self.transition(&mut job, JobStatus::Printing, None).await;
            }
            Err(error) => {
                warn!(
                    target: targets::DISPATCH,
                    job = %job.id,
                    device = %device.id,
                    error = %error.technical_detail(),
                    "Print start failed after upload"
                );
                self.fail(
                    &mut job,
                    format!(
                        "file uploaded as {} but print did not start: {}",
                        uploaded.remote_name,
                        error.technical_detail()
                    ),
                )
                .await;
            }
        }
        job
    }

    /// Cancels whatever `device` is printing.
    pub async fn stop(&self, device: &Device) -> Result<()> {
        let adapter = self.adapters.for_device(device)?;
        adapter.stop_print(device).await?;
        info!(target: targets::DISPATCH, device = %device.id, "Print stopped");
        Ok(())
    }

    /// Sends a console G-code script to `device`.
    pub async fn send_gcode(&self, device: &Device, script: &str) -> Result<()> {
        let script = script.trim();
        if script.is_empty() {
            return Err(Error::Config {
                path: None,
                details: "G-code script is empty".to_string(),
            });
        }
        let adapter = self.adapters.for_device(device)?;
        adapter.send_gcode(device, script).await?;
        info!(target: targets::DISPATCH, device = %device.id, script, "G-code sent");
        Ok(())
    }

    async fn fail(&self, job: &mut PrintJob, message: String) {
        let _ = self.transition(job, JobStatus::Failed, Some(message)).await;
    }

    /// Applies one edge of the job state machine and records it. An illegal
    /// edge leaves the job and the store untouched.
    async fn transition(
        &self,
        job: &mut PrintJob,
        next: JobStatus,
        error: Option<String>,
    ) -> Result<()> {
        if !job.status.can_transition_to(next) {
            let error = Error::InvalidTransition {
                from: job.status,
                to: next,
            };
            warn!(
                target: targets::DISPATCH,
                job = %job.id,
                error = %error.technical_detail(),
                "Refusing job transition"
            );
            return Err(error);
        }
        job.status = next;
        job.error = error;
        job.updated_at = now_epoch_seconds();

        debug!(
            target: targets::DISPATCH,
            job = %job.id,
            status = %job.status,
            "Job transition"
        );
        self.record(job).await;
        Ok(())
    }

    async fn record(&self, job: &PrintJob) {
        let update = JobUpdate::from_job(job);
        let result = self
            .write_limiter
            .run(self.jobs.update_job(job.id.clone(), update))
            .await
            .and_then(|stored| stored);
        if let Err(error) = result {
            warn!(
                target: targets::STORAGE,
                job = %job.id,
                error = %error.technical_detail(),
                "Failed to persist job transition"
            );
        }
    }
}

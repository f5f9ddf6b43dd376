use chrono::Utc;
use compute_common::{EventType, InstanceEvent, InstanceState, VmDetails, VmDiskSource};
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::converter::{default_converters, Converter, ExportOptions};
use super::job::{ExportFormat, ExportJob, ExportParams, JobOwner, JobState};
use super::{ExportError, Result};
use crate::event_bus::EventBus;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    /// Staging area for multi-step formats; system temp when unset.
    pub temp_dir: Option<PathBuf>,
    pub default_format: ExportFormat,
    pub max_concurrent: usize,
    pub default_pool: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/var/lib/compute/exports"),
            temp_dir: None,
            default_format: ExportFormat::Qcow2,
            max_concurrent: 4,
            default_pool: "default".to_string(),
        }
    }
}

struct JobEntry {
    job: ExportJob,
    actor: String,
    destination: PathBuf,
    cancel: CancellationToken,
}

struct Inner {
    config: ExportConfig,
    source: Arc<dyn VmDiskSource>,
    converters: HashMap<ExportFormat, Arc<dyn Converter>>,
    jobs: DashMap<String, JobEntry>,
    permits: Arc<Semaphore>,
    events: OnceLock<Arc<EventBus>>,
}

/// Queues export jobs and runs one worker task per job, at most
/// `max_concurrent` converting at a time.
#[derive(Clone)]
pub struct ExportManager {
    inner: Arc<Inner>,
}

impl ExportManager {
    pub fn new(config: ExportConfig, source: Arc<dyn VmDiskSource>) -> Self {
        let converters = default_converters(config.temp_dir.clone());
        Self::with_converters(config, source, converters)
    }

    pub fn with_converters(
        config: ExportConfig,
        source: Arc<dyn VmDiskSource>,
        converters: HashMap<ExportFormat, Arc<dyn Converter>>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                converters,
                jobs: DashMap::new(),
                permits,
                events: OnceLock::new(),
            }),
        }
    }

    /// Publish job progress on `events`, keyed by the job's instance id.
    /// Only the first bus attached is used.
    pub fn attach_events(&self, events: Arc<EventBus>) -> bool {
        self.inner.events.set(events).is_ok()
    }

    pub fn config(&self) -> &ExportConfig {
        &self.inner.config
    }

    pub fn supports(&self, format: ExportFormat) -> bool {
        self.inner.converters.contains_key(&format)
    }

    /// Resolve the format, or the configured default when `requested` is empty.
    pub fn resolve_format(&self, requested: &str) -> Result<ExportFormat> {
        let format = if requested.trim().is_empty() {
            self.inner.config.default_format
        } else {
            requested.parse()?
        };
        if !self.supports(format) {
            return Err(ExportError::UnsupportedFormat(format.to_string()));
        }
        Ok(format)
    }

    /// Validate and enqueue. The returned job is still `pending`.
    #[instrument(skip(self, params, owner), fields(format = %params.format))]
    pub async fn create_job(
        &self,
        vm_name: &str,
        params: &ExportParams,
        owner: impl Into<JobOwner>,
    ) -> Result<ExportJob> {
        let owner = owner.into();
        let format = self.resolve_format(&params.format)?;
        let converter = self.converter(format)?;
        let vm = self.inner.source.vm_details(vm_name).await?;

        let mut options = params.options.clone();
        options
            .entry("vm_name".to_string())
            .or_insert_with(|| vm.name.clone());
        converter.validate_options(&options)?;

        let file_name = match params.file_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => validate_file_name(name)?.to_string(),
            None => default_file_name(&vm.name, format),
        };
        let destination = self.inner.config.output_dir.join(file_name);

        let mut job = ExportJob::new(vm.name.clone(), format, options, owner.user_id);
        job.instance_id = owner.instance_id.unwrap_or_else(|| vm.uuid.clone());
        let cancel = CancellationToken::new();
        self.inner.jobs.insert(
            job.id.clone(),
            JobEntry {
                job: job.clone(),
                actor: owner.actor,
                destination,
                cancel: cancel.clone(),
            },
        );
        info!(job_id = %job.id, vm = %job.vm_name, format = %format, "Export job queued");
        self.inner.notify(&job.id);

        let inner = self.inner.clone();
        let id = job.id.clone();
        tokio::spawn(async move { inner.run(id, cancel).await });

        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<ExportJob> {
        self.inner
            .jobs
            .get(id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| ExportError::JobNotFound(id.to_string()))
    }

    /// Newest first.
    pub fn list_jobs(&self) -> Vec<ExportJob> {
        let mut jobs: Vec<ExportJob> = self.inner.jobs.iter().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        jobs
    }

    /// Mark the job canceled, stop its worker and remove any partial output.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, id: &str) -> Result<ExportJob> {
        let (job, output) = {
            let mut entry = self
                .inner
                .jobs
                .get_mut(id)
                .ok_or_else(|| ExportError::JobNotFound(id.to_string()))?;
            let state = entry.job.state;
            if !entry.job.transition(JobState::Canceled) {
                return Err(ExportError::NotCancelable {
                    id: id.to_string(),
                    state,
                });
            }
            entry.cancel.cancel();
            (entry.job.clone(), entry.job.output_path.clone())
        };

        if !output.is_empty() {
            remove_partial(Path::new(&output)).await;
        }
        info!(job_id = %id, progress = job.progress, "Export job canceled");
        self.inner.notify(id);
        Ok(job)
    }

    fn converter(&self, format: ExportFormat) -> Result<Arc<dyn Converter>> {
        self.inner
            .converters
            .get(&format)
            .cloned()
            .ok_or_else(|| ExportError::UnsupportedFormat(format.to_string()))
    }
}

impl Inner {
    /// Mutate a job that is still running. False once it reached a terminal
    /// state (usually because it was canceled).
    fn update(&self, id: &str, f: impl FnOnce(&mut ExportJob)) -> bool {
        match self.jobs.get_mut(id) {
            Some(mut entry) if entry.job.state == JobState::Running => {
                f(&mut entry.job);
                true
            }
            _ => false,
        }
    }

    fn checkpoint(&self, id: &str, progress: u8) -> Result<()> {
        if self.update(id, |job| job.advance(progress)) {
            self.notify(id);
            Ok(())
        } else {
            Err(ExportError::Canceled)
        }
    }

    /// Publish the job's current state. Running jobs report as `progress`
    /// after their first event.
    fn notify(&self, id: &str) {
        let Some(events) = self.events.get() else {
            return;
        };
        let Some((job, actor)) = self
            .jobs
            .get(id)
            .map(|entry| (entry.job.clone(), entry.actor.clone()))
        else {
            return;
        };

        let status = match job.state {
            JobState::Running if job.progress > 5 => "progress",
            state => state.as_str(),
        };
        let event_type = if job.state == JobState::Failed {
            EventType::Error
        } else {
            EventType::Info
        };
        let mut event = InstanceEvent::new(&job.instance_id, event_type, "export", status)
            .with_user(actor)
            .with_detail("job_id", job.id.clone())
            .with_detail("format", job.format.as_str())
            .with_detail("progress", job.progress);
        if job.state == JobState::Completed {
            event = event.with_detail("output_path", job.output_path.clone());
        }
        if let Some(error) = &job.error {
            event = event.with_message(error.clone());
        }
        events.publish(event);
    }

    async fn run(self: Arc<Self>, id: String, cancel: CancellationToken) {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return,
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let started = self
            .jobs
            .get_mut(&id)
            .map(|mut entry| {
                let ok = entry.job.transition(JobState::Running);
                entry.job.advance(5);
                ok
            })
            .unwrap_or(false);
        if !started {
            return;
        }
        self.notify(&id);

        match self.execute(&id, &cancel).await {
            Ok(output) => {
                let output = output.to_string_lossy().into_owned();
                let completed = self
                    .jobs
                    .get_mut(&id)
                    .map(|mut entry| {
                        let ok = entry.job.transition(JobState::Completed);
                        if ok {
                            entry.job.advance(100);
                            entry.job.output_path = output.clone();
                        }
                        ok
                    })
                    .unwrap_or(false);
                if completed {
                    info!(job_id = %id, output = %output, "Export job completed");
                    self.notify(&id);
                }
            }
            Err(ExportError::Canceled) => {
                if let Some(entry) = self.jobs.get(&id).map(|e| e.destination.clone()) {
                    remove_partial(&entry).await;
                }
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "Export job failed");
                let destination = self.jobs.get_mut(&id).and_then(|mut entry| {
                    if entry.job.transition(JobState::Failed) {
                        entry.job.error = Some(e.to_string());
                        entry.job.output_path.clear();
                        Some(entry.destination.clone())
                    } else {
                        None
                    }
                });
                if let Some(path) = destination {
                    remove_partial(&path).await;
                    self.notify(&id);
                }
            }
        }
    }

    async fn execute(&self, id: &str, cancel: &CancellationToken) -> Result<PathBuf> {
        let (vm_name, format, mut options, destination) = {
            let entry = self
                .jobs
                .get(id)
                .ok_or_else(|| ExportError::JobNotFound(id.to_string()))?;
            (
                entry.job.vm_name.clone(),
                entry.job.format,
                entry.job.options.clone(),
                entry.destination.clone(),
            )
        };
        let converter = self
            .converters
            .get(&format)
            .cloned()
            .ok_or_else(|| ExportError::UnsupportedFormat(format.to_string()))?;

        let vm = self.source.vm_details(&vm_name).await?;
        self.checkpoint(id, 10)?;

        let (source_path, source_format) = self.resolve_disk(&vm, &options).await?;
        self.checkpoint(id, 20)?;

        options.insert("vm_name".to_string(), vm.name.clone());
        options.insert("vm_uuid".to_string(), vm.uuid.clone());
        options.insert("cpu_count".to_string(), vm.vcpus.to_string());
        options.insert(
            "memory_mb".to_string(),
            (vm.memory_bytes / BYTES_PER_MB).to_string(),
        );
        if let Some(fmt) = source_format {
            options.entry("source_format".to_string()).or_insert(fmt);
        }
        let snapshot = options.clone();
        if !self.update(id, |job| job.options = snapshot) {
            return Err(ExportError::Canceled);
        }
        self.checkpoint(id, 30)?;

        let stop_requested = matches!(
            options.get("stop_vm").map(String::as_str),
            Some("true") | Some("1")
        );
        let running = vm.state == InstanceState::Running;
        let restart = if running && stop_requested {
            info!(vm = %vm.name, "Stopping VM for a consistent export");
            self.source.stop_vm(&vm.name).await?;
            true
        } else {
            if running {
                warn!(vm = %vm.name, "Exporting a running VM; the image may be inconsistent");
            }
            false
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let output = destination.to_string_lossy().into_owned();
        let converting = self.update(id, |job| {
            job.output_path = output;
            job.advance(40);
        });
        if converting {
            self.notify(id);
        }
        let result = if converting {
            converter
                .convert(Path::new(&source_path), &destination, &options, cancel)
                .await
        } else {
            Err(ExportError::Canceled)
        };

        if restart {
            if let Err(e) = self.source.start_vm(&vm.name).await {
                warn!(vm = %vm.name, error = %e, "Failed to restart VM after export");
            }
        }
        result.map(|_| destination)
    }

    /// Locate the disk image to export, as (path, image format).
    async fn resolve_disk(
        &self,
        vm: &VmDetails,
        options: &ExportOptions,
    ) -> Result<(String, Option<String>)> {
        let default_pool = self.config.default_pool.as_str();
        if let Some(volume) = options.get("source_volume").filter(|v| !v.is_empty()) {
            let path = self.source.volume_path(default_pool, volume).await?;
            return Ok((path, None));
        }

        let disk = vm
            .disks
            .first()
            .ok_or_else(|| ExportError::DiskNotFound(vm.name.clone()))?;
        let pool = disk.pool.as_deref().unwrap_or(default_pool);

        let mut candidates: Vec<(&str, String)> = Vec::new();
        if let Some(volume) = disk.volume.as_deref() {
            candidates.push((pool, volume.to_string()));
        }
        candidates.push((pool, format!("{}-disk-0", vm.name)));
        if let Some(base) = Path::new(&disk.path).file_name().and_then(|n| n.to_str()) {
            candidates.push((pool, base.to_string()));
            if pool != default_pool {
                candidates.push((default_pool, base.to_string()));
            }
        }

        for (pool, volume) in candidates {
            if let Ok(path) = self.source.volume_path(pool, &volume).await {
                return Ok((path, disk.format.clone()));
            }
        }
        Err(ExportError::DiskNotFound(vm.name.clone()))
    }
}

fn default_file_name(vm_name: &str, format: ExportFormat) -> String {
    format!(
        "{vm_name}-{}.{}",
        Utc::now().format("%Y%m%d-%H%M%S"),
        format.as_str()
    )
}

fn validate_file_name(name: &str) -> Result<&str> {
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(ExportError::InvalidOptions(format!(
            "file name must not contain a path: {name}"
        )));
    }
    Ok(name)
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial export"),
    }
}

//! Job lifecycle orchestration.
//!
//! [`JobController`] is the entry point of the core: it accepts uploads,
//! dispatches separations to the worker pool of the requested device,
//! forwards their progress to the job's feed and renders mixes from the
//! persisted stems.
//!
//! Request-time errors (unknown job, wrong state, bad parameters) are
//! returned to the caller and never change a job. Failures inside a running
//! separation move the job to FAILED and close its feed with a failure event.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::progress::{ProgressChannel, ProgressStream};
use super::purge::{ExpiredJobs, JobPurgeService, PurgeConfig};
use super::store::JobStore;
use super::worker_pool::{
    PoolTask, SHUTDOWN_REASON, TaskRunner, WorkerPool, WorkerPoolConfig, WorkerType,
};
use crate::config::AppConfig;
use crate::domain::job::VideoTrack;
use crate::domain::{
    Device, Job, JobSnapshot, JobState, MixArtifact, MixArtifactKind, MixParameters,
    ProgressEvent, ProgressPhase, StemSet,
};
use crate::media::formats::{self, MediaKind};
use crate::media::{FfmpegTools, MediaIngest, StoredUpload};
use crate::remix::{FfmpegDenoiser, Muxer, RemixEngine};
use crate::separation::{
    DemucsBackend, DeviceAvailability, ProgressReporter, SeparationAdapter, SeparationRequest,
};
use crate::utils::filename::is_plain_file_name;
use crate::utils::fs::{ensure_dir_all, ensure_dir_all_sync, is_file, remove_dir_all_if_exists};
use crate::{Error, Result};

/// Buffer between a running separation and the progress forwarder.
const SEPARATION_PROGRESS_BUFFER: usize = 64;

/// Acknowledgment of a processing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessAck {
    pub job_id: String,
    pub state: JobState,
    pub device: Device,
}

struct ControllerInner {
    jobs_dir: PathBuf,
    store: JobStore,
    progress: Arc<ProgressChannel>,
    ingest: MediaIngest,
    separation: SeparationAdapter,
    remix: RemixEngine,
    cpu_pool: WorkerPool,
    gpu_pool: WorkerPool,
    /// Cancellation tokens of jobs that are queued or running.
    job_tokens: DashMap<String, CancellationToken>,
    purge: PurgeConfig,
    root_token: CancellationToken,
}

impl ControllerInner {
    fn pool(&self, device: Device) -> &WorkerPool {
        match WorkerType::from(device) {
            WorkerType::Cpu => &self.cpu_pool,
            WorkerType::Gpu => &self.gpu_pool,
        }
    }

    fn publish(&self, job_id: &str, phase: ProgressPhase, percent: f32, message: &str) {
        let event = ProgressEvent::new(job_id, phase, percent, message);
        if !self.progress.publish(event) {
            debug!(job_id = %job_id, phase = %phase, percent, "Progress event dropped");
        }
    }

    /// Move a job to FAILED and close its feed.
    fn fail_job(&self, job_id: &str, detail: &str) {
        self.job_tokens.remove(job_id);
        match self.store.update(job_id, |job| job.fail(detail)) {
            Ok(()) => {
                warn!(job_id = %job_id, "Job failed: {}", detail);
                self.progress.publish(ProgressEvent::failed(job_id, detail));
            }
            // Deleted, or already terminal.
            Err(e) => debug!(job_id = %job_id, "Not marking job failed: {}", e),
        }
    }

    /// Decode, separate and persist the stems of one job.
    async fn process(&self, task: &PoolTask) -> Result<()> {
        let job_id = task.job_id.as_str();
        let job = self.store.get(job_id)?;

        let (kind, extension) = formats::classify(&job.source_name)?;
        let upload = StoredUpload {
            file_name: job.source_name.clone(),
            path: job.source_path.clone(),
            kind,
            extension,
        };

        let canonical = self.ingest.decode(&upload, &job.work_dir).await?;
        self.publish(job_id, ProgressPhase::Loading, 100.0, "audio decoded");

        self.store.update(job_id, |job| {
            job.start_separating(canonical.path.clone(), canonical.duration_secs)?;
            if !canonical.has_video {
                job.video = None;
            }
            Ok(())
        })?;
        info!(
            job_id = %job_id,
            device = %task.device,
            duration_secs = canonical.duration_secs,
            "Separation started"
        );
        self.publish(job_id, ProgressPhase::Separating, 0.0, "separating");

        let (tx, mut rx) = mpsc::channel(SEPARATION_PROGRESS_BUFFER);
        let reporter = ProgressReporter::new(job_id, tx);
        let progress = self.progress.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                progress.publish(ProgressEvent::new(
                    update.job_id,
                    ProgressPhase::Separating,
                    update.percent,
                    update.message,
                ));
            }
        });

        let request = SeparationRequest {
            job_id: job_id.to_string(),
            input: canonical.path.clone(),
            work_dir: job.work_dir.clone(),
        };
        let result = self.separation.separate(request, task.device, reporter).await;
        // The reporter was moved into `separate`, so the forwarder drains and ends.
        let _ = forwarder.await;
        let stems = result?;
        self.publish(job_id, ProgressPhase::Separating, 100.0, "separation complete");

        self.publish(job_id, ProgressPhase::Finalizing, 0.0, "finalizing stems");
        let missing = stems.missing().await;
        if !missing.is_empty() {
            let names: Vec<_> = missing.iter().map(|k| k.as_str()).collect();
            return Err(Error::Separation(format!(
                "stems missing after separation: {}",
                names.join(", ")
            )));
        }

        self.store.update(job_id, |job| job.complete(stems.clone()))?;
        self.job_tokens.remove(job_id);
        info!(job_id = %job_id, "Job separated");
        self.publish(job_id, ProgressPhase::Separated, 100.0, "separated");
        Ok(())
    }
}

/// Runs pool tasks against the controller without keeping it alive.
struct JobRunner {
    inner: Weak<ControllerInner>,
}

#[async_trait]
impl TaskRunner for JobRunner {
    async fn run(&self, task: &PoolTask) -> Result<()> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| Error::Other(SHUTDOWN_REASON.to_string()))?;
        inner.process(task).await
    }

    async fn abort(&self, task: &PoolTask, reason: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.fail_job(&task.job_id, reason);
        }
    }
}

/// Handle to the job lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct JobController {
    inner: Arc<ControllerInner>,
}

impl JobController {
    /// Controller with the default collaborators: demucs for separation and
    /// ffmpeg for decoding, noise suppression and remuxing.
    pub fn new(config: &AppConfig) -> Result<Self> {
        let backend = DemucsBackend::new(
            config.separation.python_path.clone(),
            config.separation.model.clone(),
        );
        let separation = SeparationAdapter::new(
            Arc::new(backend),
            DeviceAvailability::new(config.separation.gpu_available),
        )
        .with_transient_retry(config.separation.transient_retry);

        let tools = FfmpegTools::new(
            config.media.ffmpeg_path.clone(),
            config.media.ffprobe_path.clone(),
        );
        let denoiser =
            FfmpegDenoiser::new(tools.clone()).with_noise_floor_db(config.remix.noise_floor_db);
        let remix = RemixEngine::new(Arc::new(denoiser), Muxer::new(tools))
            .with_limiter(config.remix.limiter)
            .with_encoding(config.remix.wav_encoding);

        Self::with_components(config, separation, remix)
    }

    /// Controller with explicit separation and remix collaborators.
    ///
    /// Starts the worker pools and, when a TTL is configured, the purge task.
    /// Must be called from within a tokio runtime.
    pub fn with_components(
        config: &AppConfig,
        separation: SeparationAdapter,
        remix: RemixEngine,
    ) -> Result<Self> {
        config.validate()?;
        ensure_dir_all_sync(&config.storage.jobs_dir)?;

        let root_token = CancellationToken::new();
        let pool = |worker_type, max_workers| {
            WorkerPool::with_config(
                worker_type,
                WorkerPoolConfig {
                    max_workers,
                    job_timeout_secs: config.separation.job_timeout_secs,
                    ..WorkerPoolConfig::default()
                },
            )
            .with_cancellation_token(root_token.child_token())
        };

        let tools = FfmpegTools::new(
            config.media.ffmpeg_path.clone(),
            config.media.ffprobe_path.clone(),
        );
        let ingest = MediaIngest::new(tools, config.media.sample_rate, config.media.channels)
            .with_max_upload_bytes(config.media.max_upload_bytes);

        let inner = Arc::new(ControllerInner {
            jobs_dir: config.storage.jobs_dir.clone(),
            store: JobStore::new(),
            progress: Arc::new(ProgressChannel::new(
                config.progress.history_capacity,
                config.progress.channel_capacity,
            )),
            ingest,
            separation,
            remix,
            cpu_pool: pool(WorkerType::Cpu, config.separation.cpu_slots),
            gpu_pool: pool(WorkerType::Gpu, config.separation.gpu_slots),
            job_tokens: DashMap::new(),
            purge: PurgeConfig::from(&config.retention),
            root_token,
        });

        for pool in [&inner.cpu_pool, &inner.gpu_pool] {
            pool.start(Arc::new(JobRunner {
                inner: Arc::downgrade(&inner),
            }));
        }

        let controller = Self { inner };
        if controller.inner.purge.is_enabled() {
            JobPurgeService::new(controller.inner.purge.clone(), Arc::new(controller.clone()))
                .start_background_task(controller.inner.root_token.child_token());
        }

        info!(
            jobs_dir = %config.storage.jobs_dir.display(),
            backend = controller.inner.separation.backend_name(),
            "Job controller started"
        );
        Ok(controller)
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.inner.jobs_dir
    }

    /// Accept an upload. The new job is QUEUED.
    ///
    /// Fails with `UnsupportedFormat` for an unknown extension or an empty
    /// upload, without creating anything.
    pub async fn create_job(&self, file_name: &str, bytes: &[u8]) -> Result<String> {
        self.inner.ingest.validate(file_name, bytes.len())?;

        let id = Uuid::new_v4().to_string();
        let job_dir = self.inner.jobs_dir.join(&id);
        ensure_dir_all(&job_dir).await?;

        let upload = match self.inner.ingest.store_upload(&job_dir, file_name, bytes).await {
            Ok(upload) => upload,
            Err(e) => {
                if let Err(cleanup) = remove_dir_all_if_exists(&job_dir).await {
                    warn!(job_id = %id, "Failed to remove job directory: {}", cleanup);
                }
                return Err(e);
            }
        };

        let mut job = Job::new(&id, &upload.file_name, upload.path.clone(), job_dir);
        if upload.kind == MediaKind::Video {
            job = job.with_video(VideoTrack {
                path: upload.path.clone(),
                container: upload.extension.clone(),
            });
        }

        self.inner.store.create(job);
        self.inner.progress.open(&id);
        self.inner.publish(&id, ProgressPhase::Queued, 0.0, "queued");

        info!(job_id = %id, source = %upload.file_name, kind = ?upload.kind, "Job created");
        Ok(id)
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.inner.store.get(id)
    }

    /// Status of a job with its latest progress event.
    pub fn snapshot(&self, id: &str) -> Result<JobSnapshot> {
        let job = self.inner.store.get(id)?;
        Ok(JobSnapshot::new(&job, self.inner.progress.latest(id)))
    }

    /// All jobs, oldest first.
    pub fn list_jobs(&self) -> Vec<Job> {
        self.inner.store.list()
    }

    /// Whether the separation backend can use a GPU.
    pub async fn gpu_available(&self) -> bool {
        self.inner.separation.gpu_available().await
    }

    /// Queue a QUEUED job for separation on `device` and return immediately.
    ///
    /// Any other state fails with `InvalidStateTransition`; a GPU request
    /// without a usable GPU fails with `DeviceUnavailable`, and a stopped
    /// controller refuses new work. None of these change the job.
    pub async fn start_processing(&self, id: &str, device: Device) -> Result<ProcessAck> {
        let job = self.inner.store.get(id)?;
        if job.state != JobState::Queued {
            return Err(Error::invalid_transition(job.state, JobState::Loading));
        }
        self.inner.separation.check_device(device).await?;
        self.inner.pool(device).ensure_running()?;

        // The store re-checks the state; a concurrent request loses here.
        self.inner.store.update(id, |job| job.start_loading(device))?;

        let cancel = self.inner.root_token.child_token();
        self.inner.job_tokens.insert(id.to_string(), cancel.clone());
        self.inner.publish(id, ProgressPhase::Loading, 0.0, "loading");

        let task = PoolTask {
            job_id: id.to_string(),
            device,
            cancel,
        };
        if let Err(e) = self.inner.pool(device).submit(task) {
            // Shutdown raced the checks above; it fails live jobs the same way.
            self.inner.fail_job(id, SHUTDOWN_REASON);
            return Err(e);
        }

        info!(job_id = %id, device = %device, "Job queued for separation");
        Ok(ProcessAck {
            job_id: id.to_string(),
            state: JobState::Loading,
            device,
        })
    }

    /// Progress of a job: replay of recent events, then live events until
    /// the terminal one. Dropping the stream only unsubscribes.
    pub fn subscribe(&self, id: &str) -> Result<ProgressStream> {
        if !self.inner.store.contains(id) {
            return Err(Error::not_found("Job", id));
        }
        self.inner.progress.subscribe(id)
    }

    fn separated(&self, id: &str) -> Result<(Job, StemSet)> {
        let job = self.inner.store.get(id)?;
        let stems = job.separated_stems()?.clone();
        Ok((job, stems))
    }

    async fn render_cached(
        &self,
        job: &Job,
        stems: &StemSet,
        params: &MixParameters,
        name: String,
    ) -> Result<PathBuf> {
        let path = job.work_dir.join(&name);
        if is_file(&path).await {
            debug!(job_id = %job.id, artifact = %name, "Reusing rendered mix");
            return Ok(path);
        }
        self.inner.remix.render(stems, params, &path).await
    }

    /// Render a preview of `params`. Requires a SEPARATED job.
    ///
    /// The parameters become the job's last mix, used by [`Self::download`]
    /// when called without parameters.
    pub async fn preview(&self, id: &str, params: MixParameters) -> Result<MixArtifact> {
        let (job, stems) = self.separated(id)?;
        params.validate()?;

        let name = format!("preview-{}.wav", params.cache_key());
        let path = self.render_cached(&job, &stems, &params, name.clone()).await?;
        self.inner.store.update(id, |job| {
            job.last_mix = Some(params);
            Ok(())
        })?;

        info!(job_id = %id, artifact = %name, "Preview ready");
        Ok(MixArtifact {
            kind: MixArtifactKind::Preview,
            name,
            path,
            params,
        })
    }

    /// Render the final download. Requires a SEPARATED job.
    ///
    /// Without `params` the last previewed parameters are used; when there
    /// was no preview this fails with `NotFound`. Jobs with a video track get
    /// the mix muxed into `output-<key>.<ext>`, otherwise the mix WAV is returned.
    pub async fn download(&self, id: &str, params: Option<MixParameters>) -> Result<MixArtifact> {
        let (job, stems) = self.separated(id)?;
        let params = params
            .or(job.last_mix)
            .ok_or_else(|| Error::not_found("Preview", id))?;
        params.validate()?;

        let key = params.cache_key();
        let mix_name = format!("mix-{}.wav", key);
        let mix_path = self.render_cached(&job, &stems, &params, mix_name.clone()).await?;

        let Some(video) = &job.video else {
            info!(job_id = %id, artifact = %mix_name, "Download ready");
            return Ok(MixArtifact {
                kind: MixArtifactKind::Download,
                name: mix_name,
                path: mix_path,
                params,
            });
        };

        let path = self
            .inner
            .remix
            .remux(&video.path, &mix_path, &job.work_dir, &key)
            .await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        info!(job_id = %id, artifact = %name, "Muxed download ready");
        Ok(MixArtifact {
            kind: MixArtifactKind::Download,
            name,
            path,
            params,
        })
    }

    /// Path of a named artifact inside the job directory.
    ///
    /// Names that are not plain file names, hidden files and missing files
    /// are all `NotFound`.
    pub async fn artifact(&self, id: &str, name: &str) -> Result<PathBuf> {
        let job = self.inner.store.get(id)?;
        if !is_plain_file_name(name) || name.starts_with('.') {
            return Err(Error::not_found("Artifact", name));
        }
        let path = job.work_dir.join(name);
        if !is_file(&path).await {
            return Err(Error::not_found("Artifact", name));
        }
        Ok(path)
    }

    /// Delete a job: cancel its separation, close its feed and remove its files.
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        let job = self.inner.store.delete(id)?;
        if let Some((_, token)) = self.inner.job_tokens.remove(id) {
            token.cancel();
        }
        self.inner.progress.remove(id);
        remove_dir_all_if_exists(&job.work_dir).await?;
        info!(job_id = %id, state = %job.state, "Job deleted");
        Ok(())
    }

    /// Delete jobs idle for longer than the configured TTL.
    pub async fn purge_expired(&self) -> Result<usize> {
        JobPurgeService::new(self.inner.purge.clone(), Arc::new(self.clone()))
            .run_purge()
            .await
    }

    /// Stop the worker pools. Queued and running jobs become FAILED.
    pub async fn shutdown(&self) {
        info!("Shutting down job controller");
        self.inner.root_token.cancel();

        let runner = JobRunner {
            inner: Arc::downgrade(&self.inner),
        };
        for pool in [&self.inner.cpu_pool, &self.inner.gpu_pool] {
            for task in pool.stop().await {
                runner.abort(&task, SHUTDOWN_REASON).await;
            }
        }
        info!("Job controller stopped");
    }
}

#[async_trait]
impl ExpiredJobs for JobController {
    fn expired_job_ids(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.inner
            .store
            .list()
            .into_iter()
            .filter(|job| !job.state.is_active() && job.updated_at < cutoff)
            .map(|job| job.id)
            .collect()
    }

    async fn delete_expired(&self, id: &str) -> Result<()> {
        self.delete_job(id).await
    }
}

impl std::fmt::Debug for JobController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobController")
            .field("jobs_dir", &self.inner.jobs_dir)
            .field("jobs", &self.inner.store.len())
            .finish()
    }
}

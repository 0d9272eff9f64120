//! Separation entry point used by the job controller.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::backend::{BackendError, ProgressReporter, SeparationBackend, SeparationRequest};
use super::demucs::cleanup_scratch;
use super::device::DeviceAvailability;
use crate::domain::{Device, StemKind, StemSet};
use crate::utils::fs::io_error;
use crate::{Error, Result};

/// Wraps a [`SeparationBackend`] with device checks, a single retry on
/// resource exhaustion and stem persistence.
pub struct SeparationAdapter {
    backend: Arc<dyn SeparationBackend>,
    devices: DeviceAvailability,
    transient_retry: bool,
}

impl SeparationAdapter {
    pub fn new(backend: Arc<dyn SeparationBackend>, devices: DeviceAvailability) -> Self {
        Self {
            backend,
            devices,
            transient_retry: true,
        }
    }

    /// Enable or disable the retry on resource exhaustion.
    pub fn with_transient_retry(mut self, enabled: bool) -> Self {
        self.transient_retry = enabled;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn gpu_available(&self) -> bool {
        self.devices.gpu_available(self.backend.as_ref()).await
    }

    /// Fail with `DeviceUnavailable` when `device` cannot be used.
    pub async fn check_device(&self, device: Device) -> Result<()> {
        self.devices.ensure(device, self.backend.as_ref()).await
    }

    /// Separate `request.input` and persist the stems as
    /// `<work_dir>/{vocals,drums,bass,other}.wav`.
    pub async fn separate(
        &self,
        request: SeparationRequest,
        device: Device,
        progress: ProgressReporter,
    ) -> Result<StemSet> {
        self.check_device(device).await?;
        // A retried run starts its progress over.
        let progress = progress.monotonic();

        let attempts = if self.transient_retry { 2 } else { 1 };
        let mut attempt = 1;
        let produced = loop {
            match self.backend.separate(&request, device, &progress).await {
                Ok(stems) => break stems,
                Err(BackendError::ResourceExhausted(detail)) if attempt < attempts => {
                    warn!(
                        job_id = %request.job_id,
                        attempt,
                        "Separation ran out of resources, retrying once: {}",
                        detail
                    );
                    attempt += 1;
                }
                Err(BackendError::ResourceExhausted(detail)) => {
                    return Err(Error::Separation(detail));
                }
                Err(BackendError::Fatal(e)) => return Err(e),
            }
        };

        let stems = persist_stems(&produced, &request.work_dir).await?;
        if let Err(e) = cleanup_scratch(&request.work_dir).await {
            warn!(job_id = %request.job_id, "Failed to clean separation scratch: {}", e);
        }

        info!(
            job_id = %request.job_id,
            backend = self.backend.name(),
            device = %device,
            attempts = attempt,
            "Stems persisted"
        );
        Ok(stems)
    }
}

/// Move produced stems to their final names inside `work_dir`.
async fn persist_stems(produced: &StemSet, work_dir: &Path) -> Result<StemSet> {
    let target = StemSet::in_dir(work_dir);
    for kind in StemKind::ALL {
        let from = produced.path(kind);
        let to = target.path(kind);
        if from == to {
            continue;
        }
        if tokio::fs::rename(from, to).await.is_err() {
            // Rename fails across filesystems.
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| io_error("persisting stem", to, e))?;
        }
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with resource exhaustion `failures` times, then writes stems.
    struct FlakyBackend {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SeparationBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn gpu_available(&self) -> bool {
            false
        }

        async fn separate(
            &self,
            request: &SeparationRequest,
            _device: Device,
            progress: &ProgressReporter,
        ) -> std::result::Result<StemSet, BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                progress.report(40.0, "before failure");
                return Err(BackendError::ResourceExhausted("out of memory".into()));
            }
            progress.report(10.0, "started over");
            progress.report(50.0, "half");
            let dir = request.work_dir.join("separation").join("model");
            std::fs::create_dir_all(&dir).unwrap();
            for kind in StemKind::ALL {
                std::fs::write(dir.join(kind.file_name()), kind.as_str()).unwrap();
            }
            Ok(StemSet::in_dir(&dir))
        }
    }

    fn request(dir: &Path) -> SeparationRequest {
        SeparationRequest {
            job_id: "job".into(),
            input: dir.join("audio.wav"),
            work_dir: dir.to_path_buf(),
        }
    }

    fn adapter(failures: usize) -> (Arc<FlakyBackend>, SeparationAdapter) {
        let backend = Arc::new(FlakyBackend {
            failures,
            calls: AtomicUsize::new(0),
        });
        let adapter = SeparationAdapter::new(backend.clone(), DeviceAvailability::new(None));
        (backend, adapter)
    }

    #[tokio::test]
    async fn test_stems_are_persisted_in_job_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, adapter) = adapter(0);
        let stems = adapter
            .separate(request(tmp.path()), Device::Cpu, ProgressReporter::noop("job"))
            .await
            .unwrap();
        assert_eq!(stems, StemSet::in_dir(tmp.path()));
        assert_eq!(std::fs::read_to_string(&stems.drums).unwrap(), "drums");
        assert!(!tmp.path().join("separation").exists());
    }

    #[tokio::test]
    async fn test_resource_exhaustion_retried_once() {
        let tmp = tempfile::tempdir().unwrap();
        let (backend, adapter) = adapter(1);
        adapter
            .separate(request(tmp.path()), Device::Cpu, ProgressReporter::noop("job"))
            .await
            .unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_never_moves_progress_backwards() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, adapter) = adapter(1);
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        adapter
            .separate(request(tmp.path()), Device::Cpu, ProgressReporter::new("job", tx))
            .await
            .unwrap();

        let mut percents = Vec::new();
        while let Ok(update) = rx.try_recv() {
            percents.push(update.percent);
        }
        assert_eq!(percents, vec![40.0, 50.0]);
    }

    #[tokio::test]
    async fn test_second_exhaustion_is_separation_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (backend, adapter) = adapter(2);
        let err = adapter
            .separate(request(tmp.path()), Device::Cpu, ProgressReporter::noop("job"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "SEPARATION_ERROR");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let (backend, adapter) = adapter(1);
        let adapter = adapter.with_transient_retry(false);
        assert!(
            adapter
                .separate(request(tmp.path()), Device::Cpu, ProgressReporter::noop("job"))
                .await
                .is_err()
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gpu_unavailable_does_not_call_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let (backend, adapter) = adapter(0);
        let err = adapter
            .separate(request(tmp.path()), Device::Gpu, ProgressReporter::noop("job"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "DEVICE_UNAVAILABLE");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}

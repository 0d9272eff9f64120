//! Compute device availability.

use tokio::sync::OnceCell;
use tracing::info;

use super::backend::SeparationBackend;
use crate::domain::Device;
use crate::{Error, Result};

/// Answers whether a device can be used, probing the GPU at most once.
#[derive(Debug, Default)]
pub struct DeviceAvailability {
    gpu_override: Option<bool>,
    gpu_probed: OnceCell<bool>,
}

impl DeviceAvailability {
    /// `gpu_override` skips probing when set.
    pub fn new(gpu_override: Option<bool>) -> Self {
        Self {
            gpu_override,
            gpu_probed: OnceCell::new(),
        }
    }

    pub async fn gpu_available(&self, backend: &dyn SeparationBackend) -> bool {
        if let Some(value) = self.gpu_override {
            return value;
        }
        *self
            .gpu_probed
            .get_or_init(|| async {
                let available = backend.gpu_available().await;
                info!(backend = backend.name(), available, "Probed GPU availability");
                available
            })
            .await
    }

    /// Fail with `DeviceUnavailable` when `device` cannot be used.
    pub async fn ensure(&self, device: Device, backend: &dyn SeparationBackend) -> Result<()> {
        match device {
            Device::Cpu => Ok(()),
            Device::Gpu if self.gpu_available(backend).await => Ok(()),
            Device::Gpu => Err(Error::DeviceUnavailable(
                "no GPU is available for separation, retry with the cpu device".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StemSet;
    use crate::separation::backend::{
        BackendError, ProgressReporter, SeparationRequest,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ProbeCounter {
        gpu: bool,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl SeparationBackend for ProbeCounter {
        fn name(&self) -> &'static str {
            "probe-counter"
        }

        async fn gpu_available(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.gpu
        }

        async fn separate(
            &self,
            _request: &SeparationRequest,
            _device: Device,
            _progress: &ProgressReporter,
        ) -> std::result::Result<StemSet, BackendError> {
            Err(BackendError::Fatal(Error::Other("unused".into())))
        }
    }

    #[tokio::test]
    async fn test_gpu_probe_is_cached() {
        let backend = ProbeCounter {
            gpu: false,
            probes: AtomicUsize::new(0),
        };
        let devices = DeviceAvailability::new(None);

        let err = devices.ensure(Device::Gpu, &backend).await.unwrap_err();
        assert_eq!(err.kind(), "DEVICE_UNAVAILABLE");
        assert!(devices.ensure(Device::Gpu, &backend).await.is_err());
        assert!(devices.ensure(Device::Cpu, &backend).await.is_ok());
        assert_eq!(backend.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_override_skips_probe() {
        let backend = ProbeCounter {
            gpu: false,
            probes: AtomicUsize::new(0),
        };
        let devices = DeviceAvailability::new(Some(true));
        assert!(devices.ensure(Device::Gpu, &backend).await.is_ok());
        assert_eq!(backend.probes.load(Ordering::SeqCst), 0);
    }
}

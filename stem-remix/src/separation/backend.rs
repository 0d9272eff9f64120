//! Separation backend trait.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::Error;
use crate::domain::{Device, StemSet};

/// Input of one separation run.
#[derive(Debug, Clone)]
pub struct SeparationRequest {
    pub job_id: String,
    /// Canonical decoded audio.
    pub input: PathBuf,
    /// Job directory; backends may create scratch directories inside it.
    pub work_dir: PathBuf,
}

/// Intermediate progress of a running separation.
#[derive(Debug, Clone, PartialEq)]
pub struct SeparationProgress {
    pub job_id: String,
    /// `0.0..=100.0`
    pub percent: f32,
    pub message: String,
}

/// Sends separation progress to whoever drives the job.
///
/// Reporting never blocks: updates are dropped when the receiver lags.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    tx: mpsc::Sender<SeparationProgress>,
    /// Highest percent sent so far, shared by clones of a monotonic reporter.
    high_water: Option<Arc<Mutex<f32>>>,
}

impl ProgressReporter {
    pub fn new(job_id: impl Into<String>, tx: mpsc::Sender<SeparationProgress>) -> Self {
        Self {
            job_id: job_id.into(),
            tx,
            high_water: None,
        }
    }

    /// A reporter that silently drops updates below the highest percent it
    /// has already sent, so a restarted run does not move progress backwards.
    pub fn monotonic(&self) -> Self {
        Self {
            job_id: self.job_id.clone(),
            tx: self.tx.clone(),
            high_water: Some(Arc::new(Mutex::new(0.0))),
        }
    }

    pub fn noop(job_id: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::channel::<SeparationProgress>(1);
        Self::new(job_id, tx)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn report(&self, percent: f32, message: impl Into<String>) {
        if let Some(high_water) = &self.high_water {
            let mut highest = high_water.lock();
            if percent < *highest {
                return;
            }
            *highest = percent;
        }
        let _ = self.tx.try_send(SeparationProgress {
            job_id: self.job_id.clone(),
            percent,
            message: message.into(),
        });
    }
}

/// Failure of a single backend run.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Out of device memory or a similar resource problem. Worth one retry.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error(transparent)]
    Fatal(#[from] Error),
}

/// A neural source-separation capability.
#[async_trait]
pub trait SeparationBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Whether a GPU device can be used. Called once and cached by the adapter.
    async fn gpu_available(&self) -> bool;

    /// Separate `request.input` into four stems.
    ///
    /// The returned paths may point anywhere inside `request.work_dir`; the
    /// adapter moves them into place.
    async fn separate(
        &self,
        request: &SeparationRequest,
        device: Device,
        progress: &ProgressReporter,
    ) -> std::result::Result<StemSet, BackendError>;
}

//! Progress events published while a job is separated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered phases of a job's progress feed.
///
/// Events of one job always arrive in this order; `Failed` may follow any
/// non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressPhase {
    Queued,
    Loading,
    Separating,
    Finalizing,
    Separated,
    Failed,
}

impl ProgressPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Loading => "LOADING",
            Self::Separating => "SEPARATING",
            Self::Finalizing => "FINALIZING",
            Self::Separated => "SEPARATED",
            Self::Failed => "FAILED",
        }
    }

    /// Position in the phase order.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Loading => 1,
            Self::Separating => 2,
            Self::Finalizing => 3,
            Self::Separated => 4,
            Self::Failed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Separated | Self::Failed)
    }

    /// Overall percentage span `[start, end)` covered by this phase.
    fn overall_span(&self) -> (f32, f32) {
        match self {
            Self::Queued => (0.0, 0.0),
            Self::Loading => (0.0, 10.0),
            Self::Separating => (10.0, 98.0),
            Self::Finalizing => (98.0, 100.0),
            Self::Separated | Self::Failed => (100.0, 100.0),
        }
    }
}

impl std::fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress notification for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub phase: ProgressPhase,
    /// Completion of the current phase, `0.0..=100.0`.
    pub percent: f32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        job_id: impl Into<String>,
        phase: ProgressPhase,
        percent: f32,
        message: impl Into<String>,
    ) -> Self {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            job_id: job_id.into(),
            phase,
            percent,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Terminal failure event carrying the error detail as its message.
    pub fn failed(job_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(job_id, ProgressPhase::Failed, 100.0, detail)
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Single job-wide percentage: loading covers 0-10, separation 10-98 and
    /// finalizing 98-100.
    pub fn overall_percent(&self) -> f32 {
        let (start, end) = self.phase.overall_span();
        start + (end - start) * self.percent / 100.0
    }
}

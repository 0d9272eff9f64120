//! Job entity.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobState;
use crate::domain::progress::ProgressEvent;
use crate::domain::{Device, MixParameters, StemSet};
use crate::{Error, Result};

/// Operation name reported when a remix is requested before separation finished.
const REMIX_OPERATION: &str = "REMIX";

/// Original video container kept for remuxing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoTrack {
    pub path: PathBuf,
    /// Lowercased container extension of the upload (`mp4`, `webm`, ...).
    pub container: String,
}

/// A separation job: one upload and everything derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Sanitised file name of the upload.
    pub source_name: String,
    pub source_path: PathBuf,
    /// Directory owning every file of this job.
    pub work_dir: PathBuf,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    pub device: Option<Device>,
    pub video: Option<VideoTrack>,
    /// Canonical decoded audio, set once loading succeeded.
    pub canonical_audio: Option<PathBuf>,
    pub duration_secs: Option<f64>,
    pub stems: Option<StemSet>,
    /// Parameters of the most recent preview.
    pub last_mix: Option<MixParameters>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(
        id: impl Into<String>,
        source_name: impl Into<String>,
        source_path: PathBuf,
        work_dir: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source_name: source_name.into(),
            source_path,
            work_dir,
            state: JobState::Queued,
            created_at: now,
            updated_at: now,
            error: None,
            device: None,
            video: None,
            canonical_audio: None,
            duration_secs: None,
            stems: None,
            last_mix: None,
        }
    }

    /// Attach the original video container.
    pub fn with_video(mut self, video: VideoTrack) -> Self {
        self.video = Some(video);
        self
    }

    fn set_state(&mut self, target: JobState) -> Result<()> {
        self.state = self.state.transition_to(target)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// QUEUED -> LOADING.
    pub fn start_loading(&mut self, device: Device) -> Result<()> {
        self.set_state(JobState::Loading)?;
        self.device = Some(device);
        Ok(())
    }

    /// LOADING -> SEPARATING, recording the decoded audio.
    pub fn start_separating(&mut self, canonical_audio: PathBuf, duration_secs: f64) -> Result<()> {
        self.set_state(JobState::Separating)?;
        self.canonical_audio = Some(canonical_audio);
        self.duration_secs = Some(duration_secs);
        Ok(())
    }

    /// SEPARATING -> SEPARATED, recording the persisted stems.
    pub fn complete(&mut self, stems: StemSet) -> Result<()> {
        self.set_state(JobState::Separated)?;
        self.stems = Some(stems);
        Ok(())
    }

    /// Move to FAILED with an error detail.
    pub fn fail(&mut self, detail: impl Into<String>) -> Result<()> {
        self.set_state(JobState::Failed)?;
        let detail = detail.into();
        self.error = Some(if detail.trim().is_empty() {
            "unknown error".to_string()
        } else {
            detail
        });
        Ok(())
    }

    /// Stems of a separated job, or `InvalidStateTransition` when not ready.
    pub fn separated_stems(&self) -> Result<&StemSet> {
        match (&self.state, &self.stems) {
            (JobState::Separated, Some(stems)) => Ok(stems),
            _ => Err(Error::invalid_transition(self.state, REMIX_OPERATION)),
        }
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }
}

/// Status of a job as reported to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub source_name: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    pub has_video: bool,
    /// Duration of the decoded audio in seconds, rounded to 0.1.
    pub duration_secs: Option<f64>,
    pub progress: Option<ProgressEvent>,
}

impl JobSnapshot {
    pub fn new(job: &Job, progress: Option<ProgressEvent>) -> Self {
        Self {
            id: job.id.clone(),
            source_name: job.source_name.clone(),
            state: job.state,
            created_at: job.created_at,
            updated_at: job.updated_at,
            error: job.error.clone(),
            has_video: job.has_video(),
            duration_secs: job.duration_secs.map(|d| (d * 10.0).round() / 10.0),
            progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn job() -> Job {
        Job::new(
            "job-1",
            "clip.wav",
            PathBuf::from("/jobs/job-1/clip.wav"),
            PathBuf::from("/jobs/job-1"),
        )
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = job();
        assert_eq!(job.state, JobState::Queued);
        assert!(job.error.is_none());
        assert!(job.stems.is_none());
        assert!(!job.has_video());
    }

    #[test]
    fn test_happy_path() {
        let mut job = job();
        job.start_loading(Device::Cpu).unwrap();
        job.start_separating(PathBuf::from("/jobs/job-1/audio.wav"), 10.04)
            .unwrap();
        assert!(job.separated_stems().is_err());
        job.complete(StemSet::in_dir(Path::new("/jobs/job-1"))).unwrap();
        assert_eq!(job.state, JobState::Separated);
        assert!(job.separated_stems().is_ok());
        assert_eq!(JobSnapshot::new(&job, None).duration_secs, Some(10.0));
    }

    #[test]
    fn test_cannot_skip_phases() {
        let mut job = job();
        let err = job
            .complete(StemSet::in_dir(Path::new("/jobs/job-1")))
            .unwrap_err();
        assert_eq!(err.kind(), "INVALID_TRANSITION");
        assert_eq!(job.state, JobState::Queued);
        assert!(job.stems.is_none());
    }

    #[test]
    fn test_fail_is_terminal() {
        let mut job = job();
        job.start_loading(Device::Gpu).unwrap();
        job.fail("").unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("unknown error"));
        assert!(job.fail("again").is_err());
        assert!(job.start_loading(Device::Cpu).is_err());
    }

    #[test]
    fn test_remix_before_separated() {
        let job = job();
        let err = job.separated_stems().unwrap_err();
        assert_eq!(err.kind(), "INVALID_TRANSITION");
        assert!(err.to_string().contains("QUEUED"));
    }
}

//! Separation through the demucs command line tool.
//!
//! Runs `python -m demucs --name <model> --out <dir> --device <cpu|cuda> <input>`
//! and reads stems from `<dir>/<model>/<input stem>/<stem>.wav`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use process_utils::{DEFAULT_TAIL_LINES, tokio_command, tool_path};
use regex::Regex;
use tracing::{debug, info};

use super::backend::{BackendError, ProgressReporter, SeparationBackend, SeparationRequest};
use crate::domain::{Device, StemKind, StemSet};
use crate::media::ffmpeg::run_command_with_tail;
use crate::utils::fs::is_file;
use crate::{Error, Result};

/// Default demucs model.
pub const DEFAULT_MODEL: &str = "htdemucs";

/// Scratch directory for demucs output inside a job directory.
const OUTPUT_DIR: &str = "separation";

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").unwrap());

/// Output fragments that indicate resource exhaustion rather than bad input.
const RESOURCE_EXHAUSTED_MARKERS: &[&str] = &[
    "out of memory",
    "cuda error",
    "cublas_status_alloc_failed",
    "memoryerror",
    "cannot allocate memory",
];

/// Extract a completion percentage from one line of demucs output.
pub fn parse_percent(line: &str) -> Option<f32> {
    let caps = PERCENT_RE.captures_iter(line).last()?;
    let value: f32 = caps.get(1)?.as_str().parse().ok()?;
    (0.0..=100.0).contains(&value).then_some(value)
}

/// Backend driving the demucs CLI in a Python environment.
#[derive(Debug, Clone)]
pub struct DemucsBackend {
    python: String,
    model: String,
}

impl Default for DemucsBackend {
    fn default() -> Self {
        Self::new(tool_path("DEMUCS_PYTHON", "python3"), DEFAULT_MODEL)
    }
}

impl DemucsBackend {
    pub fn new(python: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn device_arg(device: Device) -> &'static str {
        match device {
            Device::Cpu => "cpu",
            Device::Gpu => "cuda",
        }
    }

    fn build_args(&self, input: &Path, out_dir: &Path, device: Device) -> Vec<String> {
        vec![
            "-m".to_string(),
            "demucs".to_string(),
            "--name".to_string(),
            self.model.clone(),
            "--out".to_string(),
            out_dir.to_string_lossy().to_string(),
            "--device".to_string(),
            Self::device_arg(device).to_string(),
            input.to_string_lossy().to_string(),
        ]
    }

    /// Directory demucs writes the stems of `input` to.
    fn stems_dir(&self, input: &Path, out_dir: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        out_dir.join(&self.model).join(stem)
    }

    fn classify_failure(tail: &process_utils::OutputTail, detail: String) -> BackendError {
        if RESOURCE_EXHAUSTED_MARKERS
            .iter()
            .any(|marker| tail.contains_ignore_case(marker))
        {
            BackendError::ResourceExhausted(detail)
        } else {
            BackendError::Fatal(Error::Separation(detail))
        }
    }
}

#[async_trait]
impl SeparationBackend for DemucsBackend {
    fn name(&self) -> &'static str {
        "demucs"
    }

    async fn gpu_available(&self) -> bool {
        let mut cmd = tokio_command(&self.python);
        cmd.args([
            "-c",
            "import sys, torch; sys.exit(0 if torch.cuda.is_available() else 1)",
        ]);
        match run_command_with_tail(&mut cmd, 4, |_| {}).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!("GPU probe failed: {}", e);
                false
            }
        }
    }

    async fn separate(
        &self,
        request: &SeparationRequest,
        device: Device,
        progress: &ProgressReporter,
    ) -> std::result::Result<StemSet, BackendError> {
        let out_dir = request.work_dir.join(OUTPUT_DIR);
        let args = self.build_args(&request.input, &out_dir, device);
        info!(
            job_id = %request.job_id,
            model = %self.model,
            device = %device,
            "Starting demucs"
        );
        debug!("demucs args: {:?}", args);

        let mut cmd = tokio_command(&self.python);
        cmd.args(&args).env("PYTHONUNBUFFERED", "1");

        let mut last_percent = 0.0f32;
        let output = run_command_with_tail(&mut cmd, DEFAULT_TAIL_LINES, |line| {
            if let Some(percent) = parse_percent(line)
                && percent > last_percent
            {
                last_percent = percent;
                progress.report(percent, format!("Separating: {:.0}%", percent));
            }
        })
        .await?;

        if !output.status.success() {
            let detail = format!(
                "demucs exited with {}:\n{}",
                output.status,
                output.tail.joined()
            );
            return Err(Self::classify_failure(&output.tail, detail));
        }

        let stems_dir = self.stems_dir(&request.input, &out_dir);
        let stems = StemSet::in_dir(&stems_dir);
        let mut missing = Vec::new();
        for kind in StemKind::ALL {
            if !is_file(stems.path(kind)).await {
                missing.push(kind.as_str());
            }
        }
        if !missing.is_empty() {
            return Err(BackendError::Fatal(Error::Separation(format!(
                "demucs finished without producing {} in {}:\n{}",
                missing.join(", "),
                stems_dir.display(),
                output.tail.joined()
            ))));
        }

        info!(
            job_id = %request.job_id,
            duration_secs = output.duration,
            "demucs finished"
        );
        Ok(stems)
    }
}

/// Remove the scratch directory demucs wrote into.
pub async fn cleanup_scratch(work_dir: &Path) -> Result<()> {
    crate::utils::fs::remove_dir_all_if_exists(&work_dir.join(OUTPUT_DIR)).await
}

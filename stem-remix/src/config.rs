//! Application configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! JSON file, environment variables and finally CLI flags (applied by the binary).

use std::path::{Path, PathBuf};

use process_utils::tool_path;
use serde::{Deserialize, Serialize};

use crate::jobs::progress::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_HISTORY_CAPACITY};
use crate::media::WavEncoding;
use crate::remix::Limiter;
use crate::remix::denoise::DEFAULT_NOISE_FLOOR_DB;
use crate::separation::demucs::DEFAULT_MODEL;
use crate::{Error, Result};

/// Where jobs and logs live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Parent of every `<job_id>/` directory.
    pub jobs_dir: PathBuf,
    /// Directory for rolling log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            jobs_dir: PathBuf::from("./jobs"),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Canonical sample rate of decoded audio.
    pub sample_rate: u32,
    /// Canonical channel count of decoded audio.
    pub channels: u16,
    pub max_upload_bytes: Option<u64>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: tool_path("FFMPEG_PATH", "ffmpeg"),
            ffprobe_path: tool_path("FFPROBE_PATH", "ffprobe"),
            sample_rate: 44100,
            channels: 2,
            max_upload_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    pub python_path: String,
    pub model: String,
    /// Maximum concurrent CPU separations.
    pub cpu_slots: usize,
    /// Maximum concurrent GPU separations.
    pub gpu_slots: usize,
    /// Skip GPU probing and use this answer instead.
    pub gpu_available: Option<bool>,
    pub job_timeout_secs: u64,
    /// Retry once when the model runs out of device resources.
    pub transient_retry: bool,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            python_path: tool_path("DEMUCS_PYTHON", "python3"),
            model: DEFAULT_MODEL.to_string(),
            cpu_slots: 2,
            gpu_slots: 1,
            gpu_available: None,
            job_timeout_secs: 3600,
            transient_retry: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Events kept per job for late subscribers.
    pub history_capacity: usize,
    /// Broadcast buffer per job.
    pub channel_capacity: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemixConfig {
    pub limiter: Limiter,
    pub wav_encoding: WavEncoding,
    pub noise_floor_db: f32,
}

impl Default for RemixConfig {
    fn default() -> Self {
        Self {
            limiter: Limiter::default(),
            wav_encoding: WavEncoding::default(),
            noise_floor_db: DEFAULT_NOISE_FLOOR_DB,
        }
    }
}

/// Optional expiry of old jobs. Disabled unless `job_ttl_secs` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub job_ttl_secs: Option<u64>,
    pub purge_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            job_ttl_secs: None,
            purge_interval_secs: 3600, // 1 hour
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub media: MediaConfig,
    pub separation: SeparationConfig,
    pub progress: ProgressConfig,
    pub remix: RemixConfig,
    pub retention: RetentionConfig,
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_value(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::config(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(None),
    }
}

impl AppConfig {
    /// Load defaults, then `path` when given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config", path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
    }

    /// Apply `STEM_REMIX_*` and tool path environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_value("STEM_REMIX_JOBS_DIR") {
            self.storage.jobs_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_value("STEM_REMIX_LOG_DIR") {
            self.storage.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(slots) = env_parsed("STEM_REMIX_CPU_SLOTS")? {
            self.separation.cpu_slots = slots;
        }
        if let Some(slots) = env_parsed("STEM_REMIX_GPU_SLOTS")? {
            self.separation.gpu_slots = slots;
        }
        if let Some(path) = env_value("FFMPEG_PATH") {
            self.media.ffmpeg_path = path;
        }
        if let Some(path) = env_value("FFPROBE_PATH") {
            self.media.ffprobe_path = path;
        }
        if let Some(path) = env_value("DEMUCS_PYTHON") {
            self.separation.python_path = path;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.separation.cpu_slots == 0 {
            return Err(Error::config("separation.cpu_slots must be at least 1"));
        }
        if self.separation.gpu_slots == 0 {
            return Err(Error::config("separation.gpu_slots must be at least 1"));
        }
        if self.media.sample_rate == 0 {
            return Err(Error::config("media.sample_rate must be positive"));
        }
        if self.media.channels == 0 {
            return Err(Error::config("media.channels must be positive"));
        }
        if self.separation.job_timeout_secs == 0 {
            return Err(Error::config("separation.job_timeout_secs must be positive"));
        }
        if self.progress.history_capacity == 0 || self.progress.channel_capacity == 0 {
            return Err(Error::config("progress capacities must be positive"));
        }
        if self.retention.job_ttl_secs.is_some() && self.retention.purge_interval_secs == 0 {
            return Err(Error::config("retention.purge_interval_secs must be positive"));
        }
        Ok(())
    }

    /// Pretty JSON of the effective configuration.
    pub fn show(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

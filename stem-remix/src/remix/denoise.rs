//! Noise and wind suppression of individual stems.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::media::FfmpegTools;
use crate::{Error, Result};

/// Default noise floor passed to `afftdn`, in dB.
pub const DEFAULT_NOISE_FLOOR_DB: f32 = -25.0;

/// Highest noise reduction `afftdn` accepts, in dB.
const MAX_NOISE_REDUCTION: f32 = 97.0;

/// A capability that writes a noise-suppressed copy of a stem.
#[async_trait]
pub trait NoiseSuppressor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write a copy of `input` with suppression `intensity` (1..=100) to `output`.
    async fn suppress(&self, input: &Path, output: &Path, intensity: u8) -> Result<()>;
}

/// Build the `afftdn` filter for an intensity of 0..=100.
pub fn afftdn_filter(intensity: u8, noise_floor_db: f32) -> String {
    let reduction = (intensity as f32 * 0.97).min(MAX_NOISE_REDUCTION);
    format!("afftdn=nr={:.1}:nf={}", reduction, noise_floor_db)
}

/// Spectral denoising through ffmpeg's `afftdn` filter.
#[derive(Debug, Clone)]
pub struct FfmpegDenoiser {
    tools: FfmpegTools,
    noise_floor_db: f32,
}

impl FfmpegDenoiser {
    pub fn new(tools: FfmpegTools) -> Self {
        Self {
            tools,
            noise_floor_db: DEFAULT_NOISE_FLOOR_DB,
        }
    }

    pub fn with_noise_floor_db(mut self, noise_floor_db: f32) -> Self {
        self.noise_floor_db = noise_floor_db;
        self
    }

    fn build_args(&self, input: &Path, output: &Path, intensity: u8) -> Vec<String> {
        let mut args = FfmpegTools::base_args();
        args.extend(["-i".to_string(), input.to_string_lossy().to_string()]);
        args.extend([
            "-af".to_string(),
            afftdn_filter(intensity, self.noise_floor_db),
        ]);
        // Float output avoids a second quantisation before mixing.
        args.extend(["-c:a".to_string(), "pcm_f32le".to_string()]);
        args.extend(["-f".to_string(), "wav".to_string()]);
        args.push(output.to_string_lossy().to_string());
        args
    }
}

#[async_trait]
impl NoiseSuppressor for FfmpegDenoiser {
    fn name(&self) -> &'static str {
        "afftdn"
    }

    async fn suppress(&self, input: &Path, output: &Path, intensity: u8) -> Result<()> {
        let args = self.build_args(input, output, intensity);
        debug!(input = %input.display(), intensity, "Applying afftdn");
        let result = self.tools.run(&args).await?;
        if !result.status.success() {
            return Err(Error::Other(format!(
                "noise suppression of {} failed: {}",
                input.display(),
                result.failure_detail()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_afftdn_filter() {
        assert_eq!(afftdn_filter(50, -25.0), "afftdn=nr=48.5:nf=-25");
        assert_eq!(afftdn_filter(100, -25.0), "afftdn=nr=97.0:nf=-25");
        assert_eq!(afftdn_filter(1, -30.5), "afftdn=nr=1.0:nf=-30.5");
    }

    #[test]
    fn test_build_args() {
        let denoiser = FfmpegDenoiser::new(FfmpegTools::new("ffmpeg", "ffprobe"));
        let args = denoiser.build_args(Path::new("/j/other.wav"), Path::new("/j/out.wav"), 40);
        let af = args.iter().position(|a| a == "-af").unwrap();
        assert_eq!(args[af + 1], "afftdn=nr=38.8:nf=-25");
        assert_eq!(args.last().unwrap(), "/j/out.wav");
    }
}

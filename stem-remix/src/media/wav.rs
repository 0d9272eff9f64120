//! In-memory PCM buffers and WAV encoding.

use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Scale between `[-1.0, 1.0)` floats and 16-bit PCM. Using the same
/// power of two for reading and writing makes PCM round trips exact.
const PCM16_SCALE: f32 = 32768.0;

/// Sample encoding of written WAV files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WavEncoding {
    /// 16-bit signed PCM.
    #[default]
    Pcm16,
    /// 32-bit IEEE float.
    Float32,
}

/// Interleaved audio samples normalised to `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels,
            samples,
        }
    }

    /// Buffer of `frames` silent frames.
    pub fn silence(sample_rate: u32, channels: u16, frames: usize) -> Self {
        Self::new(sample_rate, channels, vec![0.0; frames * channels as usize])
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Drop every frame after `frames`.
    pub fn truncate_frames(&mut self, frames: usize) {
        self.samples.truncate(frames * self.channels as usize);
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }

    /// Whether `other` can be summed with this buffer sample by sample.
    pub fn same_layout(&self, other: &AudioBuffer) -> bool {
        self.sample_rate == other.sample_rate && self.channels == other.channels
    }
}

fn map_hound(op: &'static str, path: &Path, err: hound::Error) -> Error {
    match err {
        hound::Error::IoError(e) => Error::io_path(op, path, e),
        other => Error::UnsupportedFormat(format!("{}: {}", path.display(), other)),
    }
}

/// Decode a WAV file into an [`AudioBuffer`].
pub fn read_wav(path: &Path) -> Result<AudioBuffer> {
    let reader = WavReader::open(path).map_err(|e| map_hound("reading", path, e))?;
    let spec = reader.spec();

    let samples = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| map_hound("reading", path, e))?,
        SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| map_hound("reading", path, e))?
        }
    };

    Ok(AudioBuffer::new(spec.sample_rate, spec.channels, samples))
}

/// Read only the header of a WAV file.
pub fn read_wav_spec(path: &Path) -> Result<WavSpec> {
    let reader = WavReader::open(path).map_err(|e| map_hound("reading", path, e))?;
    Ok(reader.spec())
}

/// Duration in seconds of a WAV file, from its header.
pub fn wav_duration_secs(path: &Path) -> Result<f64> {
    let reader = WavReader::open(path).map_err(|e| map_hound("reading", path, e))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(Error::UnsupportedFormat(format!(
            "{}: zero sample rate",
            path.display()
        )));
    }
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

/// Encode `buffer` into a WAV file at `path`.
///
/// Samples outside the 16-bit range are clamped when writing PCM.
pub fn write_wav(path: &Path, buffer: &AudioBuffer, encoding: WavEncoding) -> Result<()> {
    let spec = match encoding {
        WavEncoding::Pcm16 => WavSpec {
            channels: buffer.channels,
            sample_rate: buffer.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        },
        WavEncoding::Float32 => WavSpec {
            channels: buffer.channels,
            sample_rate: buffer.sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        },
    };

    let mut writer = WavWriter::create(path, spec).map_err(|e| map_hound("writing", path, e))?;
    match encoding {
        WavEncoding::Pcm16 => {
            for &sample in &buffer.samples {
                let value = (sample * PCM16_SCALE)
                    .round()
                    .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                writer
                    .write_sample(value)
                    .map_err(|e| map_hound("writing", path, e))?;
            }
        }
        WavEncoding::Float32 => {
            for &sample in &buffer.samples {
                writer
                    .write_sample(sample)
                    .map_err(|e| map_hound("writing", path, e))?;
            }
        }
    }
    writer.finalize().map_err(|e| map_hound("writing", path, e))
}

/// [`read_wav`] on the blocking pool.
pub async fn load(path: PathBuf) -> Result<AudioBuffer> {
    tokio::task::spawn_blocking(move || read_wav(&path))
        .await
        .map_err(|e| Error::Other(format!("WAV decode task failed: {}", e)))?
}

/// [`write_wav`] on the blocking pool.
pub async fn store(path: PathBuf, buffer: AudioBuffer, encoding: WavEncoding) -> Result<()> {
    tokio::task::spawn_blocking(move || write_wav(&path, &buffer, encoding))
        .await
        .map_err(|e| Error::Other(format!("WAV encode task failed: {}", e)))?
}

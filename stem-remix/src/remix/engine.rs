//! Deterministic stem mixing.
//!
//! A mix is rendered in four steps: optional suppression of each stem (cached
//! per stem and intensity), gain, a sample-wise sum in canonical stem order
//! and the limiter. Given the same stem files and parameters the rendered
//! file is byte-identical.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::denoise::NoiseSuppressor;
use super::mux::Muxer;
use crate::domain::{MixParameters, StemKind, StemSet};
use crate::media::wav::{self, AudioBuffer, WavEncoding};
use crate::utils::fs::is_file;
use crate::{Error, Result};

/// How the summed mix is kept inside `[-1.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limiter {
    /// Divide the whole buffer by its peak when the peak exceeds 1.0.
    #[default]
    PeakNormalize,
    /// Clamp every sample to `[-1.0, 1.0]`.
    HardClip,
}

impl Limiter {
    pub fn apply(&self, buffer: &mut AudioBuffer) {
        match self {
            Self::PeakNormalize => {
                let peak = buffer.peak();
                if peak > 1.0 {
                    for sample in &mut buffer.samples {
                        *sample /= peak;
                    }
                }
            }
            Self::HardClip => {
                for sample in &mut buffer.samples {
                    *sample = sample.clamp(-1.0, 1.0);
                }
            }
        }
    }
}

/// Decoded audio of the four stems of a job.
#[derive(Debug, Clone)]
pub struct StemAudio {
    buffers: [AudioBuffer; 4],
}

impl StemAudio {
    /// Buffers in canonical order (vocals, drums, bass, other).
    ///
    /// Fails with `Validation` when the stems disagree on sample rate or channels.
    pub fn new(buffers: [AudioBuffer; 4]) -> Result<Self> {
        let first = &buffers[0];
        for (kind, buffer) in StemKind::ALL.iter().zip(&buffers) {
            if !first.same_layout(buffer) {
                return Err(Error::validation(format!(
                    "{} stem is {} Hz/{} ch, expected {} Hz/{} ch",
                    kind, buffer.sample_rate, buffer.channels, first.sample_rate, first.channels
                )));
            }
        }
        Ok(Self { buffers })
    }

    /// Decode the stems of `set`.
    pub async fn load(set: &StemSet) -> Result<Self> {
        let (vocals, drums, bass, other) = tokio::try_join!(
            wav::load(set.vocals.clone()),
            wav::load(set.drums.clone()),
            wav::load(set.bass.clone()),
            wav::load(set.other.clone()),
        )?;
        Self::new([vocals, drums, bass, other])
    }

    pub fn get(&self, kind: StemKind) -> &AudioBuffer {
        &self.buffers[kind.index()]
    }

    /// Length of the shortest stem, in frames.
    pub fn frames(&self) -> usize {
        self.buffers
            .iter()
            .map(AudioBuffer::frames)
            .min()
            .unwrap_or(0)
    }
}

/// Sum the stems with per-stem gain and apply `limiter`.
///
/// The output is truncated to the shortest stem. Stems with zero gain
/// contribute nothing, so isolating one stem reproduces it exactly.
pub fn mix_stems(
    stems: &StemAudio,
    params: &MixParameters,
    limiter: Limiter,
) -> Result<AudioBuffer> {
    params.validate()?;

    let frames = stems.frames();
    let layout = stems.get(StemKind::Vocals);
    let mut out = AudioBuffer::silence(layout.sample_rate, layout.channels, frames);
    let len = out.samples.len();

    for kind in StemKind::ALL {
        let gain = params.stem(kind).gain.to_linear();
        if gain == 0.0 {
            continue;
        }
        let source = &stems.get(kind).samples[..len];
        for (acc, sample) in out.samples.iter_mut().zip(source) {
            *acc += sample * gain;
        }
    }

    limiter.apply(&mut out);
    Ok(out)
}

/// File name of the cached suppressed copy of a stem.
pub fn denoised_file_name(kind: StemKind, intensity: u8) -> String {
    format!("denoised-{}-{}.wav", kind.as_str(), intensity)
}

/// Renders mixes from persisted stems and muxes them against video.
pub struct RemixEngine {
    denoiser: Arc<dyn NoiseSuppressor>,
    muxer: Muxer,
    limiter: Limiter,
    encoding: WavEncoding,
}

impl RemixEngine {
    pub fn new(denoiser: Arc<dyn NoiseSuppressor>, muxer: Muxer) -> Self {
        Self {
            denoiser,
            muxer,
            limiter: Limiter::default(),
            encoding: WavEncoding::default(),
        }
    }

    pub fn with_limiter(mut self, limiter: Limiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_encoding(mut self, encoding: WavEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn limiter(&self) -> Limiter {
        self.limiter
    }

    pub fn encoding(&self) -> WavEncoding {
        self.encoding
    }

    /// Pure mix of decoded stems.
    pub fn mix(&self, stems: &StemAudio, params: &MixParameters) -> Result<AudioBuffer> {
        mix_stems(stems, params, self.limiter)
    }

    /// Stem set with every stem that requests suppression replaced by its
    /// suppressed copy. Copies are cached next to the original stem.
    pub async fn prepare_stems(&self, stems: &StemSet, params: &MixParameters) -> Result<StemSet> {
        let mut prepared = stems.clone();
        for kind in StemKind::ALL {
            let mix = params.stem(kind);
            if mix.suppression == 0 || mix.gain.to_linear() == 0.0 {
                continue;
            }
            let source = stems.path(kind);
            let dir = source.parent().unwrap_or_else(|| Path::new("."));
            let cached = dir.join(denoised_file_name(kind, mix.suppression));

            if !is_file(&cached).await {
                self.suppress_into(source, &cached, mix.suppression).await?;
            } else {
                debug!(stem = %kind, intensity = mix.suppression, "Reusing suppressed stem");
            }

            match kind {
                StemKind::Vocals => prepared.vocals = cached,
                StemKind::Drums => prepared.drums = cached,
                StemKind::Bass => prepared.bass = cached,
                StemKind::Other => prepared.other = cached,
            }
        }
        Ok(prepared)
    }

    async fn suppress_into(&self, source: &Path, cached: &Path, intensity: u8) -> Result<()> {
        let dir = cached.parent().unwrap_or_else(|| Path::new("."));
        let staging = tempfile::Builder::new()
            .prefix(".denoise-")
            .suffix(".wav")
            .tempfile_in(dir)
            .map_err(|e| Error::io_path("creating temp file in", dir, e))?;

        info!(
            source = %source.display(),
            intensity,
            suppressor = self.denoiser.name(),
            "Suppressing noise"
        );
        self.denoiser
            .suppress(source, staging.path(), intensity)
            .await?;

        // Concurrent renders may race to fill the same cache entry; both
        // produce the same bytes and the rename is atomic.
        staging
            .persist(cached)
            .map_err(|e| Error::io_path("persisting", cached, e.error))?;
        Ok(())
    }

    /// Render `params` over `stems` into the WAV file `out`.
    pub async fn render(
        &self,
        stems: &StemSet,
        params: &MixParameters,
        out: &Path,
    ) -> Result<PathBuf> {
        params.validate()?;
        let prepared = self.prepare_stems(stems, params).await?;
        let audio = StemAudio::load(&prepared).await?;

        let dir = out
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let out = out.to_path_buf();
        let params = *params;
        let limiter = self.limiter;
        let encoding = self.encoding;

        let rendered = tokio::task::spawn_blocking(move || -> Result<(PathBuf, f32, f64)> {
            let mixed = mix_stems(&audio, &params, limiter)?;
            let staging = tempfile::Builder::new()
                .prefix(".render-")
                .suffix(".wav")
                .tempfile_in(&dir)
                .map_err(|e| Error::io_path("creating temp file in", &dir, e))?;
            wav::write_wav(staging.path(), &mixed, encoding)?;
            staging
                .persist(&out)
                .map_err(|e| Error::io_path("persisting", &out, e.error))?;
            Ok((out, mixed.peak(), mixed.duration_secs()))
        })
        .await
        .map_err(|e| Error::Other(format!("mix task failed: {}", e)))?;

        let (path, peak, duration) = rendered?;
        info!(
            output = %path.display(),
            peak,
            duration_secs = duration,
            "Mix rendered"
        );
        Ok(path)
    }

    /// Replace the audio of `video` with the mix rendered under `mix_key`,
    /// writing into `out_dir`.
    pub async fn remux(
        &self,
        video: &Path,
        audio: &Path,
        out_dir: &Path,
        mix_key: &str,
    ) -> Result<PathBuf> {
        self.muxer.remux(video, audio, out_dir, mix_key).await
    }
}

impl std::fmt::Debug for RemixEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemixEngine")
            .field("denoiser", &self.denoiser.name())
            .field("limiter", &self.limiter)
            .field("encoding", &self.encoding)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Gain;
    use crate::media::FfmpegTools;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Halves every sample instead of running a real denoiser.
    #[derive(Default)]
    struct HalvingSuppressor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NoiseSuppressor for HalvingSuppressor {
        fn name(&self) -> &'static str {
            "halving"
        }

        async fn suppress(&self, input: &Path, output: &Path, _intensity: u8) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut buffer = wav::read_wav(input)?;
            for sample in &mut buffer.samples {
                *sample *= 0.5;
            }
            wav::write_wav(output, &buffer, WavEncoding::Float32)
        }
    }

    fn tone(frames: usize, step: i32) -> AudioBuffer {
        let samples = (0..frames * 2)
            .map(|i| ((i as i32 * step) % 16384) as f32 / 32768.0)
            .collect();
        AudioBuffer::new(44100, 2, samples)
    }

    fn stems(frames: usize) -> StemAudio {
        StemAudio::new([
            tone(frames, 7),
            tone(frames, 13),
            tone(frames, 29),
            tone(frames, 53),
        ])
        .unwrap()
    }

    fn engine(suppressor: Arc<HalvingSuppressor>) -> RemixEngine {
        RemixEngine::new(suppressor, Muxer::new(FfmpegTools::new("ffmpeg", "ffprobe")))
    }

    async fn write_stems(dir: &Path, audio: &StemAudio) -> StemSet {
        let set = StemSet::in_dir(dir);
        for (kind, path) in set.iter() {
            wav::write_wav(path, audio.get(kind), WavEncoding::Pcm16).unwrap();
        }
        set
    }

    #[test]
    fn test_isolation_reproduces_stem() {
        let audio = stems(500);
        for kind in StemKind::ALL {
            let out = mix_stems(&audio, &MixParameters::isolate(kind), Limiter::default()).unwrap();
            assert_eq!(out.samples, audio.get(kind).samples);
        }
    }

    #[test]
    fn test_mix_truncates_to_shortest() {
        let audio = StemAudio::new([tone(100, 1), tone(80, 2), tone(100, 3), tone(90, 4)]).unwrap();
        let out = mix_stems(&audio, &MixParameters::unity(), Limiter::default()).unwrap();
        assert_eq!(out.frames(), 80);
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let mono = AudioBuffer::new(44100, 1, vec![0.0; 10]);
        let err = StemAudio::new([tone(5, 1), tone(5, 1), mono, tone(5, 1)]).unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_peak_normalize() {
        let mut buffer = AudioBuffer::new(44100, 1, vec![0.5, -2.0, 1.0]);
        Limiter::PeakNormalize.apply(&mut buffer);
        assert_eq!(buffer.samples, vec![0.25, -1.0, 0.5]);

        let mut quiet = AudioBuffer::new(44100, 1, vec![0.5, -0.25]);
        Limiter::PeakNormalize.apply(&mut quiet);
        assert_eq!(quiet.samples, vec![0.5, -0.25]);
    }

    #[test]
    fn test_hard_clip() {
        let mut buffer = AudioBuffer::new(44100, 1, vec![0.5, -2.0, 1.5]);
        Limiter::HardClip.apply(&mut buffer);
        assert_eq!(buffer.samples, vec![0.5, -1.0, 1.0]);
    }

    #[test]
    fn test_loud_mix_stays_in_range() {
        let loud = AudioBuffer::new(44100, 1, vec![0.9, -0.9, 0.5]);
        let audio = StemAudio::new([loud.clone(), loud.clone(), loud.clone(), loud]).unwrap();
        let params = MixParameters::unity().with_gain(StemKind::Vocals, Gain::Decibels(12.0));
        let out = mix_stems(&audio, &params, Limiter::PeakNormalize).unwrap();
        assert!(out.peak() <= 1.0);
        assert_eq!(out.peak(), 1.0);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = MixParameters::unity().with_gain(StemKind::Bass, Gain::Linear(-1.0));
        let err = mix_stems(&stems(10), &params, Limiter::default()).unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_render_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let set = write_stems(tmp.path(), &stems(2000)).await;
        let engine = engine(Arc::new(HalvingSuppressor::default()));
        let params = MixParameters::unity()
            .with_gain(StemKind::Drums, Gain::Decibels(-6.0))
            .with_gain(StemKind::Other, Gain::Linear(0.3));

        let a = engine.render(&set, &params, &tmp.path().join("a.wav")).await.unwrap();
        let b = engine.render(&set, &params, &tmp.path().join("b.wav")).await.unwrap();
        assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
    }

    #[tokio::test]
    async fn test_render_isolated_stem_matches_file() {
        let tmp = tempfile::tempdir().unwrap();
        let set = write_stems(tmp.path(), &stems(2000)).await;
        let engine = engine(Arc::new(HalvingSuppressor::default()));

        let out = engine
            .render(&set, &MixParameters::isolate(StemKind::Vocals), &tmp.path().join("mix.wav"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(out).unwrap(), std::fs::read(&set.vocals).unwrap());
    }

    #[tokio::test]
    async fn test_suppressed_stems_are_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let set = write_stems(tmp.path(), &stems(500)).await;
        let suppressor = Arc::new(HalvingSuppressor::default());
        let engine = engine(suppressor.clone());
        let params = MixParameters::unity().with_suppression(StemKind::Other, 40);

        let prepared = engine.prepare_stems(&set, &params).await.unwrap();
        assert_eq!(prepared.other, tmp.path().join("denoised-other-40.wav"));
        assert_eq!(prepared.vocals, set.vocals);

        engine.prepare_stems(&set, &params).await.unwrap();
        assert_eq!(suppressor.calls.load(Ordering::SeqCst), 1);

        let out = engine
            .render(&set, &params, &tmp.path().join("mix.wav"))
            .await
            .unwrap();
        assert!(out.exists());
        assert_eq!(suppressor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_muted_stem_is_not_suppressed() {
        let tmp = tempfile::tempdir().unwrap();
        let set = write_stems(tmp.path(), &stems(100)).await;
        let suppressor = Arc::new(HalvingSuppressor::default());
        let engine = engine(suppressor.clone());
        let params = MixParameters::isolate(StemKind::Vocals).with_global_suppression(30);

        let prepared = engine.prepare_stems(&set, &params).await.unwrap();
        assert_eq!(suppressor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(prepared.drums, set.drums);
    }
}

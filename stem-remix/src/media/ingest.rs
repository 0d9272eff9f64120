//! Upload validation and decoding to canonical PCM.
//!
//! An upload is checked and written synchronously when a job is created.
//! Decoding to the canonical WAV (`audio.wav`, 16-bit PCM at the configured
//! rate and channel count) runs later, inside the job's loading phase.

use std::path::{Path, PathBuf};

use hound::SampleFormat;
use tracing::{debug, info, warn};

use super::ffmpeg::FfmpegTools;
use super::formats::{self, MediaKind};
use super::wav;
use crate::domain::StemKind;
use crate::utils::filename::upload_file_name;
use crate::utils::fs::write_file;
use crate::{Error, Result};

/// File name of the canonical decoded audio inside a job directory.
pub const CANONICAL_AUDIO_NAME: &str = "audio.wav";

/// Prefix given to uploads whose name collides with a derived artifact.
const RENAMED_UPLOAD_PREFIX: &str = "upload-";

/// An upload written to its job directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub file_name: String,
    pub path: PathBuf,
    pub kind: MediaKind,
    /// Lowercased extension.
    pub extension: String,
}

/// Result of decoding an upload.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalAudio {
    pub path: PathBuf,
    pub duration_secs: f64,
    /// Whether the upload has a video stream to remux against.
    pub has_video: bool,
}

/// Validates uploads and decodes them to canonical audio.
#[derive(Debug, Clone)]
pub struct MediaIngest {
    tools: FfmpegTools,
    sample_rate: u32,
    channels: u16,
    max_upload_bytes: Option<u64>,
}

fn is_derived_artifact_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == CANONICAL_AUDIO_NAME
        || StemKind::ALL.iter().any(|k| lower == k.file_name())
        || ["output-", "preview-", "mix-", "denoised-"]
            .iter()
            .any(|p| lower.starts_with(p))
}

impl MediaIngest {
    pub fn new(tools: FfmpegTools, sample_rate: u32, channels: u16) -> Self {
        Self {
            tools,
            sample_rate,
            channels,
            max_upload_bytes: None,
        }
    }

    /// Reject uploads larger than `bytes`.
    pub fn with_max_upload_bytes(mut self, bytes: Option<u64>) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Check an upload without touching the filesystem.
    ///
    /// Returns the file name the upload will be stored under with its kind and extension.
    pub fn validate(&self, declared_name: &str, len: usize) -> Result<(String, MediaKind, String)> {
        let mut file_name = upload_file_name(declared_name);
        let (kind, extension) = formats::classify(&file_name)?;

        if len == 0 {
            return Err(Error::UnsupportedFormat(format!("'{}' is empty", file_name)));
        }
        if let Some(max) = self.max_upload_bytes
            && len as u64 > max
        {
            return Err(Error::validation(format!(
                "upload of {} bytes exceeds the {} byte limit",
                len, max
            )));
        }

        if is_derived_artifact_name(&file_name) {
            file_name = format!("{}{}", RENAMED_UPLOAD_PREFIX, file_name);
        }
        Ok((file_name, kind, extension))
    }

    /// Validate an upload and write it into `job_dir`.
    pub async fn store_upload(
        &self,
        job_dir: &Path,
        declared_name: &str,
        bytes: &[u8],
    ) -> Result<StoredUpload> {
        let (file_name, kind, extension) = self.validate(declared_name, bytes.len())?;
        let path = job_dir.join(&file_name);
        write_file("writing upload", &path, bytes).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "Stored upload");
        Ok(StoredUpload {
            file_name,
            path,
            kind,
            extension,
        })
    }

    /// Whether `path` already is a WAV in the canonical layout.
    fn is_canonical_wav(&self, path: &Path) -> bool {
        match wav::read_wav_spec(path) {
            Ok(spec) => {
                spec.sample_format == SampleFormat::Int
                    && spec.bits_per_sample == 16
                    && spec.sample_rate == self.sample_rate
                    && spec.channels == self.channels
            }
            Err(_) => false,
        }
    }

    /// Decode `upload` into `<job_dir>/audio.wav`.
    ///
    /// Content that cannot be decoded fails with `UnsupportedFormat`.
    pub async fn decode(&self, upload: &StoredUpload, job_dir: &Path) -> Result<CanonicalAudio> {
        let out = job_dir.join(CANONICAL_AUDIO_NAME);

        if upload.extension == "wav" && self.is_canonical_wav(&upload.path) {
            tokio::fs::copy(&upload.path, &out)
                .await
                .map_err(|e| Error::io_path("copying canonical audio", &out, e))?;
            debug!(path = %out.display(), "Upload already canonical, copied");
        } else {
            let mut args = FfmpegTools::base_args();
            args.push("-i".to_string());
            args.push(upload.path.to_string_lossy().to_string());
            args.extend(["-vn", "-acodec", "pcm_s16le"].map(String::from));
            args.extend(["-ar".to_string(), self.sample_rate.to_string()]);
            args.extend(["-ac".to_string(), self.channels.to_string()]);
            args.push(out.to_string_lossy().to_string());

            let output = self.tools.run(&args).await?;
            if !output.status.success() {
                return Err(Error::UnsupportedFormat(format!(
                    "could not decode '{}': {}",
                    upload.file_name,
                    output.failure_detail()
                )));
            }
        }

        let duration_secs = wav::wav_duration_secs(&out).map_err(|e| match e {
            Error::UnsupportedFormat(detail) => {
                Error::UnsupportedFormat(format!("decoded audio is unreadable: {}", detail))
            }
            other => other,
        })?;
        if duration_secs <= 0.0 {
            return Err(Error::UnsupportedFormat(format!(
                "'{}' contains no audio",
                upload.file_name
            )));
        }

        let has_video = match upload.kind {
            MediaKind::Audio => false,
            MediaKind::Video => match self.tools.has_video_stream(&upload.path).await {
                Ok(found) => found,
                Err(e) => {
                    // Assume a video track; the remux step reports a real failure.
                    warn!("Could not verify video stream presence: {}", e);
                    true
                }
            },
        };

        info!(
            source = %upload.file_name,
            duration_secs,
            has_video,
            "Decoded upload to canonical audio"
        );

        Ok(CanonicalAudio {
            path: out,
            duration_secs,
            has_video,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::wav::{AudioBuffer, WavEncoding, write_wav};

    fn ingest() -> MediaIngest {
        MediaIngest::new(FfmpegTools::new("ffmpeg", "ffprobe"), 44100, 2)
    }

    #[test]
    fn test_validate_rejects_unknown_extension() {
        let err = ingest().validate("notes.txt", 10).unwrap_err();
        assert_eq!(err.kind(), "UNSUPPORTED_FORMAT");
    }

    #[test]
    fn test_validate_rejects_empty_and_oversize() {
        assert_eq!(
            ingest().validate("a.wav", 0).unwrap_err().kind(),
            "UNSUPPORTED_FORMAT"
        );
        let limited = ingest().with_max_upload_bytes(Some(4));
        assert_eq!(
            limited.validate("a.wav", 5).unwrap_err().kind(),
            "VALIDATION_ERROR"
        );
        assert!(limited.validate("a.wav", 4).is_ok());
    }

    #[test]
    fn test_validate_renames_colliding_upload() {
        let (name, kind, _) = ingest().validate("vocals.wav", 10).unwrap();
        assert_eq!(name, "upload-vocals.wav");
        assert_eq!(kind, MediaKind::Audio);
        let (name, _, _) = ingest().validate("C:\\clips\\audio.wav", 10).unwrap();
        assert_eq!(name, "upload-audio.wav");
        let (name, _, _) = ingest().validate("output-3f2a.mp4", 10).unwrap();
        assert_eq!(name, "upload-output-3f2a.mp4");
        let (name, kind, ext) = ingest().validate("holiday.MP4", 10).unwrap();
        assert_eq!(name, "holiday.MP4");
        assert_eq!(kind, MediaKind::Video);
        assert_eq!(ext, "mp4");
    }

    #[tokio::test]
    async fn test_canonical_wav_is_copied_without_ffmpeg() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.wav");
        write_wav(
            &src,
            &AudioBuffer::silence(44100, 2, 44100),
            WavEncoding::Pcm16,
        )
        .unwrap();
        let bytes = std::fs::read(&src).unwrap();

        let job_dir = tmp.path().join("job");
        std::fs::create_dir_all(&job_dir).unwrap();

        let ingest = MediaIngest::new(
            FfmpegTools::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe"),
            44100,
            2,
        );
        let upload = ingest
            .store_upload(&job_dir, "song.wav", &bytes)
            .await
            .unwrap();
        let audio = ingest.decode(&upload, &job_dir).await.unwrap();

        assert_eq!(audio.path, job_dir.join(CANONICAL_AUDIO_NAME));
        assert!((audio.duration_secs - 1.0).abs() < 1e-9);
        assert!(!audio.has_video);
    }

    #[tokio::test]
    async fn test_corrupt_upload_fails_decode() {
        let tmp = tempfile::tempdir().unwrap();
        let ingest = MediaIngest::new(
            FfmpegTools::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe"),
            44100,
            2,
        );
        let upload = ingest
            .store_upload(tmp.path(), "broken.wav", b"not audio at all")
            .await
            .unwrap();
        let err = ingest.decode(&upload, tmp.path()).await.unwrap_err();
        assert!(matches!(err.kind(), "UNSUPPORTED_FORMAT" | "IO_FAILURE"));
        assert!(!err.to_string().is_empty());
    }
}

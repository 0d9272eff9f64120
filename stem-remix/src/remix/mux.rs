//! Replacing the audio track of a video container with a rendered mix.
//!
//! The video stream is always stream-copied; only the audio is encoded, with a
//! codec the target container accepts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::media::FfmpegTools;
use crate::utils::filename::extension_of;
use crate::{Error, Result};

/// Base name of the muxed download inside a job directory.
pub const MUXED_OUTPUT_STEM: &str = "output";

/// Container used when the source container cannot carry a re-encoded track.
const FALLBACK_CONTAINER: &str = "mp4";

/// Audio codec options for the muxed track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    /// AAC codec.
    Aac,
    /// Opus codec.
    Opus,
    /// MPEG-1 Layer II, for MPEG program streams.
    Mp2,
}

impl AudioCodec {
    fn as_ffmpeg_args(&self) -> Vec<String> {
        match self {
            Self::Aac => vec!["-c:a".to_string(), "aac".to_string()],
            Self::Opus => vec!["-c:a".to_string(), "libopus".to_string()],
            Self::Mp2 => vec!["-c:a".to_string(), "mp2".to_string()],
        }
    }

    /// Codec for a container extension, or `None` when the container is not
    /// a supported remux target.
    pub fn for_container(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mp4" | "mov" | "m4v" | "mkv" | "avi" | "flv" | "ts" => Some(Self::Aac),
            "webm" => Some(Self::Opus),
            "mpg" => Some(Self::Mp2),
            _ => None,
        }
    }
}

/// Container and codec chosen for a source video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxTarget {
    /// Output extension.
    pub container: String,
    pub codec: AudioCodec,
}

impl MuxTarget {
    /// Keep the source container when possible, otherwise fall back to mp4.
    pub fn for_source(container: &str) -> Self {
        match AudioCodec::for_container(container) {
            Some(codec) => Self {
                container: container.to_ascii_lowercase(),
                codec,
            },
            None => Self {
                container: FALLBACK_CONTAINER.to_string(),
                codec: AudioCodec::Aac,
            },
        }
    }

    /// Target for a source video file, keyed on its extension.
    pub fn for_video(video: &Path) -> Self {
        let container = video
            .file_name()
            .and_then(|name| extension_of(&name.to_string_lossy()))
            .unwrap_or_default();
        Self::for_source(&container)
    }

    /// File name of the muxed output for a mix, e.g. `output-1a2b3c.mkv`.
    pub fn file_name(&self, mix_key: &str) -> String {
        format!("{}-{}.{}", MUXED_OUTPUT_STEM, mix_key, self.container)
    }
}

/// Map user-friendly format names to FFmpeg's internal format names.
fn normalize_format(format: &str) -> &str {
    match format {
        "mkv" => "matroska",
        "ts" => "mpegts",
        "mp4" | "m4v" => "mp4",
        "mpg" => "mpeg",
        _ => format,
    }
}

/// Muxes a rendered mix against the video stream of the original upload.
#[derive(Debug, Clone)]
pub struct Muxer {
    tools: FfmpegTools,
}

impl Muxer {
    pub fn new(tools: FfmpegTools) -> Self {
        Self { tools }
    }

    fn build_args(video: &Path, audio: &Path, target: &MuxTarget, output: &Path) -> Vec<String> {
        let mut args = FfmpegTools::base_args();

        args.extend(["-i".to_string(), video.to_string_lossy().to_string()]);
        args.extend(["-i".to_string(), audio.to_string_lossy().to_string()]);

        args.extend(["-map".to_string(), "0:v:0".to_string()]);
        args.extend(["-map".to_string(), "1:a:0".to_string()]);

        // Video is never re-encoded.
        args.extend(["-c:v".to_string(), "copy".to_string()]);
        args.extend(target.codec.as_ffmpeg_args());
        args.push("-shortest".to_string());

        // `-movflags +faststart` on non-MP4 outputs makes ffmpeg fail to open the output.
        if matches!(target.container.as_str(), "mp4" | "mov" | "m4v") {
            args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        }

        args.extend([
            "-f".to_string(),
            normalize_format(&target.container).to_string(),
        ]);
        args.push(output.to_string_lossy().to_string());
        args
    }

    /// Write `video`'s video stream together with `audio` into `out_dir`.
    ///
    /// Returns the path of the muxed file, named after [`MuxTarget::file_name`]
    /// for `mix_key`. An existing file under that name is returned as is.
    pub async fn remux(
        &self,
        video: &Path,
        audio: &Path,
        out_dir: &Path,
        mix_key: &str,
    ) -> Result<PathBuf> {
        let target = MuxTarget::for_video(video);
        let output = out_dir.join(target.file_name(mix_key));
        if output.is_file() {
            debug!(output = %output.display(), "Reusing muxed output");
            return Ok(output);
        }

        // ffmpeg writes next to the final name so a failed run never leaves a
        // truncated artifact behind.
        let staging = tempfile::Builder::new()
            .prefix(".mux-")
            .suffix(&format!(".{}", target.container))
            .tempfile_in(out_dir)
            .map_err(|e| Error::io_path("creating temp file in", out_dir, e))?;
        let staging_path = staging.path().to_path_buf();

        let args = Self::build_args(video, audio, &target, &staging_path);
        debug!(video = %video.display(), codec = ?target.codec, "Remuxing");

        let result = self.tools.run(&args).await?;
        if !result.status.success() {
            return Err(Error::Other(format!(
                "remux of {} failed: {}",
                video.display(),
                result.failure_detail()
            )));
        }

        staging
            .persist(&output)
            .map_err(|e| Error::io_path("persisting", &output, e.error))?;

        info!(
            output = %output.display(),
            duration = result.duration,
            "Remux completed"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("mp4", "mp4", AudioCodec::Aac)]
    #[case("MOV", "mov", AudioCodec::Aac)]
    #[case("mkv", "mkv", AudioCodec::Aac)]
    #[case("webm", "webm", AudioCodec::Opus)]
    #[case("mpg", "mpg", AudioCodec::Mp2)]
    #[case("wmv", "mp4", AudioCodec::Aac)]
    #[case("", "mp4", AudioCodec::Aac)]
    fn test_target_for_source(
        #[case] source: &str,
        #[case] container: &str,
        #[case] codec: AudioCodec,
    ) {
        let target = MuxTarget::for_source(source);
        assert_eq!(target.container, container);
        assert_eq!(target.codec, codec);
    }

    #[test]
    fn test_build_args_copies_video() {
        let target = MuxTarget::for_source("mp4");
        let args = Muxer::build_args(
            Path::new("/j/clip.mp4"),
            Path::new("/j/mix.wav"),
            &target,
            Path::new("/j/output-abc.mp4"),
        );

        let joined = args.join(" ");
        assert!(joined.contains("-map 0:v:0 -map 1:a:0"));
        assert!(joined.contains("-c:v copy"));
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-shortest"));
        assert!(joined.contains("-f mp4"));
        assert_eq!(args.last().unwrap(), "/j/output-abc.mp4");
    }

    #[test]
    fn test_faststart_only_applies_to_mp4_family() {
        let mp4 = Muxer::build_args(
            Path::new("a.mp4"),
            Path::new("m.wav"),
            &MuxTarget::for_source("mp4"),
            Path::new("output.mp4"),
        );
        assert!(mp4.contains(&"+faststart".to_string()));

        let mkv = Muxer::build_args(
            Path::new("a.mkv"),
            Path::new("m.wav"),
            &MuxTarget::for_source("mkv"),
            Path::new("output.mkv"),
        );
        assert!(!mkv.contains(&"-movflags".to_string()));
        assert!(mkv.contains(&"matroska".to_string()));
    }

    #[test]
    fn test_output_file_name_is_keyed_per_mix() {
        let webm = MuxTarget::for_source("webm");
        assert_eq!(webm.file_name("0f3a"), "output-0f3a.webm");
        assert_ne!(webm.file_name("0f3a"), webm.file_name("9bc1"));
        assert_eq!(
            MuxTarget::for_source("wmv").file_name("0f3a"),
            "output-0f3a.mp4"
        );
    }

    #[test]
    fn test_target_for_video_path() {
        let target = MuxTarget::for_video(Path::new("/jobs/a.b/Clip.WEBM"));
        assert_eq!(target.container, "webm");
        assert_eq!(MuxTarget::for_video(Path::new("/jobs/noext")).container, "mp4");
    }

    #[tokio::test]
    async fn test_remux_reuses_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("output-k1.mp4");
        std::fs::write(&existing, b"muxed").unwrap();

        // The binaries do not exist; an existing output must not reach them.
        let muxer = Muxer::new(FfmpegTools::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe"));
        let path = muxer
            .remux(
                &dir.path().join("clip.mp4"),
                &dir.path().join("mix-k1.wav"),
                dir.path(),
                "k1",
            )
            .await
            .unwrap();
        assert_eq!(path, existing);
        assert_eq!(std::fs::read(&path).unwrap(), b"muxed");
    }
}

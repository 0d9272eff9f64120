//! Media ingest and the ffmpeg/WAV collaborators.

pub mod ffmpeg;
pub mod formats;
pub mod ingest;
pub mod wav;

pub use ffmpeg::FfmpegTools;
pub use formats::MediaKind;
pub use ingest::{CanonicalAudio, MediaIngest, StoredUpload};
pub use wav::{AudioBuffer, WavEncoding};

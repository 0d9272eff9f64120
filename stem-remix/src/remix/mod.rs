//! Remixing of separated stems: suppression, gain, summing and remux.

pub mod denoise;
pub mod engine;
pub mod mux;

pub use denoise::{FfmpegDenoiser, NoiseSuppressor};
pub use engine::{Limiter, RemixEngine, StemAudio, mix_stems};
pub use mux::{AudioCodec, MuxTarget, Muxer};

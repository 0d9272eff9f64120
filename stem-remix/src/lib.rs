//! Stem separation jobs and remixing.
//!
//! An upload becomes a job that is decoded to canonical audio, separated
//! into vocals, drums, bass and other, and then remixed on demand with
//! per-stem gain and noise suppression, optionally muxed back into the
//! original video.

pub mod config;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod media;
pub mod remix;
pub mod separation;
pub mod utils;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use jobs::JobController;

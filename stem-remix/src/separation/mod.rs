//! Separation of canonical audio into four stems.
//!
//! [`SeparationAdapter`] is the only entry point used by the job controller.
//! It checks device availability, retries resource exhaustion once and
//! persists the produced stems into the job directory. The model itself sits
//! behind [`SeparationBackend`]; [`DemucsBackend`] drives the demucs CLI.

pub mod adapter;
pub mod backend;
pub mod demucs;
pub mod device;

pub use adapter::SeparationAdapter;
pub use backend::{
    BackendError, ProgressReporter, SeparationBackend, SeparationProgress, SeparationRequest,
};
pub use demucs::DemucsBackend;
pub use device::DeviceAvailability;

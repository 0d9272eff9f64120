//! Domain layer for stem-remix.
//!
//! Jobs and their lifecycle, stems, compute devices and mix parameters.

pub mod device;
pub mod job;
pub mod mix;
pub mod progress;
pub mod stem;

pub use device::Device;
pub use job::{Job, JobSnapshot, JobState};
pub use mix::{Gain, MixArtifact, MixArtifactKind, MixParameters, StemMix};
pub use progress::{ProgressEvent, ProgressPhase};
pub use stem::{StemKind, StemSet};

//! Job domain module.

mod entity;
mod state;

pub use entity::{Job, JobSnapshot, VideoTrack};
pub use state::JobState;

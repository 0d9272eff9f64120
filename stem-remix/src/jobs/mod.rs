//! Job tracking and orchestration.
//!
//! [`JobStore`] holds job records, [`ProgressChannel`] fans progress out to
//! listeners, worker pools run separations in the background and
//! [`JobController`] ties them together.

pub mod controller;
pub mod progress;
pub mod purge;
pub mod store;
pub mod worker_pool;

pub use controller::{JobController, ProcessAck};
pub use progress::{ProgressChannel, ProgressStream};
pub use purge::{JobPurgeService, PurgeConfig};
pub use store::JobStore;
pub use worker_pool::{WorkerPool, WorkerPoolConfig, WorkerType};

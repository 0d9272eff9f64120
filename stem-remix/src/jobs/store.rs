//! In-memory job registry.
//!
//! Each job sits behind its own mutex, so updates to one job are serialized
//! while updates to different jobs never contend. The map itself is a
//! `DashMap`; its shard locks are only held long enough to clone the
//! job's `Arc`.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::domain::{Job, JobState};
use crate::{Error, Result};

const ENTITY: &str = "Job";

/// Concurrency-safe registry of jobs.
#[derive(Default)]
pub struct JobStore {
    jobs: DashMap<String, Arc<Mutex<Job>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> Result<Arc<Mutex<Job>>> {
        self.jobs
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found(ENTITY, id))
    }

    /// Register a job and return its id.
    pub fn create(&self, job: Job) -> String {
        let id = job.id.clone();
        debug!(job_id = %id, "Job registered");
        self.jobs.insert(id.clone(), Arc::new(Mutex::new(job)));
        id
    }

    /// Snapshot of a job.
    pub fn get(&self, id: &str) -> Result<Job> {
        Ok(self.entry(id)?.lock().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    /// Apply `mutation` atomically to one job.
    ///
    /// The job lock is held for the whole closure. When the closure returns an
    /// error the job is left exactly as it was.
    pub fn update<R, F>(&self, id: &str, mutation: F) -> Result<R>
    where
        F: FnOnce(&mut Job) -> Result<R>,
    {
        let entry = self.entry(id)?;
        let mut guard = entry.lock();
        let mut draft = guard.clone();
        let result = mutation(&mut draft)?;
        *guard = draft;
        Ok(result)
    }

    /// Move a job to `target`, validating the transition.
    pub fn transition(&self, id: &str, target: JobState) -> Result<Job> {
        self.update(id, |job| {
            job.state = job.state.transition_to(target)?;
            job.updated_at = chrono::Utc::now();
            Ok(job.clone())
        })
    }

    /// Remove a job from the registry.
    pub fn delete(&self, id: &str) -> Result<Job> {
        let (_, entry) = self
            .jobs
            .remove(id)
            .ok_or_else(|| Error::not_found(ENTITY, id))?;
        let job = entry.lock().clone();
        debug!(job_id = %id, "Job removed");
        Ok(job)
    }

    /// Snapshots of all jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let entries: Vec<_> = self.jobs.iter().map(|e| e.value().clone()).collect();
        let mut jobs: Vec<Job> = entries.iter().map(|e| e.lock().clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

//! Optional expiry of old jobs.
//!
//! Nothing is evicted unless a TTL is configured. When it is, a background
//! task periodically deletes jobs that have not changed for longer than the
//! TTL and are not being separated.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::RetentionConfig;

/// Configuration for job purging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Age after which an idle job is deleted. `None` keeps every job.
    pub job_ttl_secs: Option<u64>,
    /// Interval between purge checks in seconds.
    pub check_interval_secs: u64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            job_ttl_secs: None,
            check_interval_secs: 3600, // 1 hour
        }
    }
}

impl From<&RetentionConfig> for PurgeConfig {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            job_ttl_secs: config.job_ttl_secs,
            check_interval_secs: config.purge_interval_secs,
        }
    }
}

impl PurgeConfig {
    pub fn with_job_ttl_secs(mut self, secs: Option<u64>) -> Self {
        self.job_ttl_secs = secs;
        self
    }

    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.job_ttl_secs.is_some()
    }

    /// Jobs last updated before the returned instant are expired.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = self.job_ttl_secs?;
        let ttl = i64::try_from(ttl)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .unwrap_or(ChronoDuration::MAX);
        Some(now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC))
    }
}

/// Source of expired jobs and the means to delete them.
#[async_trait]
pub trait ExpiredJobs: Send + Sync + 'static {
    /// Ids of idle jobs last updated before `cutoff`.
    fn expired_job_ids(&self, cutoff: DateTime<Utc>) -> Vec<String>;

    /// Delete a job together with its files.
    async fn delete_expired(&self, id: &str) -> Result<()>;
}

/// Deletes expired jobs.
pub struct JobPurgeService {
    config: PurgeConfig,
    jobs: Arc<dyn ExpiredJobs>,
}

impl JobPurgeService {
    pub fn new(config: PurgeConfig, jobs: Arc<dyn ExpiredJobs>) -> Self {
        Self { config, jobs }
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }

    /// Run a single purge. Returns the number of jobs deleted.
    pub async fn run_purge(&self) -> Result<usize> {
        let Some(cutoff) = self.config.cutoff(Utc::now()) else {
            debug!("Job purging disabled (no job_ttl_secs)");
            return Ok(0);
        };

        let mut deleted = 0;
        for id in self.jobs.expired_job_ids(cutoff) {
            match self.jobs.delete_expired(&id).await {
                Ok(()) => deleted += 1,
                // Deleted concurrently by someone else.
                Err(e) if e.kind() == "NOT_FOUND" => {}
                Err(e) => warn!(job_id = %id, "Failed to purge job: {}", e),
            }
        }

        if deleted > 0 {
            info!(
                "Purged {} expired jobs (ttl: {}s)",
                deleted,
                self.config.job_ttl_secs.unwrap_or_default()
            );
        } else {
            debug!("No jobs to purge");
        }
        Ok(deleted)
    }

    /// Start the background purge task. Does nothing when purging is disabled.
    pub fn start_background_task(self, cancellation_token: CancellationToken) {
        if !self.config.is_enabled() {
            debug!("Job purge service not started (disabled)");
            return;
        }

        tokio::spawn(async move {
            let mut check_interval =
                interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Job purge service started (ttl: {}s, interval: {}s)",
                self.config.job_ttl_secs.unwrap_or_default(),
                self.config.check_interval_secs
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Job purge service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = self.run_purge().await {
                            error!("Purge cycle failed: {}", e);
                        }
                    }
                }
            }
        });
    }
}

//! Submission stage
//!
//! Drains the normalized-record channel of one `(account, resource)` pair.
//! Registered agents push fixed-size batches with retries; unregistered
//! agents only log the records locally.

use crate::control::{ControlPlane, ResourceBatch};
use crate::resource::{Resource, ResourceInstance};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default number of records per pushed batch
pub const DEFAULT_MAX_RESOURCE_PUSH_COUNT: usize = 100;

/// Linear backoff retry: attempt `n` failing waits `n * backoff_step`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }

    /// Run `op` until it succeeds or attempts run out, returning the last error
    pub async fn run<F, Fut, T>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        "Failed to {} (retry {}/{}): {:#}",
                        what,
                        attempt,
                        max_attempts,
                        err
                    );
                    tokio::time::sleep(self.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Batch metadata shared by every push of one pipeline
#[derive(Debug, Clone)]
pub struct BatchTarget {
    pub platform: String,
    pub version: String,
    pub cloud_account_id: String,
    pub resource_type: String,
    pub resource_type_name: String,
    pub resource_group_type: String,
    pub doc_link: String,
}

impl BatchTarget {
    pub fn new(platform: &str, cloud_account_id: &str, resource: &Resource, version: &str) -> Self {
        Self {
            platform: platform.to_string(),
            version: version.to_string(),
            cloud_account_id: cloud_account_id.to_string(),
            resource_type: resource.resource_type.clone(),
            resource_type_name: resource.resource_type_name.clone(),
            resource_group_type: resource.resource_group_type.clone(),
            doc_link: resource.desc.clone(),
        }
    }

    fn batch(&self, instances: Vec<ResourceInstance>) -> ResourceBatch {
        ResourceBatch {
            platform: self.platform.clone(),
            version: self.version.clone(),
            cloud_account_id: self.cloud_account_id.clone(),
            resource_type: self.resource_type.clone(),
            resource_type_name: self.resource_type_name.clone(),
            resource_group_type: self.resource_group_type.clone(),
            doc_link: self.doc_link.clone(),
            instances,
        }
    }
}

/// Outcome of one submission run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitStats {
    pub records: usize,
    pub pushed_batches: usize,
    pub dropped_batches: usize,
}

/// Submission stage; `client == None` means unregistered
#[derive(Clone)]
pub struct Submitter {
    client: Option<Arc<dyn ControlPlane>>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl Submitter {
    pub fn new(client: Option<Arc<dyn ControlPlane>>, batch_size: usize) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_registered(&self) -> bool {
        self.client.is_some()
    }

    /// Consume `rx` until it closes
    pub async fn run(
        &self,
        target: BatchTarget,
        mut rx: mpsc::Receiver<ResourceInstance>,
    ) -> SubmitStats {
        let mut stats = SubmitStats::default();

        let Some(client) = &self.client else {
            while let Some(record) = rx.recv().await {
                stats.records += 1;
                tracing::info!(
                    resource_id = %record.resource_id,
                    resource_name = record.resource_name.as_deref().unwrap_or_default(),
                    address = record.address.as_deref().unwrap_or_default(),
                    "Collected resource"
                );
            }
            return stats;
        };

        let mut pending = Vec::with_capacity(self.batch_size);
        while let Some(record) = rx.recv().await {
            stats.records += 1;
            pending.push(record);
            if pending.len() >= self.batch_size {
                let batch = target.batch(std::mem::take(&mut pending));
                self.flush(client.as_ref(), batch, &mut stats).await;
            }
        }

        // Trailing partial batch
        if !pending.is_empty() {
            self.flush(client.as_ref(), target.batch(pending), &mut stats)
                .await;
        }

        stats
    }

    async fn flush(&self, client: &dyn ControlPlane, batch: ResourceBatch, stats: &mut SubmitStats) {
        let count = batch.instances.len();
        let result = self
            .retry
            .run("send resource batch", || client.push_resources(&batch))
            .await;

        match result {
            Ok(()) => {
                stats.pushed_batches += 1;
                tracing::debug!(
                    account_id = %batch.cloud_account_id,
                    resource_type = %batch.resource_type,
                    count,
                    "Pushed resource batch"
                );
            }
            Err(e) => {
                stats.dropped_batches += 1;
                tracing::error!(
                    account_id = %batch.cloud_account_id,
                    resource_type = %batch.resource_type,
                    count,
                    "Failed to send resource batch after {} retries: {:#}",
                    self.retry.max_attempts,
                    e
                );
            }
        }
    }
}

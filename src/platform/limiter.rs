//! Per-region concurrency limiter
//!
//! One fixed-width semaphore per region, created on first use and kept for
//! the lifetime of the platform. A permit is held for the whole producer
//! run of a region pass and released when it is dropped.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of concurrent collector runs per region
pub const DEFAULT_MAX_REQUESTS_PER_REGION: usize = 10;

#[derive(Debug)]
pub struct RegionLimiter {
    width: usize,
    limiters: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl RegionLimiter {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    fn semaphore(&self, region: &str) -> Arc<Semaphore> {
        let mut limiters = self.limiters.lock();
        limiters
            .entry(region.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.width)))
            .clone()
    }

    /// Wait for a slot in `region`
    pub async fn acquire(&self, region: &str) -> Result<OwnedSemaphorePermit> {
        self.semaphore(region)
            .acquire_owned()
            .await
            .with_context(|| format!("region limiter for {} closed", region))
    }

    /// Free slots in `region`; unknown regions report full width
    pub fn available(&self, region: &str) -> usize {
        self.limiters
            .lock()
            .get(region)
            .map(|s| s.available_permits())
            .unwrap_or(self.width)
    }

    /// Number of regions seen so far
    pub fn regions(&self) -> usize {
        self.limiters.lock().len()
    }
}

impl Default for RegionLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS_PER_REGION)
    }
}

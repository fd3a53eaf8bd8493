//! Configuration Management
//!
//! Agent options are read from a YAML file and overridden by command line
//! flags. Missing fields fall back to defaults.

use crate::account::CloudAccount;
use crate::error::ConfigError;
use crate::executor::{self, ExecutorOptions};
use crate::platform::{PipelineTuning, RetryPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

fn default_agent_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "cloudrec-agent".to_string())
}

/// Agent options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Identity reported at registration
    pub agent_name: String,
    pub server_url: String,
    /// One-time registration token; without it the agent runs unregistered
    pub access_token: Option<String>,
    /// Site filter for account listing
    pub sites: Vec<String>,
    pub run_only_once: bool,
    /// Cron expression, seconds field first
    pub cron: String,
    pub cloud_account_max_concurrent: usize,
    pub account_queue_size: usize,
    /// Substrings that qualify an error for remote reporting
    pub attention_error_texts: Vec<String>,
    pub max_resource_push_count: usize,
    pub idle_timeout_secs: u64,
    pub collect_timeout_secs: u64,
    pub max_requests_per_region: usize,
    pub refill_interval_secs: u64,
    /// Accounts collected without the control plane
    pub default_accounts: Vec<CloudAccount>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            agent_name: default_agent_name(),
            server_url: "http://localhost:8080".to_string(),
            access_token: None,
            sites: Vec::new(),
            run_only_once: true,
            cron: executor::DEFAULT_CRON.to_string(),
            cloud_account_max_concurrent: executor::DEFAULT_MAX_CONCURRENT_ACCOUNTS,
            account_queue_size: executor::DEFAULT_ACCOUNT_QUEUE_SIZE,
            attention_error_texts: Vec::new(),
            max_resource_push_count: crate::platform::submit::DEFAULT_MAX_RESOURCE_PUSH_COUNT,
            idle_timeout_secs: 60,
            collect_timeout_secs: 240,
            max_requests_per_region: crate::platform::limiter::DEFAULT_MAX_REQUESTS_PER_REGION,
            refill_interval_secs: executor::DEFAULT_REFILL_INTERVAL.as_secs(),
            default_accounts: Vec::new(),
        }
    }
}

/// Command line overrides, applied on top of the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub access_token: Option<String>,
    pub server_url: Option<String>,
    pub run_only_once: Option<bool>,
}

impl Options {
    /// Default config file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cloudrec-agent").join("config.yaml"))
    }

    /// Load from `path`, or from the default path when it exists. An explicit
    /// path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let options = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(options)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut options: Self = serde_yaml::from_str(content)?;
        options.attention_error_texts = dedup_texts(options.attention_error_texts);
        Ok(options)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(token) = overrides.access_token {
            self.access_token = Some(token);
        }
        if let Some(url) = overrides.server_url {
            self.server_url = url;
        }
        if let Some(once) = overrides.run_only_once {
            self.run_only_once = once;
        }
    }

    /// Access token if set and not blank
    pub fn access_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let workers = self.cloud_account_max_concurrent;
        if !(1..=executor::MAX_CONCURRENT_ACCOUNTS).contains(&workers) {
            return Err(ConfigError::InvalidConcurrency {
                got: workers,
                max: executor::MAX_CONCURRENT_ACCOUNTS,
            });
        }
        if self.account_queue_size < workers {
            return Err(ConfigError::QueueTooSmall {
                queue: self.account_queue_size,
                workers,
            });
        }

        let positive = [
            ("max_resource_push_count", self.max_resource_push_count as u64),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("collect_timeout_secs", self.collect_timeout_secs),
            ("max_requests_per_region", self.max_requests_per_region as u64),
            ("refill_interval_secs", self.refill_interval_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*name));
        }

        executor::parse_cron(&self.cron)?;
        Url::parse(&self.server_url)
            .map_err(|_| ConfigError::InvalidServerUrl(self.server_url.clone()))?;
        Ok(())
    }

    pub fn tuning(&self) -> PipelineTuning {
        PipelineTuning {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            collect_deadline: Duration::from_secs(self.collect_timeout_secs),
            max_requests_per_region: self.max_requests_per_region,
            batch_size: self.max_resource_push_count,
            retry: RetryPolicy::default(),
            ..PipelineTuning::default()
        }
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            run_only_once: self.run_only_once,
            cron: self.cron.clone(),
            cloud_account_max_concurrent: self.cloud_account_max_concurrent,
            account_queue_size: self.account_queue_size,
            refill_interval: Duration::from_secs(self.refill_interval_secs),
            ..ExecutorOptions::default()
        }
    }
}

/// Drop blanks and repeats, keeping first occurrence
fn dedup_texts(texts: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    texts
        .into_iter()
        .filter(|t| !t.trim().is_empty() && seen.insert(t.clone()))
        .collect()
}

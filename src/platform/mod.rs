//! Platform
//!
//! A platform is one cloud vendor: its resource catalogue, default regions
//! and provider services. It owns the region limiter and the registries used
//! by the collection pipeline, so several platforms can run side by side in
//! one process without sharing state.

pub mod limiter;
pub mod pipeline;
pub mod registry;
pub mod submit;

pub use limiter::RegionLimiter;
pub use pipeline::{AccountReport, RegionReport, RegionStatus, ResourceReport};
pub use registry::{ServiceKey, ServiceRegistry, VersionRegistry};
pub use submit::{BatchTarget, RetryPolicy, SubmitStats, Submitter};

use crate::account::CloudAccount;
use crate::control::{ControlPlane, SupportResource};
use crate::error::ConfigError;
use crate::oplog::OperationalLogger;
use crate::queue::AccountProcessor;
use crate::resource::{CloudServices, Resource};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Everything needed to build a [`Platform`]
pub struct PlatformConfig {
    /// Platform name, e.g. `ALI_CLOUD`
    pub name: String,
    /// Accounts collected without asking the control plane
    pub default_accounts: Vec<CloudAccount>,
    pub resources: Vec<Resource>,
    pub default_regions: Vec<String>,
    /// Prototype cloned for every region pass
    pub services: Box<dyn CloudServices>,
}

impl PlatformConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyPlatformName);
        }
        if self.resources.is_empty() {
            return Err(ConfigError::NoResources(self.name.clone()));
        }
        if self.default_regions.is_empty() {
            return Err(ConfigError::NoDefaultRegions(self.name.clone()));
        }
        Ok(())
    }
}

/// Timing and sizing knobs of the pipeline
#[derive(Debug, Clone)]
pub struct PipelineTuning {
    /// Delay between launching resource pipelines of one account
    pub resource_stagger: Duration,
    /// Delay between launching region passes of one resource
    pub region_stagger: Duration,
    /// Consumer closes the raw-item channel after this long without data
    pub idle_timeout: Duration,
    /// Hard ceiling on one region pass
    pub collect_deadline: Duration,
    /// Bound on the account-level gate check
    pub gate_timeout: Duration,
    pub max_requests_per_region: usize,
    /// Records per pushed batch
    pub batch_size: usize,
    pub channel_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            resource_stagger: Duration::from_secs(1),
            region_stagger: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            collect_deadline: Duration::from_secs(240),
            gate_timeout: Duration::from_secs(60),
            max_requests_per_region: limiter::DEFAULT_MAX_REQUESTS_PER_REGION,
            batch_size: submit::DEFAULT_MAX_RESOURCE_PUSH_COUNT,
            channel_capacity: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-run collaborators handed down the pipeline
#[derive(Clone)]
pub struct CollectRun {
    /// `None` when the agent is unregistered
    pub client: Option<Arc<dyn ControlPlane>>,
    pub oplog: OperationalLogger,
    /// Cancelled when the agent shuts down
    pub shutdown: CancellationToken,
}

impl CollectRun {
    pub fn new(client: Option<Arc<dyn ControlPlane>>, oplog: OperationalLogger) -> Self {
        Self {
            client,
            oplog,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn registered(&self) -> bool {
        self.client.is_some()
    }

    /// This run as seen by the current session: without a live session the
    /// client is left out, so records go to the console instead of failing
    /// every push.
    pub async fn for_session(&self) -> Self {
        let mut run = self.clone();
        if let Some(client) = &self.client {
            if !client.is_registered().await {
                run.client = None;
            }
        }
        run
    }
}

pub struct Platform {
    name: String,
    default_accounts: Vec<CloudAccount>,
    resources: Vec<Arc<Resource>>,
    default_regions: Vec<String>,
    tuning: PipelineTuning,
    limiter: RegionLimiter,
    services: ServiceRegistry,
    versions: VersionRegistry,
}

impl Platform {
    /// Validate `config` and build the platform. Default regions are
    /// de-duplicated keeping first occurrence.
    pub fn new(config: PlatformConfig, tuning: PipelineTuning) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut seen = HashSet::new();
        let default_regions = config
            .default_regions
            .into_iter()
            .filter(|r| seen.insert(r.clone()))
            .collect();

        Ok(Self {
            name: config.name,
            default_accounts: config.default_accounts,
            resources: config.resources.into_iter().map(Arc::new).collect(),
            default_regions,
            limiter: RegionLimiter::new(tuning.max_requests_per_region),
            services: ServiceRegistry::new(config.services),
            versions: VersionRegistry::new(),
            tuning,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_accounts(&self) -> &[CloudAccount] {
        &self.default_accounts
    }

    pub fn default_regions(&self) -> &[String] {
        &self.default_regions
    }

    pub fn resources(&self) -> &[Arc<Resource>] {
        &self.resources
    }

    pub fn tuning(&self) -> &PipelineTuning {
        &self.tuning
    }

    pub fn limiter(&self) -> &RegionLimiter {
        &self.limiter
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn versions(&self) -> &VersionRegistry {
        &self.versions
    }

    /// Resource catalogue announced to the control plane
    pub fn support_resources(&self) -> Vec<SupportResource> {
        self.resources.iter().map(|r| r.support_entry()).collect()
    }

    /// Regions one resource is collected in for `account`
    pub fn loop_regions(&self, account: &CloudAccount, resource: &Resource) -> Vec<String> {
        if let Some(region) = account.pinned_region.as_ref().filter(|r| !r.is_empty()) {
            return vec![region.clone()];
        }
        resource.candidate_regions(&self.default_regions)
    }

    /// Collect `accounts` one after another, then clear the per-cycle caches
    pub async fn collect(self: &Arc<Self>, accounts: Vec<CloudAccount>, run: &CollectRun) -> Vec<AccountReport> {
        let started = Instant::now();
        let mut reports = Vec::with_capacity(accounts.len());

        for account in accounts {
            if run.shutdown.is_cancelled() {
                tracing::info!("Shutdown requested, skipping remaining accounts");
                break;
            }
            let account_started = Instant::now();
            let account_id = account.cloud_account_id.clone();
            reports.push(self.clone().handle_account(account, run.clone()).await);
            tracing::info!(
                platform = %self.name,
                account_id = %account_id,
                elapsed_ms = account_started.elapsed().as_millis() as u64,
                "Account run finished"
            );
        }

        self.versions.clear();
        self.services.clear();
        tracing::info!(
            platform = %self.name,
            accounts = reports.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Platform run finished"
        );
        reports
    }
}

/// Runs queued accounts through a platform's pipeline
#[derive(Clone)]
pub struct PlatformProcessor {
    platform: Arc<Platform>,
    run: CollectRun,
}

impl PlatformProcessor {
    pub fn new(platform: Arc<Platform>, run: CollectRun) -> Self {
        Self { platform, run }
    }
}

#[async_trait]
impl AccountProcessor for PlatformProcessor {
    async fn process_account(&self, account: CloudAccount) {
        let run = self.run.for_session().await;
        self.platform.clone().handle_account(account, run).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Collector, Dimension};
    use anyhow::Result;
    use std::any::Any;

    struct NoopServices;

    #[async_trait]
    impl CloudServices for NoopServices {
        async fn init_services(&mut self, _param: &crate::account::CloudAccountParam) -> Result<()> {
            Ok(())
        }

        fn clone_services(&self) -> Box<dyn CloudServices> {
            Box::new(NoopServices)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn config(name: &str, resources: Vec<Resource>, regions: &[&str]) -> PlatformConfig {
        PlatformConfig {
            name: name.to_string(),
            default_accounts: Vec::new(),
            resources,
            default_regions: regions.iter().map(|r| r.to_string()).collect(),
            services: Box::new(NoopServices),
        }
    }

    fn resource(resource_type: &str) -> Resource {
        Resource::new(resource_type, Collector::detail(|_, _, _| async { Ok(()) }))
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            config("", vec![resource("A")], &["r"]).validate(),
            Err(ConfigError::EmptyPlatformName)
        ));
        assert!(matches!(
            config("P", vec![], &["r"]).validate(),
            Err(ConfigError::NoResources(_))
        ));
        assert!(matches!(
            config("P", vec![resource("A")], &[]).validate(),
            Err(ConfigError::NoDefaultRegions(_))
        ));
        assert!(config("P", vec![resource("A")], &["r"]).validate().is_ok());
    }

    #[test]
    fn test_default_regions_deduplicated() {
        let platform = Platform::new(
            config("P", vec![resource("A")], &["b", "a", "b", "c", "a"]),
            PipelineTuning::default(),
        )
        .unwrap();
        assert_eq!(platform.default_regions(), &["b", "a", "c"]);
    }

    #[test]
    fn test_loop_regions_pinned_account() {
        let platform = Platform::new(
            config("P", vec![resource("A")], &["r1", "r2"]),
            PipelineTuning::default(),
        )
        .unwrap();
        let resource = platform.resources()[0].clone();

        let mut account = CloudAccount::new("acc", "P");
        assert_eq!(platform.loop_regions(&account, &resource), vec!["r1", "r2"]);

        account.pinned_region = Some("private-1".into());
        assert_eq!(platform.loop_regions(&account, &resource), vec!["private-1"]);

        account.pinned_region = Some(String::new());
        assert_eq!(platform.loop_regions(&account, &resource).len(), 2);
    }

    #[test]
    fn test_support_resources() {
        let platform = Platform::new(
            config(
                "P",
                vec![
                    resource("A").with_names("Alpha", "NET"),
                    resource("B").with_dimension(Dimension::Global),
                ],
                &["r"],
            ),
            PipelineTuning::default(),
        )
        .unwrap();

        let entries = platform.support_resources();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].resource_type_name, "Alpha");
        assert_eq!(entries[1].resource_type, "B");
    }

    #[tokio::test]
    async fn test_run_drops_client_without_session() {
        let plane = Arc::new(crate::control::InMemoryControlPlane::new());
        let client: Arc<dyn ControlPlane> = plane.clone();
        let run = CollectRun::new(Some(client), OperationalLogger::default());

        assert!(!run.for_session().await.registered());
        plane.register().await.unwrap();
        assert!(run.for_session().await.registered());
        assert!(!CollectRun::new(None, OperationalLogger::default())
            .for_session()
            .await
            .registered());
    }
}

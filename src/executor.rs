//! Executor
//!
//! Top-level lifecycle of one platform: registration with the control
//! plane, account loading, and either a single collection pass or the
//! continuous loop that keeps the account queue topped up.

use crate::account::CloudAccount;
use crate::control::{format_control_plane_error, ControlPlane};
use crate::error::ConfigError;
use crate::oplog::OperationalLogger;
use crate::platform::pipeline::panic_message;
use crate::platform::{AccountReport, CollectRun, Platform, PlatformProcessor};
use crate::queue::AccountQueue;
use anyhow::{Context, Result};
use chrono::Local;
use cron::Schedule;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CRON: &str = "0 0 */1 * * *";
pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_CONCURRENT_ACCOUNTS: usize = 4;
pub const MAX_CONCURRENT_ACCOUNTS: usize = 8;
pub const DEFAULT_ACCOUNT_QUEUE_SIZE: usize = 8;
/// Consecutive failed re-registrations tolerated by the continuous loop
pub const DEFAULT_MAX_RENEWAL_FAILURES: u32 = 10;

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub run_only_once: bool,
    /// Cron expression with a leading seconds field
    pub cron: String,
    /// Accounts collected concurrently
    pub cloud_account_max_concurrent: usize,
    pub account_queue_size: usize,
    pub refill_interval: Duration,
    pub max_renewal_failures: u32,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            run_only_once: true,
            cron: DEFAULT_CRON.to_string(),
            cloud_account_max_concurrent: DEFAULT_MAX_CONCURRENT_ACCOUNTS,
            account_queue_size: DEFAULT_ACCOUNT_QUEUE_SIZE,
            refill_interval: DEFAULT_REFILL_INTERVAL,
            max_renewal_failures: DEFAULT_MAX_RENEWAL_FAILURES,
        }
    }
}

pub fn parse_cron(expr: &str) -> Result<Schedule, ConfigError> {
    Schedule::from_str(expr).map_err(|e| ConfigError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Time until the next firing of `schedule`
fn until_next(schedule: &Schedule) -> Duration {
    schedule
        .upcoming(Local)
        .next()
        .and_then(|at| (at - Local::now()).to_std().ok())
        .unwrap_or(Duration::from_secs(1))
}

/// Lets only one scheduled job run at a time
#[derive(Debug, Default)]
pub struct JobStatus {
    running: AtomicBool,
}

pub struct JobGuard(Arc<JobStatus>);

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

impl JobStatus {
    /// Claim the job; `None` while a previous run still holds it
    pub fn try_begin(self: &Arc<Self>) -> Option<JobGuard> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| JobGuard(self.clone()))
    }
}

/// Announce the resource catalogue; failures are only logged
async fn announce_resources(platform: &Platform, client: &dyn ControlPlane) {
    if let Err(e) = client
        .send_supported_resources(platform.support_resources())
        .await
    {
        tracing::warn!(
            platform = %platform.name(),
            "Failed to send supported resource types: {}",
            format_control_plane_error(&e)
        );
    }
}

/// Server accounts (when registered) followed by the platform defaults
async fn load_accounts(
    platform: &Platform,
    client: Option<&Arc<dyn ControlPlane>>,
    free_count: Option<usize>,
) -> Vec<CloudAccount> {
    let mut accounts = Vec::new();
    if let Some(client) = client {
        announce_resources(platform, client.as_ref()).await;
        match client.list_accounts(&[], free_count).await {
            Ok(list) => accounts = list,
            Err(e) => tracing::error!(
                platform = %platform.name(),
                "Failed to load accounts from server: {}",
                format_control_plane_error(&e)
            ),
        }
    }
    accounts.extend(platform.default_accounts().iter().cloned());
    accounts
}

/// Feeds the account queue of a continuous run
#[derive(Clone)]
struct Refill {
    platform: Arc<Platform>,
    client: Option<Arc<dyn ControlPlane>>,
    queue: Arc<AccountQueue<PlatformProcessor>>,
    job: Arc<JobStatus>,
}

impl Refill {
    /// The client while its session is live
    async fn session(&self) -> Option<&Arc<dyn ControlPlane>> {
        let client = self.client.as_ref()?;
        client.is_registered().await.then_some(client)
    }

    /// Scheduled refill: admit as many regular accounts as fit
    async fn scheduled(&self) {
        let Some(_guard) = self.job.try_begin() else {
            tracing::warn!("Previous job is still running, skipping this execution");
            return;
        };

        let free = self.queue.available_slots();
        if free == 0 {
            tracing::debug!(platform = %self.platform.name(), "Account queue is full, skipping refill");
            return;
        }

        let accounts = load_accounts(&self.platform, self.session().await, Some(free)).await;
        let offered = accounts.len();
        let added = self.queue.add_accounts(accounts);
        let started = self.queue.fill_workers();
        tracing::info!(
            platform = %self.platform.name(),
            offered,
            added,
            started,
            "Account queue refilled"
        );
    }

    /// Ticker refill: accounts named by pending tasks jump the queue
    async fn admit_tasks(&self) {
        if let Some(client) = self.session().await {
            if self.queue.available_slots() > 0 {
                self.admit_task_accounts(client.as_ref()).await;
            }
        }
        self.queue.fill_workers();
    }

    async fn admit_task_accounts(&self, client: &dyn ControlPlane) {
        let tasks = match client.list_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!("Failed to list collector tasks: {}", format_control_plane_error(&e));
                return;
            }
        };
        if tasks.is_empty() {
            return;
        }

        let task_ids: Vec<i64> = tasks.iter().map(|t| t.task_id).collect();
        match client.list_accounts(&task_ids, None).await {
            Ok(accounts) => {
                let added = self.queue.add_priority_accounts(accounts);
                tracing::info!(
                    platform = %self.platform.name(),
                    tasks = task_ids.len(),
                    added,
                    "Admitted task accounts"
                );
            }
            Err(e) => tracing::warn!(
                "Failed to load task accounts: {}",
                format_control_plane_error(&e)
            ),
        }
    }
}

pub struct Executor {
    platform: Arc<Platform>,
    client: Option<Arc<dyn ControlPlane>>,
    oplog: OperationalLogger,
    options: ExecutorOptions,
    shutdown: CancellationToken,
}

impl Executor {
    /// `client == None` runs the agent unregistered
    pub fn new(
        platform: Arc<Platform>,
        client: Option<Arc<dyn ControlPlane>>,
        oplog: OperationalLogger,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            platform,
            client,
            oplog,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Register with the control plane. Returns the client to collect with,
    /// or `None` to fall back to the default accounts.
    pub async fn register(&self) -> Option<Arc<dyn ControlPlane>> {
        let client = self.client.as_ref()?;
        if client.is_registered().await {
            return Some(client.clone());
        }
        match client.register().await {
            Ok(()) => Some(client.clone()),
            Err(e) => {
                tracing::warn!(
                    platform = %self.platform.name(),
                    "Registration failed, collecting default accounts only: {}",
                    format_control_plane_error(&e)
                );
                None
            }
        }
    }

    pub async fn run(&self) -> Result<()> {
        if self.options.run_only_once {
            self.run_once().await.map(|_| ())
        } else {
            self.run_continuous().await
        }
    }

    /// Load every account and collect them one after another
    pub async fn run_once(&self) -> Result<Vec<AccountReport>> {
        let client = self.register().await;
        let accounts = load_accounts(&self.platform, client.as_ref(), None).await;
        tracing::info!(
            platform = %self.platform.name(),
            accounts = accounts.len(),
            registered = client.is_some(),
            "Starting collection"
        );

        let run = CollectRun::new(client, self.oplog.clone()).with_shutdown(self.shutdown.clone());
        let reports = self.platform.collect(accounts, &run).await;
        tracing::info!(platform = %self.platform.name(), "Run once done");
        Ok(reports)
    }

    /// Queue-driven loop: a cron schedule refills the account queue and a
    /// ticker admits task accounts. Runs until shutdown, or fails once
    /// re-registration keeps failing.
    pub async fn run_continuous(&self) -> Result<()> {
        let schedule = parse_cron(&self.options.cron)?;
        let registered = self.register().await.is_some();
        // A failed start-up registration counts toward the renewal limit
        let mut renewal_failures = u32::from(self.client.is_some() && !registered);

        // Cancelled on shutdown or on a fatal session loss
        let stop = self.shutdown.child_token();
        let run = CollectRun::new(self.client.clone(), self.oplog.clone()).with_shutdown(stop.clone());
        let processor = Arc::new(PlatformProcessor::new(self.platform.clone(), run));
        let queue = Arc::new(AccountQueue::new(
            self.options.account_queue_size,
            self.options.cloud_account_max_concurrent,
            processor,
        ));
        queue.start();

        let refill = Refill {
            platform: self.platform.clone(),
            client: self.client.clone(),
            queue: queue.clone(),
            job: Arc::new(JobStatus::default()),
        };

        let mut jobs = JoinSet::new();
        let initial = refill.clone();
        jobs.spawn(async move { initial.scheduled().await });

        let mut ticker = tokio::time::interval(self.options.refill_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        tracing::info!(
            platform = %self.platform.name(),
            cron = %self.options.cron,
            registered,
            "Resource collect agent started"
        );

        let result = loop {
            let next_job = tokio::time::sleep(until_next(&schedule));
            tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    if let Some(client) = &self.client {
                        if !client.is_registered().await {
                            match client.register().await {
                                Ok(()) => {
                                    tracing::info!(
                                        platform = %self.platform.name(),
                                        after = renewal_failures,
                                        "Session renewed"
                                    );
                                    renewal_failures = 0;
                                    // Accounts missed while the session was down
                                    let job = refill.clone();
                                    jobs.spawn(async move { job.scheduled().await });
                                }
                                Err(e) => {
                                    renewal_failures += 1;
                                    tracing::error!(
                                        platform = %self.platform.name(),
                                        attempt = renewal_failures,
                                        "Session renewal failed: {}",
                                        format_control_plane_error(&e)
                                    );
                                    if renewal_failures >= self.options.max_renewal_failures {
                                        let message = format!(
                                            "Session renewal failed {} times for platform {}",
                                            renewal_failures,
                                            self.platform.name()
                                        );
                                        self.oplog.log_system_error(&message);
                                        break Err(anyhow::anyhow!(message));
                                    }
                                    continue;
                                }
                            }
                        }
                    }
                    refill.admit_tasks().await;
                }
                _ = next_job => {
                    let job = refill.clone();
                    jobs.spawn(async move { job.scheduled().await });
                }
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            let message = format!(
                                "Refill job panicked for platform {}: {}",
                                self.platform.name(),
                                panic_message(e.into_panic().as_ref())
                            );
                            self.oplog.log_system_error(&message);
                        }
                    }
                }
            }
        };

        stop.cancel();
        jobs.shutdown().await;
        queue.shutdown().await;
        tracing::info!(platform = %self.platform.name(), "Resource collect agent stopped");
        result
    }
}

/// Run several executors side by side. Every failure is logged and
/// returned; one executor failing does not stop the others.
pub async fn run_executors(executors: Vec<Executor>) -> Vec<anyhow::Error> {
    let mut set = JoinSet::new();
    for executor in executors {
        set.spawn(async move {
            let name = executor.platform.name().to_string();
            executor
                .run()
                .await
                .with_context(|| format!("Executor for platform {} failed", name))
        });
    }

    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        let err = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(e) if e.is_panic() => {
                anyhow::anyhow!("panic occurred: {}", panic_message(e.into_panic().as_ref()))
            }
            Err(e) => anyhow::Error::new(e),
        };
        tracing::error!("{:#}", err);
        errors.push(err);
    }
    errors
}

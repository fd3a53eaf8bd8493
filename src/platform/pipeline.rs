//! Collection pipeline
//!
//! ```text
//! account ──┬── resource ──┬── region: producer ─raw─▶ consumer ─records─▶ submitter
//!           │              └── region: ...
//!           └── resource ...
//! ```
//!
//! Each account launches one pipeline per resource (staggered), each
//! resource one pass per candidate region (staggered, run concurrently).
//! A region pass runs the collector under a region limiter permit and a hard
//! deadline; its consumer projects raw items into records and closes the
//! raw channel when no data arrives within the idle timeout.

use super::submit::{BatchTarget, SubmitStats, Submitter};
use super::{CollectRun, Platform};
use crate::account::{CloudAccount, CollectRecordInfo};
use crate::error::CollectError;
use crate::oplog::ErrorCode;
use crate::resource::{project, CloudServices, CollectContext, Collector, Resource, ResourceInstance, ResultSender};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::Instrument;

// ===== Reports =====

/// How a region pass ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionStatus {
    Completed,
    /// Provider services could not be initialized; the region was skipped
    InitFailed,
    /// The collector returned an error
    CollectorFailed,
    /// Idle timeout closed the channel under the collector, or the deadline hit
    TimedOut,
    /// The collector panicked
    Panicked,
    /// Agent shutdown interrupted the pass
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RegionReport {
    pub region: String,
    pub status: RegionStatus,
    /// Records handed to the submission stage
    pub records: usize,
    pub submit: SubmitStats,
    pub elapsed: Duration,
}

impl RegionReport {
    fn skipped(region: &str, status: RegionStatus) -> Self {
        Self {
            region: region.to_string(),
            status,
            records: 0,
            submit: SubmitStats::default(),
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceReport {
    pub resource_type: String,
    /// Excluded by the account's allow-list
    pub skipped: bool,
    pub regions: Vec<RegionReport>,
}

impl ResourceReport {
    pub fn records(&self) -> usize {
        self.regions.iter().map(|r| r.records).sum()
    }
}

#[derive(Debug, Clone)]
pub struct AccountReport {
    pub cloud_account_id: String,
    /// Gate decision
    pub collection_enabled: bool,
    pub resources: Vec<ResourceReport>,
}

impl AccountReport {
    pub fn records(&self) -> usize {
        self.resources.iter().map(|r| r.records()).sum()
    }

    pub fn resource(&self, resource_type: &str) -> Option<&ResourceReport> {
        self.resources.iter().find(|r| r.resource_type == resource_type)
    }
}

/// Outcome of driving a collector future
enum Driven {
    Returned(anyhow::Result<()>),
    Panicked(String),
    Deadline,
    Shutdown,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn is_channel_closed(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<CollectError>(),
        Some(CollectError::ChannelClosed(_))
    )
}

/// Unwrap a joined task, logging panics
fn joined<T: Default>(result: Result<T, JoinError>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) if e.is_panic() => {
            tracing::error!("{} panicked: {}", what, panic_message(e.into_panic().as_ref()));
            T::default()
        }
        Err(e) => {
            tracing::warn!("{} was cancelled: {}", what, e);
            T::default()
        }
    }
}

/// Purges the account's cached services and versions when dropped
struct AccountCleanup<'a> {
    platform: &'a Platform,
    account_id: String,
}

impl Drop for AccountCleanup<'_> {
    fn drop(&mut self) {
        let purged = self.platform.services.purge_account(&self.account_id);
        self.platform.versions.purge_account(&self.account_id);
        tracing::debug!(account_id = %self.account_id, purged, "Purged region services");
    }
}

// ===== Account =====

impl Platform {
    /// Collect every resource of one account, then send its finish signal
    pub async fn handle_account(self: Arc<Self>, account: CloudAccount, run: CollectRun) -> AccountReport {
        let span = tracing::info_span!(
            "account",
            platform = %self.name,
            account_id = %account.cloud_account_id,
            collect_record_id = account.collect_record_id
        );
        self.run_account(account, run).instrument(span).await
    }

    async fn run_account(self: Arc<Self>, mut account: CloudAccount, run: CollectRun) -> AccountReport {
        let _cleanup = AccountCleanup {
            platform: &self,
            account_id: account.cloud_account_id.clone(),
        };
        let started = Instant::now();

        let info = self.assess_gate(&account).await;
        if !info.enable_collection {
            tracing::info!("Collection disabled for this account, skipping");
            self.send_finish_signal(&account, &run).await;
            return AccountReport {
                cloud_account_id: account.cloud_account_id,
                collection_enabled: false,
                resources: Vec::new(),
            };
        }
        account.collect_record_info = info;

        let account = Arc::new(account);
        let mut pipelines = JoinSet::new();
        for (i, resource) in self.resources.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.tuning.resource_stagger).await;
            }
            pipelines.spawn(
                self.clone()
                    .handle_resource(account.clone(), resource.clone(), run.clone())
                    .in_current_span(),
            );
        }

        let mut resources = Vec::with_capacity(self.resources.len());
        while let Some(result) = pipelines.join_next().await {
            if let Some(report) = joined(result.map(Some), "resource pipeline") {
                resources.push(report);
            }
        }

        self.send_finish_signal(&account, &run).await;
        tracing::info!(
            resources = resources.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Account collection finished"
        );

        AccountReport {
            cloud_account_id: account.cloud_account_id.clone(),
            collection_enabled: true,
            resources,
        }
    }

    /// Account-level gate, bounded by the gate timeout. Init failures and
    /// timeouts fail open with the account's previous record info.
    async fn assess_gate(&self, account: &CloudAccount) -> CollectRecordInfo {
        let region = account
            .pinned_region
            .clone()
            .or_else(|| self.default_regions.first().cloned())
            .unwrap_or_default();
        let param = account.param_for(&region, "");

        let gate = async {
            let mut services = self.services.fresh();
            services.init_services(&param).await?;
            Ok::<_, anyhow::Error>(services.assess_collection_trigger(&param).await)
        };

        let fallback = || CollectRecordInfo {
            enable_collection: true,
            ..account.collect_record_info.clone()
        };

        match tokio::time::timeout(self.tuning.gate_timeout, gate).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                tracing::warn!("Gate check init failed, collecting anyway: {:#}", e);
                fallback()
            }
            Err(_) => {
                tracing::warn!(
                    "Gate check exceeded {:?}, collecting anyway",
                    self.tuning.gate_timeout
                );
                fallback()
            }
        }
    }

    async fn send_finish_signal(&self, account: &CloudAccount, run: &CollectRun) {
        let Some(client) = &run.client else {
            return;
        };

        let result = self
            .tuning
            .retry
            .run("send running finish signal", || {
                client.send_finish_signal(&account.cloud_account_id, account.task_id)
            })
            .await;

        match result {
            Ok(()) => tracing::info!("Sent running finish signal"),
            Err(e) => tracing::warn!("Failed to send running finish signal: {:#}", e),
        }
    }

    // ===== Resource =====

    /// Collect one resource type of one account across its regions
    pub async fn handle_resource(
        self: Arc<Self>,
        account: Arc<CloudAccount>,
        resource: Arc<Resource>,
        run: CollectRun,
    ) -> ResourceReport {
        let resource_type = resource.resource_type.clone();
        let account_id = account.cloud_account_id.clone();
        let mut report = ResourceReport {
            resource_type: resource_type.clone(),
            skipped: false,
            regions: Vec::new(),
        };

        if run.registered() && !account.allows(&resource_type) {
            let message = format!(
                "Code:[{}] Platform => [{}] ResourceType => [{}] will not be collected because the account [{}] is not configured",
                ErrorCode::Collector, self.name, resource_type, account_id
            );
            tracing::warn!("{}", message);
            run.oplog
                .log_account_error(&account.platform, &resource_type, &account_id, &message);
            report.skipped = true;
            return report;
        }

        let started = Instant::now();
        let regions = self.loop_regions(&account, &resource);
        let version = self
            .versions
            .version_for(&account.platform, &resource_type, &account_id);
        tracing::info!(
            resource_type = %resource_type,
            regions = ?regions,
            version = %version,
            "Collecting resource"
        );

        let mut passes = JoinSet::new();
        for (i, region) in regions.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.tuning.region_stagger).await;
            }

            let param = account.param_for(region, &resource_type);
            let services = match self.services.get_or_init(&param).await {
                Ok(services) => services,
                Err(e) => {
                    let message = format!(
                        "Code:[{}] Running CloudAccountId => [{}] Region => [{}] Platform => [{}] ResourceType => [{}] Init Client error: {:#}",
                        ErrorCode::Collector, account_id, region, self.name, resource_type, e
                    );
                    tracing::warn!("{}", message);
                    run.oplog
                        .log_account_error(&account.platform, &resource_type, &account_id, &message);
                    report
                        .regions
                        .push(RegionReport::skipped(region, RegionStatus::InitFailed));
                    continue;
                }
            };

            let span = tracing::info_span!("region", region = %region, resource_type = %resource_type);
            passes.spawn(
                self.clone()
                    .run_region(
                        account.clone(),
                        resource.clone(),
                        region.clone(),
                        version.clone(),
                        services,
                        run.clone(),
                    )
                    .instrument(span),
            );

            // Global resources are not region-partitioned
            if resource.is_global() {
                break;
            }
        }

        while let Some(result) = passes.join_next().await {
            if let Some(region) = joined(result.map(Some), "region pass") {
                report.regions.push(region);
            }
        }

        tracing::info!(
            resource_type = %resource_type,
            records = report.records(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Resource collection finished"
        );
        report
    }

    // ===== Region =====

    async fn run_region(
        self: Arc<Self>,
        account: Arc<CloudAccount>,
        resource: Arc<Resource>,
        region: String,
        version: String,
        services: Arc<dyn CloudServices>,
        run: CollectRun,
    ) -> RegionReport {
        let started = Instant::now();

        // The idle clock starts with the consumer, so take the region slot first
        let permit = match self.limiter.acquire(&region).await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::error!("{:#}", e);
                return RegionReport::skipped(&region, RegionStatus::Cancelled);
            }
        };

        let capacity = self.tuning.channel_capacity.max(1);
        let (raw_tx, raw_rx) = mpsc::channel::<Value>(capacity);
        let (record_tx, record_rx) = mpsc::channel::<ResourceInstance>(capacity);

        let submitter = Submitter::new(run.client.clone(), self.tuning.batch_size)
            .with_retry(self.tuning.retry);
        let target = BatchTarget::new(&self.name, &account.cloud_account_id, &resource, &version);
        let submit_task = tokio::spawn(
            async move { submitter.run(target, record_rx).await }.in_current_span(),
        );

        let consume_task = tokio::spawn(
            self.clone()
                .consume(
                    account.clone(),
                    resource.clone(),
                    region.clone(),
                    raw_rx,
                    record_tx,
                    run.clone(),
                )
                .in_current_span(),
        );

        let status = self
            .produce(&account, &resource, &region, &version, services, raw_tx, &run)
            .await;
        drop(permit);

        let records = joined(consume_task.await, "consumer");
        let submit = joined(submit_task.await, "submitter");

        let elapsed = started.elapsed();
        tracing::info!(
            status = ?status,
            records,
            elapsed_ms = elapsed.as_millis() as u64,
            "Region pass finished"
        );

        RegionReport {
            region,
            status,
            records,
            submit,
            elapsed,
        }
    }

    /// Run the collector under the hard deadline. The caller holds the
    /// region permit.
    #[allow(clippy::too_many_arguments)]
    async fn produce(
        &self,
        account: &CloudAccount,
        resource: &Resource,
        region: &str,
        version: &str,
        services: Arc<dyn CloudServices>,
        raw_tx: mpsc::Sender<Value>,
        run: &CollectRun,
    ) -> RegionStatus {
        let started = Instant::now();
        let deadline = self.tuning.collect_deadline;
        let token = run.shutdown.child_token();
        let ctx = CollectContext::new(
            &account.cloud_account_id,
            &account.platform,
            region,
            &resource.resource_type,
            version,
            token.clone(),
        );
        let sender = ResultSender::new(raw_tx, self.tuning.idle_timeout);

        let (driven, code) = match &resource.collector {
            Collector::Detail(f) => (
                drive(f(ctx, services, sender), deadline, run).await,
                ErrorCode::Collector,
            ),
            Collector::DetailWithCancel(f) => {
                let driven = drive(f(ctx, token.clone(), services, sender), deadline, run).await;
                if matches!(driven, Driven::Returned(_)) {
                    // Hold the region until the collector cancels or time runs out
                    let remaining = deadline.saturating_sub(started.elapsed());
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(remaining) => {}
                    }
                }
                (driven, ErrorCode::Sdk)
            }
        };
        token.cancel();

        let account_id = &account.cloud_account_id;
        let resource_type = &resource.resource_type;
        match driven {
            Driven::Returned(Ok(())) => RegionStatus::Completed,
            Driven::Returned(Err(e)) if is_channel_closed(&e) => {
                tracing::warn!(
                    "Timeout, more than {:?} without data !!! CloudAccountId => [{}] Platform => [{}] Region => [{}] ResourceType => [{}]",
                    self.tuning.idle_timeout, account_id, self.name, region, resource_type
                );
                RegionStatus::TimedOut
            }
            Driven::Returned(Err(e)) => {
                let message = format!(
                    "Code:[{}], CloudAccountId => [{}] Platform => [{}] Region => [{}] ResourceType => [{}] ERROR {:#}",
                    code, account_id, self.name, region, resource_type, e
                );
                tracing::warn!("{}", message);
                run.oplog
                    .log_account_error(&account.platform, resource_type, account_id, &message);
                RegionStatus::CollectorFailed
            }
            Driven::Panicked(payload) => {
                let message = format!(
                    "Code:[{}], CloudAccountId => [{}] Platform => [{}] Region => [{}] ResourceType => [{}] Recovered from panic: {}",
                    ErrorCode::Unknown, account_id, self.name, region, resource_type, payload
                );
                tracing::error!("{}", message);
                run.oplog
                    .log_account_error(&account.platform, resource_type, account_id, &message);
                RegionStatus::Panicked
            }
            Driven::Deadline => {
                tracing::warn!(
                    "{} !!! CloudAccountId => [{}] Platform => [{}] Region => [{}] ResourceType => [{}]",
                    CollectError::Deadline(deadline), account_id, self.name, region, resource_type
                );
                RegionStatus::TimedOut
            }
            Driven::Shutdown => RegionStatus::Cancelled,
        }
    }

    /// Project raw items into records until the channel ends or goes idle.
    /// Returns the number of records forwarded.
    async fn consume(
        self: Arc<Self>,
        account: Arc<CloudAccount>,
        resource: Arc<Resource>,
        region: String,
        mut raw_rx: mpsc::Receiver<Value>,
        record_tx: mpsc::Sender<ResourceInstance>,
        run: CollectRun,
    ) -> usize {
        let idle = self.tuning.idle_timeout;
        let console = !run.registered();
        let mut forwarded = 0;

        loop {
            let item = match tokio::time::timeout(idle, raw_rx.recv()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!("No new data for {:?}, closing result channel", idle);
                    // Idempotent; buffered items still drain below
                    raw_rx.close();
                    continue;
                }
            };

            if console {
                match serde_json::to_string_pretty(&item) {
                    Ok(pretty) => println!("{}", pretty),
                    Err(e) => tracing::error!("Failed to format JSON: {}", e),
                }
            }

            let record = match project(
                item,
                &resource.row_field,
                resource.dimension,
                &account.cloud_account_id,
                &region,
            ) {
                Ok(record) => record,
                Err(e) => {
                    let message = format!(
                        "Code:[{}] {} The data will not be submitted to the server Platform => [{}] ResourceType => [{}]",
                        ErrorCode::Collector, e, self.name, resource.resource_type
                    );
                    tracing::warn!("{}", message);
                    run.oplog.log_account_error(
                        &account.platform,
                        &resource.resource_type,
                        &account.cloud_account_id,
                        &message,
                    );
                    continue;
                }
            };

            if record_tx.send(record).await.is_err() {
                tracing::warn!("Submission stage gone, dropping remaining items");
                break;
            }
            forwarded += 1;
        }

        forwarded
    }
}

/// Drive a collector future to completion, deadline or shutdown, containing panics
async fn drive(
    fut: crate::resource::collector::CollectFuture,
    deadline: Duration,
    run: &CollectRun,
) -> Driven {
    tokio::select! {
        result = AssertUnwindSafe(fut).catch_unwind() => match result {
            Ok(result) => Driven::Returned(result),
            Err(payload) => Driven::Panicked(panic_message(payload.as_ref())),
        },
        _ = tokio::time::sleep(deadline) => Driven::Deadline,
        _ = run.shutdown.cancelled() => Driven::Shutdown,
    }
}

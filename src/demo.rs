//! Demo platform
//!
//! A self-contained platform whose collectors synthesize records instead of
//! calling a vendor SDK. It exercises every path of the engine: regular and
//! global resources, slow producers, self-cancelling streams, collector
//! errors, panics and services that fail to initialize.

use crate::account::{CloudAccount, CloudAccountParam, CollectRecordInfo};
use crate::platform::PlatformConfig;
use crate::resource::{
    downcast_services, CloudServices, CollectContext, Collector, Dimension, Resource, ResultSender,
    RowField,
};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PLATFORM: &str = "DEMO_CLOUD";
pub const DEFAULT_ACCOUNT: &str = "demo-account";

/// Region where services never initialize
pub const OFFLINE_REGION: &str = "demo-offline";

/// Region where the quota collector panics
pub const UNSTABLE_REGION: &str = "demo-west-1";

pub const DEFAULT_REGIONS: &[&str] = &["demo-east-1", UNSTABLE_REGION, OFFLINE_REGION];

/// Delay between items of the slow snapshot collector
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(2);

/// Items emitted by the event stream before it cancels itself
const EVENT_LIMIT: usize = 5;

/// Stand-in for a vendor SDK client set
#[derive(Debug, Clone, Default)]
pub struct DemoServices {
    pub account_id: String,
    pub region: String,
    pub endpoint: String,
}

#[async_trait]
impl CloudServices for DemoServices {
    async fn init_services(&mut self, param: &CloudAccountParam) -> Result<()> {
        if param.region == OFFLINE_REGION {
            anyhow::bail!("endpoint for region {} is unreachable", param.region);
        }
        self.account_id = param.cloud_account_id.clone();
        self.region = param.region.clone();
        self.endpoint = format!(
            "https://{}.{}.demo.cloudrec.local",
            param.resource_type.to_lowercase(),
            param.region
        );
        Ok(())
    }

    fn clone_services(&self) -> Box<dyn CloudServices> {
        Box::new(DemoServices::default())
    }

    /// Accounts whose credentials carry `"collect": false` are skipped
    async fn assess_collection_trigger(&self, param: &CloudAccountParam) -> CollectRecordInfo {
        let mut info = CollectRecordInfo::following(param);
        info.enable_collection = param
            .credentials
            .get("collect")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        info
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DemoInstance {
    instance_id: String,
    instance_name: String,
    public_ip: String,
    region_id: String,
    status: &'static str,
}

async fn list_instances(
    _ctx: CollectContext,
    services: Arc<dyn CloudServices>,
    tx: ResultSender,
) -> Result<()> {
    let services = downcast_services::<DemoServices>(services.as_ref())?;
    for i in 0..3 {
        let instance = DemoInstance {
            instance_id: format!("i-{}-{:03}", services.region, i),
            instance_name: format!("{}-web-{}", services.account_id, i),
            public_ip: format!("203.0.113.{}", 10 + i),
            region_id: services.region.clone(),
            status: "Running",
        };
        tx.send(&instance).await?;
    }
    Ok(())
}

async fn list_buckets(
    _ctx: CollectContext,
    services: Arc<dyn CloudServices>,
    tx: ResultSender,
) -> Result<()> {
    let services = downcast_services::<DemoServices>(services.as_ref())?;
    for name in ["logs", "backups"] {
        tx.send_value(json!({
            "Bucket": { "Name": format!("{}-{}", services.account_id, name) },
            "Endpoint": services.endpoint,
        }))
        .await?;
    }
    Ok(())
}

/// Slow but progressing producer
async fn list_snapshots(
    ctx: CollectContext,
    services: Arc<dyn CloudServices>,
    tx: ResultSender,
) -> Result<()> {
    let services = downcast_services::<DemoServices>(services.as_ref())?;
    for i in 0..3 {
        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            _ = tokio::time::sleep(SNAPSHOT_INTERVAL) => {}
        }
        tx.send_value(json!({
            "SnapshotId": format!("s-{}-{}", services.region, i),
            "SizeGiB": 20 * (i + 1),
        }))
        .await?;
    }
    Ok(())
}

/// Emits a fixed number of events, then ends its own pipeline
async fn stream_events(
    ctx: CollectContext,
    cancel: CancellationToken,
    _services: Arc<dyn CloudServices>,
    tx: ResultSender,
) -> Result<()> {
    for i in 0..EVENT_LIMIT {
        tx.send_value(json!({
            "EventId": format!("evt-{}-{}", ctx.region, i),
            "Source": "demo.audit",
        }))
        .await?;
    }
    cancel.cancel();
    Ok(())
}

async fn list_access_keys(
    ctx: CollectContext,
    _services: Arc<dyn CloudServices>,
    _tx: ResultSender,
) -> Result<()> {
    anyhow::bail!(
        "AccessDenied: account {} is not authorized to perform ListAccessKeys",
        ctx.cloud_account_id
    )
}

async fn describe_quotas(
    ctx: CollectContext,
    _services: Arc<dyn CloudServices>,
    tx: ResultSender,
) -> Result<()> {
    if ctx.region == UNSTABLE_REGION {
        panic!("quota service returned a malformed page in {}", ctx.region);
    }
    tx.send_value(json!({ "QuotaName": "instances", "Limit": 50 }))
        .await?;
    Ok(())
}

pub fn resources() -> Vec<Resource> {
    vec![
        Resource::new("DEMO_INSTANCE", Collector::detail(list_instances))
            .with_names("Demo Instance", "COMPUTE")
            .with_desc("https://docs.cloudrec.local/demo/instance")
            .with_row_field(RowField::new("$.InstanceId", "$.InstanceName", "$.PublicIp")),
        Resource::new("DEMO_BUCKET", Collector::detail(list_buckets))
            .with_names("Demo Bucket", "STORE")
            .with_row_field(RowField::new("$.Bucket.Name", "$.Bucket.Name", "$.Endpoint"))
            .with_dimension(Dimension::Global),
        Resource::new("DEMO_SNAPSHOT", Collector::detail(list_snapshots))
            .with_names("Demo Snapshot", "STORE")
            .with_row_field(RowField::new("$.SnapshotId", "$.SnapshotId", ""))
            .with_excluded_regions(&[OFFLINE_REGION]),
        Resource::new("DEMO_EVENT", Collector::detail_with_cancel(stream_events))
            .with_names("Demo Audit Event", "SECURITY")
            .with_row_field(RowField::new("$.EventId", "$.Source", ""))
            .with_regions(&["demo-east-1"]),
        Resource::new("DEMO_ACCESS_KEY", Collector::detail(list_access_keys))
            .with_names("Demo Access Key", "IDENTITY")
            .with_row_field(RowField::new("$.AccessKeyId", "$.UserName", ""))
            .with_dimension(Dimension::Global),
        Resource::new("DEMO_QUOTA", Collector::detail(describe_quotas))
            .with_names("Demo Quota", "COMPUTE")
            .with_row_field(RowField::new("$.QuotaName", "$.QuotaName", ""))
            .with_excluded_regions(&[OFFLINE_REGION]),
    ]
}

/// Demo platform collecting `default_accounts` plus whatever the control
/// plane hands out
pub fn platform_config(default_accounts: Vec<CloudAccount>) -> PlatformConfig {
    PlatformConfig {
        name: PLATFORM.to_string(),
        default_accounts,
        resources: resources(),
        default_regions: DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect(),
        services: Box::new(DemoServices::default()),
    }
}

pub fn default_account() -> CloudAccount {
    CloudAccount::new(DEFAULT_ACCOUNT, PLATFORM)
}

//! Provider services contract
//!
//! Implemented once per cloud vendor. The engine clones a fresh instance per
//! `(region, resource type, account)`, initializes its SDK clients, and
//! hands it to collectors, which downcast it back to the concrete type.

use crate::account::{CloudAccountParam, CollectRecordInfo};
use anyhow::Result;
use async_trait::async_trait;
use std::any::Any;

#[async_trait]
pub trait CloudServices: Any + Send + Sync {
    /// Set up the SDK clients needed for `param.resource_type` in
    /// `param.region`. Errors skip the region, never the account.
    async fn init_services(&mut self, param: &CloudAccountParam) -> Result<()>;

    /// Fresh, independently configurable instance
    fn clone_services(&self) -> Box<dyn CloudServices>;

    /// Account-level gate run before any resource is collected. Must be
    /// read-only towards the provider and return in bounded time.
    async fn assess_collection_trigger(&self, param: &CloudAccountParam) -> CollectRecordInfo {
        CollectRecordInfo::following(param)
    }

    fn as_any(&self) -> &dyn Any;
}

/// Downcast a services handle to the vendor's concrete type
pub fn downcast_services<T: CloudServices>(services: &dyn CloudServices) -> Result<&T> {
    services.as_any().downcast_ref::<T>().ok_or_else(|| {
        anyhow::anyhow!(
            "services is not a {}",
            std::any::type_name::<T>()
        )
    })
}

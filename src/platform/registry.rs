//! Platform-owned registries
//!
//! [`ServiceRegistry`] caches initialized provider services per
//! `(region, resource type, account)`; [`VersionRegistry`] holds the version
//! tag of each `(platform, resource type, account)` collection. Both belong
//! to a single [`Platform`](super::Platform) so independent platforms never
//! share state.

use crate::account::CloudAccountParam;
use crate::resource::CloudServices;
use anyhow::Result;
use chrono::Local;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Cache key of a region-scoped services instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub region: String,
    pub resource_type: String,
    pub account_id: String,
}

impl ServiceKey {
    pub fn new(region: &str, resource_type: &str, account_id: &str) -> Self {
        Self {
            region: region.to_string(),
            resource_type: resource_type.to_string(),
            account_id: account_id.to_string(),
        }
    }

    pub fn for_param(param: &CloudAccountParam) -> Self {
        Self::new(&param.region, &param.resource_type, &param.cloud_account_id)
    }
}

#[derive(Default)]
struct ServiceEntries {
    services: HashMap<ServiceKey, Arc<dyn CloudServices>>,
    /// account id -> keys owned by that account
    by_account: HashMap<String, HashSet<ServiceKey>>,
}

/// Region-scoped services cache with an account index
pub struct ServiceRegistry {
    prototype: Box<dyn CloudServices>,
    entries: Mutex<ServiceEntries>,
}

impl ServiceRegistry {
    pub fn new(prototype: Box<dyn CloudServices>) -> Self {
        Self {
            prototype,
            entries: Mutex::new(ServiceEntries::default()),
        }
    }

    /// Cached services for `param`, or a fresh clone initialized for it.
    /// Only successfully initialized instances are cached.
    pub async fn get_or_init(&self, param: &CloudAccountParam) -> Result<Arc<dyn CloudServices>> {
        let key = ServiceKey::for_param(param);
        let cached = self.entries.lock().services.get(&key).cloned();
        if let Some(services) = cached {
            return Ok(services);
        }

        let mut services = self.prototype.clone_services();
        services.init_services(param).await?;
        let services: Arc<dyn CloudServices> = Arc::from(services);

        let mut entries = self.entries.lock();
        entries
            .by_account
            .entry(key.account_id.clone())
            .or_default()
            .insert(key.clone());
        let cached = entries.services.entry(key).or_insert(services);
        Ok(cached.clone())
    }

    /// Drop every instance owned by `account_id`, returning how many
    pub fn purge_account(&self, account_id: &str) -> usize {
        let mut entries = self.entries.lock();
        let Some(keys) = entries.by_account.remove(account_id) else {
            return 0;
        };
        for key in &keys {
            entries.services.remove(key);
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.services.clear();
        entries.by_account.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Uncached clone of the prototype
    pub fn fresh(&self) -> Box<dyn CloudServices> {
        self.prototype.clone_services()
    }
}

/// Version tag format, second resolution
const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

/// Version tags per `(platform, resource type, account)`
#[derive(Debug, Default)]
pub struct VersionRegistry {
    versions: Mutex<HashMap<(String, String, String), String>>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version of the current collection, created on first use
    pub fn version_for(&self, platform: &str, resource_type: &str, account_id: &str) -> String {
        let key = (
            platform.to_string(),
            resource_type.to_string(),
            account_id.to_string(),
        );
        self.versions
            .lock()
            .entry(key)
            .or_insert_with(|| Local::now().format(VERSION_FORMAT).to_string())
            .clone()
    }

    /// Drop the versions of one account's collections
    pub fn purge_account(&self, account_id: &str) {
        self.versions.lock().retain(|(_, _, owner), _| owner != account_id);
    }

    pub fn clear(&self) {
        self.versions.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.versions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::CloudAccount;
    use async_trait::async_trait;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingServices {
        inits: Arc<AtomicUsize>,
        fail_region: Option<String>,
    }

    #[async_trait]
    impl CloudServices for CountingServices {
        async fn init_services(&mut self, param: &CloudAccountParam) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_region.as_deref() == Some(param.region.as_str()) {
                anyhow::bail!("no endpoint for {}", param.region);
            }
            Ok(())
        }

        fn clone_services(&self) -> Box<dyn CloudServices> {
            Box::new(CountingServices {
                inits: self.inits.clone(),
                fail_region: self.fail_region.clone(),
            })
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn registry(fail_region: Option<&str>) -> (ServiceRegistry, Arc<AtomicUsize>) {
        let inits = Arc::new(AtomicUsize::new(0));
        let prototype = CountingServices {
            inits: inits.clone(),
            fail_region: fail_region.map(str::to_string),
        };
        (ServiceRegistry::new(Box::new(prototype)), inits)
    }

    #[tokio::test]
    async fn test_cached_per_key() {
        let (registry, inits) = registry(None);
        let account = CloudAccount::new("acc-1", "AWS");

        registry.get_or_init(&account.param_for("r1", "EC2")).await.unwrap();
        registry.get_or_init(&account.param_for("r1", "EC2")).await.unwrap();
        registry.get_or_init(&account.param_for("r2", "EC2")).await.unwrap();
        registry.get_or_init(&account.param_for("r1", "S3")).await.unwrap();

        assert_eq!(inits.load(Ordering::SeqCst), 3);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_init_not_cached() {
        let (registry, inits) = registry(Some("bad"));
        let param = CloudAccount::new("acc-1", "AWS").param_for("bad", "EC2");

        assert!(registry.get_or_init(&param).await.is_err());
        assert!(registry.get_or_init(&param).await.is_err());
        assert_eq!(inits.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_purge_account_is_exact() {
        let (registry, _) = registry(None);
        // "acc-1" is a substring of "acc-10"; only exact owners are purged
        let a = CloudAccount::new("acc-1", "AWS");
        let b = CloudAccount::new("acc-10", "AWS");
        registry.get_or_init(&a.param_for("r1", "EC2")).await.unwrap();
        registry.get_or_init(&a.param_for("r2", "EC2")).await.unwrap();
        registry.get_or_init(&b.param_for("r1", "EC2")).await.unwrap();

        assert_eq!(registry.purge_account("acc-1"), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.purge_account("acc-1"), 0);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_version_stable_until_clear() {
        let versions = VersionRegistry::new();
        let v1 = versions.version_for("AWS", "EC2", "acc");
        let v2 = versions.version_for("AWS", "EC2", "acc");
        assert_eq!(v1, v2);
        assert_eq!(v1.len(), 14);
        assert!(v1.chars().all(|c| c.is_ascii_digit()));

        versions.version_for("AWS", "S3", "acc");
        versions.version_for("AWS", "S3", "other");
        assert_eq!(versions.len(), 3);

        versions.purge_account("acc");
        assert_eq!(versions.len(), 1);

        versions.clear();
        assert!(versions.is_empty());
    }
}

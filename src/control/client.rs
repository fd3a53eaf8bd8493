//! Control-plane client
//!
//! The [`ControlPlane`] trait is the narrow contract the executor, pipeline
//! and operational logger consume. [`HttpControlPlane`] talks to the real
//! server; tests substitute in-memory implementations.

use super::http::{ControlPlaneHttp, TokenHeader};
use super::session::Session;
use super::wire::{
    AccountQuery, DataPushRequest, LogEntry, RegistryRequest, RegistryResponse, ResourceBatch,
    RunningFinishSignal, SupportResource, SupportResourceTypeListRequest,
};
use crate::account::{CloudAccount, CollectorTask};
use crate::error::ControlPlaneError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

// ===== Endpoints =====

const REGISTRY: &str = "/api/agent/registry";
const LIST_TASKS: &str = "/api/agent/listCollectorTask";
const LIST_ACCOUNTS: &str = "/api/agent/listCloudAccount";
const PUSH_RESOURCE: &str = "/api/agent/resource";
const FINISH_SIGNAL: &str = "/api/agent/acceptRunningFinishSignal";
const SUPPORT_RESOURCE: &str = "/api/agent/acceptSupportResourceType";
const LOG: &str = "/api/agent/log-endpoint";

/// Calls the agent makes against the control plane
///
/// Every call may fail transiently. Only batch submission and the finish
/// signal are retried; everything else is logged and skipped.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register (or renew) the session
    async fn register(&self) -> Result<()>;

    async fn is_registered(&self) -> bool;

    /// Pending on-demand collection tasks
    async fn list_tasks(&self) -> Result<Vec<CollectorTask>>;

    /// Accounts to collect, optionally restricted to `task_ids` or capped at
    /// `free_count`
    async fn list_accounts(
        &self,
        task_ids: &[i64],
        free_count: Option<usize>,
    ) -> Result<Vec<CloudAccount>>;

    async fn push_resources(&self, batch: &ResourceBatch) -> Result<()>;

    async fn send_finish_signal(&self, cloud_account_id: &str, task_id: i64) -> Result<()>;

    async fn send_log(&self, entry: &LogEntry) -> Result<()>;

    async fn send_supported_resources(&self, resources: Vec<SupportResource>) -> Result<()>;
}

/// HTTP implementation bound to one platform
pub struct HttpControlPlane {
    http: ControlPlaneHttp,
    platform: String,
    sites: Vec<String>,
    session: Session,
}

impl HttpControlPlane {
    pub fn new(server_url: &str, platform: &str, sites: Vec<String>, session: Session) -> Result<Self> {
        Ok(Self {
            http: ControlPlaneHttp::new(server_url)?,
            platform: platform.to_string(),
            sites,
            session,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// POST with the persistent token; auth failures drop the session
    async fn post_session<B, T>(&self, path: &str, body: &B) -> Result<Option<T>>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let token = self.session.token().await?;
        let result = self
            .http
            .post(path, TokenHeader::Persistent(&token), body)
            .await;

        if let Err(err) = &result {
            if is_auth_failure(err) {
                self.session.invalidate().await;
            }
        }
        result
    }
}

fn is_auth_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ControlPlaneError>(),
        Some(ControlPlaneError::Status(401)) | Some(ControlPlaneError::Status(403))
    )
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register(&self) -> Result<()> {
        let once_token = self
            .session
            .once_token()
            .ok_or(ControlPlaneError::NotRegistered)?;

        let request = RegistryRequest {
            platform: self.platform.clone(),
            registry_value: self.session.registry_value().to_string(),
            agent_name: self.session.agent_name().to_string(),
        };

        let response: Option<RegistryResponse> = self
            .http
            .post(REGISTRY, TokenHeader::Once(once_token), &request)
            .await
            .context("Registration failed")?;

        let response = response.context("Registry response has no content")?;
        self.session.store(response.persistent_token).await;
        tracing::info!(
            platform = %self.platform,
            registry_value = %self.session.registry_value(),
            "Registered with control plane"
        );
        Ok(())
    }

    async fn is_registered(&self) -> bool {
        self.session.is_registered().await
    }

    async fn list_tasks(&self) -> Result<Vec<CollectorTask>> {
        let query = AccountQuery {
            platform: self.platform.clone(),
            registry_value: self.session.registry_value().to_string(),
            ..AccountQuery::default()
        };
        let tasks: Option<Vec<CollectorTask>> = self
            .post_session(LIST_TASKS, &query)
            .await
            .context("Failed to list collector tasks")?;
        Ok(tasks.unwrap_or_default())
    }

    async fn list_accounts(
        &self,
        task_ids: &[i64],
        free_count: Option<usize>,
    ) -> Result<Vec<CloudAccount>> {
        let query = AccountQuery {
            platform: self.platform.clone(),
            registry_value: self.session.registry_value().to_string(),
            sites: self.sites.clone(),
            task_ids: task_ids.to_vec(),
            free_cloud_account_count: free_count,
        };
        let accounts: Option<Vec<CloudAccount>> = self
            .post_session(LIST_ACCOUNTS, &query)
            .await
            .context("Failed to list cloud accounts")?;

        let accounts = accounts.unwrap_or_default();
        tracing::debug!("Loaded {} accounts from control plane", accounts.len());
        Ok(accounts)
    }

    async fn push_resources(&self, batch: &ResourceBatch) -> Result<()> {
        let data = serde_json::to_string(batch).context("Failed to serialize resource batch")?;
        let _: Option<serde_json::Value> = self
            .post_session(PUSH_RESOURCE, &DataPushRequest { data })
            .await?;
        Ok(())
    }

    async fn send_finish_signal(&self, cloud_account_id: &str, task_id: i64) -> Result<()> {
        let signal = RunningFinishSignal {
            cloud_account_id: cloud_account_id.to_string(),
            task_id,
        };
        let _: Option<serde_json::Value> = self.post_session(FINISH_SIGNAL, &signal).await?;
        Ok(())
    }

    async fn send_log(&self, entry: &LogEntry) -> Result<()> {
        let _: Option<serde_json::Value> = self.post_session(LOG, entry).await?;
        Ok(())
    }

    async fn send_supported_resources(&self, resources: Vec<SupportResource>) -> Result<()> {
        let request = SupportResourceTypeListRequest {
            platform: self.platform.clone(),
            registry_value: self.session.registry_value().to_string(),
            resource_list: resources,
        };
        let _: Option<serde_json::Value> = self
            .post_session(SUPPORT_RESOURCE, &request)
            .await
            .context("Failed to send supported resource types")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_calls_require_registration() {
        let client = HttpControlPlane::new(
            "http://localhost:1",
            "AWS",
            Vec::new(),
            Session::new("agent", Some("once".into())),
        )
        .unwrap();

        let err = client.list_tasks().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ControlPlaneError>(),
            Some(ControlPlaneError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn test_register_without_once_token() {
        let client =
            HttpControlPlane::new("http://localhost:1", "AWS", Vec::new(), Session::new("agent", None))
                .unwrap();
        assert!(client.register().await.is_err());
        assert!(!client.is_registered().await);
    }

    #[test]
    fn test_auth_failure_classification() {
        assert!(is_auth_failure(&ControlPlaneError::Status(401).into()));
        assert!(!is_auth_failure(&ControlPlaneError::Status(500).into()));
        assert!(!is_auth_failure(&anyhow::anyhow!("io")));
    }
}

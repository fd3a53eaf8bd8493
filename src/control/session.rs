//! Control-plane session
//!
//! Holds the one-time registration token and caches the persistent token the
//! server hands back. Every session-scoped call reads the cached token; a
//! rejected call invalidates it so the next cycle re-registers.

use crate::error::ControlPlaneError;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Agent session with persistent token caching
#[derive(Clone)]
pub struct Session {
    agent_name: String,
    once_token: Option<String>,
    /// Stable identity of this agent process, sent with every call
    registry_value: String,
    token_cache: Arc<RwLock<Option<String>>>,
}

impl Session {
    /// Create a session; `once_token == None` means the agent never registers
    pub fn new(agent_name: &str, once_token: Option<String>) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            once_token: once_token.filter(|t| !t.trim().is_empty()),
            registry_value: uuid::Uuid::new_v4().to_string(),
            token_cache: Arc::new(RwLock::new(None)),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn registry_value(&self) -> &str {
        &self.registry_value
    }

    pub fn once_token(&self) -> Option<&str> {
        self.once_token.as_deref()
    }

    /// Cached persistent token
    pub async fn token(&self) -> Result<String, ControlPlaneError> {
        let cache = self.token_cache.read().await;
        (*cache).clone().ok_or(ControlPlaneError::NotRegistered)
    }

    pub async fn is_registered(&self) -> bool {
        self.token_cache.read().await.is_some()
    }

    /// Store a token returned by the registry endpoint
    pub async fn store(&self, token: String) {
        let mut cache = self.token_cache.write().await;
        *cache = Some(token);
        tracing::debug!("Cached persistent token for {}", self.agent_name);
    }

    /// Drop the cached token so the next call re-registers
    pub async fn invalidate(&self) {
        let mut cache = self.token_cache.write().await;
        if cache.take().is_some() {
            tracing::info!("Persistent token invalidated, agent will re-register");
        }
    }
}

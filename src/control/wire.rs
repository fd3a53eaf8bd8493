//! Control-plane wire types
//!
//! Request bodies and the response envelope of the `/api/agent/*` endpoints.

use crate::resource::ResourceInstance;
use serde::{Deserialize, Serialize};

/// Envelope code the server uses for success
pub const SUCCESS_CODE: i64 = 200;

/// Response envelope
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default = "Option::default")]
    pub content: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }
}

/// Registration request, authenticated by the one-time token
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRequest {
    pub platform: String,
    pub registry_value: String,
    pub agent_name: String,
}

/// Registration result
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryResponse {
    pub persistent_token: String,
}

/// Account listing filter
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountQuery {
    pub platform: String,
    pub registry_value: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sites: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub task_ids: Vec<i64>,
    /// How many accounts the agent can take right now
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_cloud_account_count: Option<usize>,
}

/// Resource catalogue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportResource {
    pub resource_type: String,
    pub resource_type_name: String,
    pub resource_group_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportResourceTypeListRequest {
    pub platform: String,
    pub registry_value: String,
    pub resource_list: Vec<SupportResource>,
}

/// One batch of normalized records for an account and resource type
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBatch {
    pub platform: String,
    pub version: String,
    pub cloud_account_id: String,
    pub resource_type: String,
    pub resource_type_name: String,
    pub resource_group_type: String,
    pub doc_link: String,
    #[serde(rename = "resourceInstancesAll")]
    pub instances: Vec<ResourceInstance>,
}

/// The push endpoint takes the batch as a JSON string under `data`
#[derive(Debug, Clone, Serialize)]
pub struct DataPushRequest {
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningFinishSignal {
    pub cloud_account_id: String,
    pub task_id: i64,
}

/// Remote operational log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: String,
    pub time: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub unique_key: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_account_id: Option<String>,
}

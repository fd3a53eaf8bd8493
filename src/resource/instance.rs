//! Normalized resource records
//!
//! One [`ResourceInstance`] is produced per raw SDK item. Ownership moves
//! through the pipeline channels and each record is consumed exactly once
//! by the submission stage.

use crate::error::CollectError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized output record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInstance {
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_list: Vec<String>,
    /// Raw provider payload
    pub instance: Value,
}

/// Builder validating the required fields of a [`ResourceInstance`]
#[derive(Debug, Default)]
pub struct ResourceBuilder {
    resource_id: Option<String>,
    resource_name: Option<String>,
    address: Option<String>,
    region_id: String,
    tag_list: Vec<String>,
    instance: Option<Value>,
}

impl ResourceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource_id(mut self, resource_id: Option<String>) -> Self {
        self.resource_id = resource_id;
        self
    }

    pub fn resource_name(mut self, resource_name: Option<String>) -> Self {
        self.resource_name = resource_name;
        self
    }

    pub fn address(mut self, address: Option<String>) -> Self {
        self.address = address;
        self
    }

    pub fn region_id(mut self, region_id: &str) -> Self {
        self.region_id = region_id.to_string();
        self
    }

    pub fn tag_list(mut self, tags: Vec<String>) -> Self {
        self.tag_list = tags;
        self
    }

    pub fn instance(mut self, instance: Value) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Fails when the resource id is missing or empty, or there is no payload
    pub fn build(self) -> Result<ResourceInstance, CollectError> {
        let resource_id = self
            .resource_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CollectError::Transform("resourceId is empty".to_string()))?;

        let instance = match self.instance {
            Some(Value::Null) | None => {
                return Err(CollectError::Transform("instance is empty".to_string()))
            }
            Some(instance) => instance,
        };

        Ok(ResourceInstance {
            resource_id,
            resource_name: self.resource_name,
            address: self.address,
            region_id: self.region_id,
            tag_list: self.tag_list,
            instance,
        })
    }
}

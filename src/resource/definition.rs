//! Resource definitions
//!
//! Immutable descriptions of collectable resource types. Defined once at
//! process start and shared read-only by every pipeline.

use super::collector::Collector;
use crate::control::wire::SupportResource;

/// Regional partitioning of a resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dimension {
    /// Not region-partitioned; collected once per account
    Global,
    /// Collected once per region
    #[default]
    Regional,
}

/// JSON paths projecting a raw payload into row fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowField {
    /// Unique key of the resource. Falls back to the account id for
    /// global resources.
    pub resource_id: String,
    /// Display name
    pub resource_name: String,
    /// Public address, when the resource has one
    pub address: String,
}

impl RowField {
    pub fn new(resource_id: &str, resource_name: &str, address: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            resource_name: resource_name.to_string(),
            address: address.to_string(),
        }
    }
}

/// Definition of one collectable resource type
#[derive(Debug, Clone)]
pub struct Resource {
    /// Key identifier, e.g. `ECS`
    pub resource_type: String,
    pub resource_type_name: String,
    /// Category: NET, CONTAINER, DATABASE, STORE, COMPUTE, IDENTITY, SECURITY
    pub resource_group_type: String,
    /// Documentation link
    pub desc: String,
    pub collector: Collector,
    pub row_field: RowField,
    pub dimension: Dimension,
    /// Takes precedence over the platform's default regions when non-empty
    pub regions: Vec<String>,
    pub excluded_regions: Vec<String>,
}

impl Resource {
    pub fn new(resource_type: &str, collector: Collector) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            resource_type_name: resource_type.to_string(),
            resource_group_type: String::new(),
            desc: String::new(),
            collector,
            row_field: RowField::default(),
            dimension: Dimension::Regional,
            regions: Vec::new(),
            excluded_regions: Vec::new(),
        }
    }

    pub fn with_names(mut self, type_name: &str, group_type: &str) -> Self {
        self.resource_type_name = type_name.to_string();
        self.resource_group_type = group_type.to_string();
        self
    }

    pub fn with_desc(mut self, desc: &str) -> Self {
        self.desc = desc.to_string();
        self
    }

    pub fn with_row_field(mut self, row_field: RowField) -> Self {
        self.row_field = row_field;
        self
    }

    pub fn with_dimension(mut self, dimension: Dimension) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_regions(mut self, regions: &[&str]) -> Self {
        self.regions = regions.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_excluded_regions(mut self, regions: &[&str]) -> Self {
        self.excluded_regions = regions.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn is_global(&self) -> bool {
        self.dimension == Dimension::Global
    }

    /// Candidate regions: own list or the platform default, minus exclusions
    pub fn candidate_regions(&self, default_regions: &[String]) -> Vec<String> {
        let base = if self.regions.is_empty() {
            default_regions
        } else {
            &self.regions
        };

        base.iter()
            .filter(|r| !self.excluded_regions.contains(r))
            .cloned()
            .collect()
    }

    /// Catalogue entry announced to the control plane
    pub fn support_entry(&self) -> SupportResource {
        SupportResource {
            resource_type: self.resource_type.clone(),
            resource_type_name: self.resource_type_name.clone(),
            resource_group_type: self.resource_group_type.clone(),
        }
    }
}

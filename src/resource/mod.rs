//! Resource abstraction layer
//!
//! A [`Resource`] is a static definition of one cloud resource type: where
//! it lives (regional or global), how to project its raw payload into a
//! normalized [`ResourceInstance`], and the collector function that lists
//! it through a provider SDK.
//!
//! # Architecture
//!
//! - [`definition`] - `Resource`, `Dimension`, `RowField`
//! - [`collector`] - collector function contract, context and result sender
//! - [`services`] - provider services contract (`CloudServices`)
//! - [`instance`] - normalized output record and its builder
//! - [`projection`] - JSON path projection of raw payloads
//!
//! # Example
//!
//! ```ignore
//! use cloudrec_agent::resource::{Collector, Dimension, Resource, RowField};
//!
//! let resource = Resource::new(
//!     "ECS",
//!     Collector::detail(|ctx, services, tx| async move {
//!         for item in list_instances(&services).await? {
//!             tx.send(&item).await?;
//!         }
//!         Ok(())
//!     }),
//! )
//! .with_row_field(RowField::new("$.InstanceId", "$.InstanceName", "$.PublicIp"))
//! .with_dimension(Dimension::Regional);
//! ```

pub mod collector;
pub mod definition;
pub mod instance;
pub mod projection;
pub mod services;

pub use collector::{CollectContext, Collector, ResultSender};
pub use definition::{Dimension, Resource, RowField};
pub use instance::{ResourceBuilder, ResourceInstance};
pub use projection::{project, read_path};
pub use services::{downcast_services, CloudServices};

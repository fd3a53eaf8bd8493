//! Multi-cloud resource inventory agent
//!
//! Turns cloud accounts and resource definitions into a bounded, rate
//! limited pipeline of collection jobs whose normalized records are pushed
//! to a control plane.

pub mod account;
pub mod config;
pub mod control;
pub mod demo;
pub mod error;
pub mod executor;
pub mod oplog;
pub mod platform;
pub mod queue;
pub mod resource;

/// Version injected at compile time via CLOUDREC_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("CLOUDREC_VERSION") {
    Some(v) => v,
    None => "dev",
};

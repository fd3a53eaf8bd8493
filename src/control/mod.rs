//! Control-plane access
//!
//! Registration, account and task listing, batch submission, finish
//! signals and remote operational logs.

pub mod client;
pub mod http;
pub mod memory;
pub mod session;
pub mod wire;

pub use client::{ControlPlane, HttpControlPlane};
pub use http::format_control_plane_error;
pub use memory::InMemoryControlPlane;
pub use session::Session;
pub use wire::{LogEntry, ResourceBatch, SupportResource};

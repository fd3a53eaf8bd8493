//! Account scheduling
//!
//! [`TaskQueue`] is a bounded worker pool; [`AccountQueue`] feeds it with
//! accounts under admission control.

pub mod account;
pub mod task;

pub use account::{AccountQueue, QueueStatus};
pub use task::TaskQueue;

use crate::account::CloudAccount;
use async_trait::async_trait;

/// Runs the full collection of one account
#[async_trait]
pub trait AccountProcessor: Send + Sync + 'static {
    async fn process_account(&self, account: CloudAccount);
}

//! In-memory control plane
//!
//! Serves accounts and tasks from memory and records everything the agent
//! sends. Used to drive the engine without a server.

use super::client::ControlPlane;
use super::wire::{LogEntry, ResourceBatch, SupportResource};
use crate::account::{CloudAccount, CollectorTask};
use crate::error::ControlPlaneError;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
pub struct InMemoryControlPlane {
    registered: AtomicBool,
    refuse_registration: AtomicBool,
    accounts: Mutex<Vec<CloudAccount>>,
    tasks: Mutex<Vec<CollectorTask>>,
    batches: Mutex<Vec<ResourceBatch>>,
    finish_signals: Mutex<Vec<(String, i64)>>,
    logs: Mutex<Vec<LogEntry>>,
    supported: Mutex<Vec<SupportResource>>,
    /// Remaining push calls that fail before pushes succeed again
    failing_pushes: AtomicUsize,
    push_calls: AtomicUsize,
    list_account_calls: AtomicUsize,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// A control plane the agent is already registered with
    pub fn registered() -> Self {
        let plane = Self::default();
        plane.registered.store(true, Ordering::SeqCst);
        plane
    }

    /// Make every registration attempt fail
    pub fn refuse_registration(&self) {
        self.refuse_registration.store(true, Ordering::SeqCst);
    }

    /// Let registration succeed again
    pub fn accept_registration(&self) {
        self.refuse_registration.store(false, Ordering::SeqCst);
    }

    /// Drop the session as if the server revoked its token
    pub fn revoke(&self) {
        self.registered.store(false, Ordering::SeqCst);
    }

    pub fn with_accounts(self, accounts: Vec<CloudAccount>) -> Self {
        *self.accounts.lock() = accounts;
        self
    }

    pub fn set_accounts(&self, accounts: Vec<CloudAccount>) {
        *self.accounts.lock() = accounts;
    }

    pub fn set_tasks(&self, tasks: Vec<CollectorTask>) {
        *self.tasks.lock() = tasks;
    }

    /// Make the next `n` push calls fail
    pub fn fail_next_pushes(&self, n: usize) {
        self.failing_pushes.store(n, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<ResourceBatch> {
        self.batches.lock().clone()
    }

    pub fn finish_signals(&self) -> Vec<(String, i64)> {
        self.finish_signals.lock().clone()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().clone()
    }

    pub fn supported(&self) -> Vec<SupportResource> {
        self.supported.lock().clone()
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn list_account_calls(&self) -> usize {
        self.list_account_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn register(&self) -> Result<()> {
        if self.refuse_registration.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Rejected {
                code: 403,
                msg: "registration refused".to_string(),
            }
            .into());
        }
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    async fn list_tasks(&self) -> Result<Vec<CollectorTask>> {
        Ok(std::mem::take(&mut *self.tasks.lock()))
    }

    /// Task-filtered listings return the accounts named by the tasks;
    /// regular listings hand out at most `free_count` accounts, each once.
    async fn list_accounts(
        &self,
        task_ids: &[i64],
        free_count: Option<usize>,
    ) -> Result<Vec<CloudAccount>> {
        self.list_account_calls.fetch_add(1, Ordering::SeqCst);
        let mut accounts = self.accounts.lock();

        if !task_ids.is_empty() {
            let (matched, rest): (Vec<_>, Vec<_>) = accounts
                .drain(..)
                .partition(|a| task_ids.contains(&a.task_id));
            *accounts = rest;
            return Ok(matched);
        }

        let take = free_count.unwrap_or(accounts.len()).min(accounts.len());
        Ok(accounts.drain(..take).collect())
    }

    async fn push_resources(&self, batch: &ResourceBatch) -> Result<()> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ControlPlaneError::Status(503).into());
        }
        self.batches.lock().push(batch.clone());
        Ok(())
    }

    async fn send_finish_signal(&self, cloud_account_id: &str, task_id: i64) -> Result<()> {
        self.finish_signals
            .lock()
            .push((cloud_account_id.to_string(), task_id));
        Ok(())
    }

    async fn send_log(&self, entry: &LogEntry) -> Result<()> {
        self.logs.lock().push(entry.clone());
        Ok(())
    }

    async fn send_supported_resources(&self, resources: Vec<SupportResource>) -> Result<()> {
        *self.supported.lock() = resources;
        Ok(())
    }
}

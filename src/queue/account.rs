//! Account queue
//!
//! Admission control over how many accounts are pending or in flight at
//! once. Accounts are handed to a [`TaskQueue`]; every completion wakes a
//! dispatcher that starts the next pending account.

use super::task::TaskQueue;
use super::AccountProcessor;
use crate::account::CloudAccount;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Snapshot returned by [`AccountQueue::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub queued: usize,
    pub processing: usize,
    pub available: usize,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<CloudAccount>,
    processing: HashSet<String>,
}

impl QueueState {
    fn available(&self, max_size: usize) -> usize {
        max_size.saturating_sub(self.pending.len() + self.processing.len())
    }

    fn contains(&self, account_id: &str) -> bool {
        self.processing.contains(account_id)
            || self
                .pending
                .iter()
                .any(|a| a.cloud_account_id == account_id)
    }

    /// Accounts from `accounts` that fit, skipping known and repeated ids
    fn admit(&self, accounts: Vec<CloudAccount>, max_size: usize) -> Vec<CloudAccount> {
        let mut room = self.available(max_size);
        let mut seen = HashSet::new();
        let mut admitted = Vec::new();
        for account in accounts {
            if room == 0 {
                break;
            }
            if self.contains(&account.cloud_account_id)
                || !seen.insert(account.cloud_account_id.clone())
            {
                continue;
            }
            admitted.push(account);
            room -= 1;
        }
        admitted
    }
}

struct Shared<P> {
    max_size: usize,
    state: Mutex<QueueState>,
    tasks: TaskQueue,
    processor: Arc<P>,
    /// Wakes the dispatcher
    slot_freed: Notify,
    /// Wakes [`AccountQueue::wait_idle`] callers
    finished: Notify,
}

/// Unmarks an account when its task ends, even by panic
struct Processing<P: AccountProcessor> {
    shared: Arc<Shared<P>>,
    account_id: String,
}

impl<P: AccountProcessor> Drop for Processing<P> {
    fn drop(&mut self) {
        self.shared.state.lock().processing.remove(&self.account_id);
        self.shared.slot_freed.notify_one();
        self.shared.finished.notify_waiters();
    }
}

impl<P: AccountProcessor> Shared<P> {
    fn process_next(self: &Arc<Self>) -> Option<String> {
        let account = {
            let mut state = self.state.lock();
            let account = state.pending.pop_front()?;
            state.processing.insert(account.cloud_account_id.clone());
            account
        };
        let account_id = account.cloud_account_id.clone();

        let shared = self.clone();
        let requeue = account.clone();
        let accepted = self.tasks.add_task(async move {
            let guard = Processing {
                shared,
                account_id: account.cloud_account_id.clone(),
            };
            tracing::info!(account_id = %guard.account_id, "Processing cloud account");
            guard.shared.processor.process_account(account).await;
            tracing::info!(account_id = %guard.account_id, "Finished cloud account");
        });

        if !accepted {
            // Keep the account at the head so it is retried first
            let mut state = self.state.lock();
            state.processing.remove(&account_id);
            state.pending.push_front(requeue);
            return None;
        }
        Some(account_id)
    }

    /// Start pending accounts while workers are free
    fn fill_workers(self: &Arc<Self>) -> usize {
        let mut started = 0;
        loop {
            let busy = self.state.lock().processing.len();
            if busy >= self.tasks.workers() || self.process_next().is_none() {
                return started;
            }
            started += 1;
        }
    }
}

pub struct AccountQueue<P: AccountProcessor> {
    shared: Arc<Shared<P>>,
    dispatcher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<P: AccountProcessor> AccountQueue<P> {
    /// Queue holding at most `max_size` pending plus in-flight accounts,
    /// processed by `workers` concurrent tasks
    pub fn new(max_size: usize, workers: usize, processor: Arc<P>) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_size,
                state: Mutex::new(QueueState::default()),
                tasks: TaskQueue::new(workers),
                processor,
                slot_freed: Notify::new(),
                finished: Notify::new(),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    pub fn is_running(&self) -> bool {
        self.shared.tasks.is_running()
    }

    /// Start the workers and the dispatcher that pulls the next account
    /// whenever one completes
    pub fn start(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        self.shared.tasks.start();

        let token = CancellationToken::new();
        let shared = self.shared.clone();
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = shared.slot_freed.notified() => {
                        shared.fill_workers();
                    }
                }
            }
        });
        *dispatcher = Some((token, handle));
    }

    pub fn stop(&self) {
        if let Some((token, _)) = self.dispatcher.lock().take() {
            token.cancel();
        }
        self.shared.tasks.stop();
    }

    /// Stop and wait for in-flight accounts to finish
    pub async fn shutdown(&self) {
        let dispatcher = self.dispatcher.lock().take();
        if let Some((token, handle)) = dispatcher {
            token.cancel();
            let _ = handle.await;
        }
        self.shared.tasks.shutdown().await;
    }

    /// Append accounts not already pending or processing, as many as fit.
    /// Returns how many were admitted.
    pub fn add_accounts(&self, accounts: Vec<CloudAccount>) -> usize {
        let mut state = self.shared.state.lock();
        let admitted = state.admit(accounts, self.shared.max_size);
        let count = admitted.len();
        state.pending.extend(admitted);
        count
    }

    /// Like [`add_accounts`](Self::add_accounts) but ahead of every pending
    /// account, keeping the order of `accounts`
    pub fn add_priority_accounts(&self, accounts: Vec<CloudAccount>) -> usize {
        let mut state = self.shared.state.lock();
        let admitted = state.admit(accounts, self.shared.max_size);
        let count = admitted.len();
        for account in admitted.into_iter().rev() {
            state.pending.push_front(account);
        }
        count
    }

    /// Start the head of the queue. Returns its id, or `None` when nothing
    /// is pending or the task queue refused it.
    pub fn process_next(&self) -> Option<String> {
        self.shared.process_next()
    }

    /// Start as many pending accounts as there are idle workers
    pub fn fill_workers(&self) -> usize {
        self.shared.fill_workers()
    }

    pub fn available_slots(&self) -> usize {
        self.shared.state.lock().available(self.shared.max_size)
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.shared.state.lock();
        QueueStatus {
            queued: state.pending.len(),
            processing: state.processing.len(),
            available: state.available(self.shared.max_size),
        }
    }

    pub fn is_processing(&self, account_id: &str) -> bool {
        self.shared.state.lock().processing.contains(account_id)
    }

    /// Nothing pending and nothing in flight
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.pending.is_empty() && state.processing.is_empty()
    }

    /// Resolves once the queue is idle
    pub async fn wait_idle(&self) {
        loop {
            let finished = self.shared.finished.notified();
            if self.is_idle() {
                return;
            }
            finished.await;
        }
    }
}

impl<P: AccountProcessor> Drop for AccountQueue<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Holds every account until a permit is released
    struct Gated {
        gate: Semaphore,
        started: Mutex<Vec<String>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl Gated {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                started: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            })
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().clone()
        }
    }

    #[async_trait]
    impl AccountProcessor for Gated {
        async fn process_account(&self, account: CloudAccount) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.started.lock().push(account.cloud_account_id.clone());
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn accounts(ids: &[&str]) -> Vec<CloudAccount> {
        ids.iter().map(|id| CloudAccount::new(id, "AWS")).collect()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_priority_accounts_dequeue_first() {
        let processor = Gated::new();
        let queue = AccountQueue::new(5, 5, processor.clone());
        queue.start();

        assert_eq!(queue.add_accounts(accounts(&["regular-1", "regular-2", "regular-3"])), 3);
        assert_eq!(queue.status().queued, 3);
        assert_eq!(queue.add_priority_accounts(accounts(&["priority-1", "priority-2"])), 2);
        assert_eq!(queue.status().queued, 5);

        let order: Vec<_> = (0..5).filter_map(|_| queue.process_next()).collect();
        assert_eq!(
            order,
            vec!["priority-1", "priority-2", "regular-1", "regular-2", "regular-3"]
        );
        assert!(queue.is_processing("priority-1"));

        processor.gate.add_permits(5);
        queue.wait_idle().await;
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_priority_when_full() {
        let processor = Gated::new();
        let queue = AccountQueue::new(3, 3, processor.clone());
        // Workers only: no dispatcher racing the explicit process_next calls
        queue.shared.tasks.start();

        assert_eq!(queue.add_accounts(accounts(&["regular-1", "regular-2", "regular-3"])), 3);
        let status = queue.status();
        assert_eq!((status.queued, status.available), (3, 0));

        let priority = accounts(&["priority-1", "priority-2"]);
        assert_eq!(queue.add_priority_accounts(priority.clone()), 0);

        assert_eq!(queue.process_next().as_deref(), Some("regular-1"));
        wait_until(|| processor.started().len() == 1).await;
        assert_eq!(queue.available_slots(), 0);

        // Completing regular-1 frees exactly one slot
        processor.gate.add_permits(1);
        wait_until(|| queue.available_slots() == 1).await;

        assert_eq!(queue.add_priority_accounts(priority), 1);
        assert_eq!(queue.process_next().as_deref(), Some("priority-1"));

        processor.gate.add_permits(10);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicates_not_readmitted() {
        let processor = Gated::new();
        let queue = AccountQueue::new(5, 2, processor.clone());
        queue.start();

        assert_eq!(queue.add_accounts(accounts(&["account-1", "account-2"])), 2);
        assert_eq!(queue.process_next().as_deref(), Some("account-1"));

        // One is in flight, the other pending, the third is new
        let added = queue.add_priority_accounts(accounts(&["account-1", "account-2", "account-3"]));
        assert_eq!(added, 1);
        let status = queue.status();
        assert_eq!((status.queued, status.processing), (2, 1));

        // Repeats inside one call count once
        assert_eq!(queue.add_accounts(accounts(&["account-4", "account-4"])), 1);

        processor.gate.add_permits(10);
        queue.fill_workers();
        queue.wait_idle().await;

        let mut started = processor.started();
        started.sort();
        assert_eq!(started, vec!["account-1", "account-2", "account-3", "account-4"]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_completion_pulls_next() {
        let processor = Gated::new();
        let queue = AccountQueue::new(10, 2, processor.clone());
        queue.start();

        queue.add_accounts(accounts(&["a", "b", "c", "d", "e"]));
        assert_eq!(queue.fill_workers(), 2);
        wait_until(|| processor.started().len() == 2).await;
        assert_eq!(queue.status().processing, 2);

        processor.gate.add_permits(10);
        queue.wait_idle().await;

        let mut started = processor.started();
        started.sort();
        assert_eq!(started, vec!["a", "b", "c", "d", "e"]);
        assert!(processor.max_running.load(Ordering::SeqCst) <= 2);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_not_running_keeps_account_pending() {
        let processor = Gated::new();
        let queue = AccountQueue::new(3, 1, processor);

        queue.add_accounts(accounts(&["a", "b"]));
        assert_eq!(queue.process_next(), None);

        let status = queue.status();
        assert_eq!((status.queued, status.processing), (2, 0));
    }

    #[tokio::test]
    async fn test_panicking_processor_frees_slot() {
        struct Explodes;

        #[async_trait]
        impl AccountProcessor for Explodes {
            async fn process_account(&self, account: CloudAccount) {
                if account.cloud_account_id == "boom" {
                    panic!("account pipeline failed");
                }
            }
        }

        let queue = AccountQueue::new(2, 1, Arc::new(Explodes));
        queue.start();
        queue.add_accounts(accounts(&["boom", "fine"]));
        queue.fill_workers();
        queue.wait_idle().await;

        assert_eq!(queue.status().available, 2);
        queue.shutdown().await;
    }
}

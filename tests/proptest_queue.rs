//! Property-based tests for account queue admission
//!
//! Random sequences of regular and priority admissions against a stopped
//! queue, plus dequeue order once a single worker drains it.

use async_trait::async_trait;
use cloudrec_agent::account::CloudAccount;
use cloudrec_agent::queue::{AccountProcessor, AccountQueue};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

struct Idle;

#[async_trait]
impl AccountProcessor for Idle {
    async fn process_account(&self, _account: CloudAccount) {}
}

/// Records the order accounts are processed in
#[derive(Default)]
struct Recorder {
    order: Mutex<Vec<String>>,
}

#[async_trait]
impl AccountProcessor for Recorder {
    async fn process_account(&self, account: CloudAccount) {
        self.order.lock().push(account.cloud_account_id);
    }
}

fn accounts(ids: &[u8]) -> Vec<CloudAccount> {
    ids.iter()
        .map(|id| CloudAccount::new(&format!("acc-{}", id), "TEST_CLOUD"))
        .collect()
}

/// One admission call: priority flag plus account ids drawn from a small pool
fn arb_batch() -> impl Strategy<Value = (bool, Vec<u8>)> {
    (any::<bool>(), prop::collection::vec(0u8..16, 0..10))
}

proptest! {
    #[test]
    fn admission_respects_capacity_and_dedup(
        max_size in 1usize..12,
        batches in prop::collection::vec(arb_batch(), 1..20),
    ) {
        let queue = AccountQueue::new(max_size, 1, Arc::new(Idle));
        let mut known: HashSet<u8> = HashSet::new();

        for (priority, ids) in batches {
            let mut expected = 0;
            for id in &ids {
                if known.len() == max_size {
                    break;
                }
                if known.insert(*id) {
                    expected += 1;
                }
            }

            let admitted = if priority {
                queue.add_priority_accounts(accounts(&ids))
            } else {
                queue.add_accounts(accounts(&ids))
            };
            prop_assert_eq!(admitted, expected);

            let status = queue.status();
            prop_assert!(status.queued + status.processing <= max_size);
            prop_assert_eq!(status.queued, known.len());
            prop_assert_eq!(status.processing, 0);
            prop_assert_eq!(status.available, max_size - known.len());
            prop_assert_eq!(queue.available_slots(), status.available);
        }
    }

    #[test]
    fn stopped_queue_never_starts_accounts(
        ids in prop::collection::vec(0u8..16, 0..20),
    ) {
        let queue = AccountQueue::new(8, 2, Arc::new(Idle));
        let admitted = queue.add_accounts(accounts(&ids));

        prop_assert_eq!(queue.process_next(), None);
        prop_assert_eq!(queue.fill_workers(), 0);

        let status = queue.status();
        prop_assert_eq!(status.queued, admitted);
        prop_assert_eq!(status.processing, 0);
        prop_assert_eq!(queue.is_idle(), admitted == 0);
    }

    #[test]
    fn priority_accounts_run_first_in_call_order(
        regular in 0usize..6,
        priority in 0usize..6,
    ) {
        let recorder = Arc::new(Recorder::default());
        let queue = AccountQueue::new(12, 1, recorder.clone());

        let regular_ids: Vec<u8> = (0..regular as u8).collect();
        let priority_ids: Vec<u8> = (100..100 + priority as u8).collect();
        prop_assert_eq!(queue.add_accounts(accounts(&regular_ids)), regular);
        prop_assert_eq!(queue.add_priority_accounts(accounts(&priority_ids)), priority);

        tokio_test::block_on(async {
            queue.start();
            queue.fill_workers();
            queue.wait_idle().await;
            queue.shutdown().await;
        });

        let expected: Vec<String> = priority_ids
            .iter()
            .chain(regular_ids.iter())
            .map(|id| format!("acc-{}", id))
            .collect();
        prop_assert_eq!(recorder.order.lock().clone(), expected);
    }
}

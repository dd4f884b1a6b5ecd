use serde_json::json;
use tracing::debug;

use crate::constants::{LATEST_SIGNATURE_PREFIX, PROCESSING_LOCK_PREFIX, PROCESSING_LOCK_TTL};
use crate::kv::KvStore;
use crate::queue::{JobQueue, QueueError};
use crate::types::RawTxNotification;

/// JSON-encoded set member for a (signature, tracked account) pair
pub fn pair_key(signature: &str, tracked_account: &str) -> String {
    json!([signature, tracked_account]).to_string()
}

/// Exactly-once enqueue per (signature, tracked account).
///
/// The processed set guards the enqueue window; the per-signature lock and
/// the store's unique constraint guard the processing window. Together they
/// give at-most-one persisted record (or pair) per pair under any worker
/// interleaving.
#[derive(Clone)]
pub struct DedupLayer {
    kv: KvStore,
    queue: JobQueue,
    processed_set: &'static str,
}

impl DedupLayer {
    pub fn new(kv: KvStore, queue: JobQueue, processed_set: &'static str) -> Self {
        Self { kv, queue, processed_set }
    }

    /// Attempt the atomic dedup + enqueue. Returns true when the pair was
    /// new and a job was queued; false when it had already been seen.
    pub fn try_enqueue(
        &self,
        notification: &RawTxNotification,
        tracked_account: &str,
    ) -> Result<bool, QueueError> {
        let member = pair_key(&notification.signature, tracked_account);
        if !self.kv.set_add(self.processed_set, &member) {
            debug!(
                "Duplicate notification short-circuited: {} / {}",
                notification.signature, tracked_account
            );
            return Ok(false);
        }

        self.kv.hash_set(
            &format!("{LATEST_SIGNATURE_PREFIX}{tracked_account}"),
            "signature",
            &notification.signature,
        );

        self.queue.enqueue(
            &notification.signature,
            tracked_account,
            Some(&notification.raw),
            0,
        )?;
        Ok(true)
    }

    /// Short-TTL mutex around one signature's processing window
    pub fn acquire_processing_lock(&self, signature: &str) -> bool {
        self.kv
            .lock_acquire(&format!("{PROCESSING_LOCK_PREFIX}{signature}"), PROCESSING_LOCK_TTL)
    }

    pub fn release_processing_lock(&self, signature: &str) {
        self.kv.lock_release(&format!("{PROCESSING_LOCK_PREFIX}{signature}"));
    }

    /// Finally-path cleanup: the pair leaves the enqueue-guard set once its
    /// job reaches a terminal state (the store constraint takes over).
    pub fn clear_processed(&self, signature: &str, tracked_account: &str) {
        self.kv
            .set_remove(self.processed_set, &pair_key(signature, tracked_account));
    }

    pub fn latest_signature(&self, tracked_account: &str) -> Option<String> {
        self.kv
            .hash_get(&format!("{LATEST_SIGNATURE_PREFIX}{tracked_account}"), "signature")
    }

    pub fn processed_count(&self) -> usize {
        self.kv.set_len(self.processed_set)
    }
}

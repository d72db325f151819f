//! Persistent delivery queue for outbound replies.
//!
//! Entries are enqueued before the transport send and removed only after
//! delivery confirmation, mirrored to `pending_replies.json` on every
//! mutation. A restart replays whatever is still pending, discarding
//! anything stale.

use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeDelta, Utc};
use relay_store::JsonStore;
use relay_store::models::PendingReply;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Entries older than this many seconds are dropped during a drain.
const MAX_REPLY_AGE_SECS: i64 = 60 * 60;

/// The outbound reply queue.
pub struct DeliveryQueue {
    store: Arc<JsonStore>,
    entries: Mutex<Vec<PendingReply>>,
}

impl DeliveryQueue {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Reload pending entries from disk (startup).
    pub async fn load(&self) -> Result<usize> {
        let replies = self.store.load_replies().await?;
        let mut entries = self.entries.lock().await;
        *entries = replies;
        Ok(entries.len())
    }

    /// Record a reply before attempting to send it. Returns the entry id.
    pub async fn enqueue(&self, chat_id: impl Into<String>, text: impl Into<String>) -> String {
        let reply = PendingReply {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            text: text.into(),
            enqueued_at: Utc::now(),
        };
        let id = reply.id.clone();

        let mut entries = self.entries.lock().await;
        entries.push(reply);
        self.persist(&entries).await;
        id
    }

    /// Remove an entry after the transport confirmed delivery.
    pub async fn mark_delivered(&self, id: &str) {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|r| r.id != id);
        if entries.len() != before {
            self.persist(&entries).await;
        }
    }

    pub async fn pending(&self) -> Vec<PendingReply> {
        self.entries.lock().await.clone()
    }

    /// Replay pending entries through `send`, discarding any older than one
    /// hour. Entries whose send succeeds are removed; failed sends stay
    /// queued for the next drain.
    pub async fn drain<F, Fut>(&self, send: F) -> Result<usize>
    where
        F: Fn(PendingReply) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let now = Utc::now();
        let cutoff = TimeDelta::seconds(MAX_REPLY_AGE_SECS);

        let snapshot = {
            let mut entries = self.entries.lock().await;
            let before = entries.len();
            entries.retain(|r| now - r.enqueued_at <= cutoff);
            let dropped = before - entries.len();
            if dropped > 0 {
                info!(dropped, "discarded stale pending replies");
                self.persist(&entries).await;
            }
            entries.clone()
        };

        let mut delivered = 0;
        for reply in snapshot {
            let id = reply.id.clone();
            match send(reply).await {
                Ok(()) => {
                    self.mark_delivered(&id).await;
                    delivered += 1;
                }
                Err(e) => {
                    warn!(reply_id = %id, error = %format!("{e:#}"), "replay send failed, keeping entry");
                }
            }
        }
        Ok(delivered)
    }

    async fn persist(&self, entries: &[PendingReply]) {
        // Persistence failures are logged and never block delivery flow.
        if let Err(e) = self.store.save_replies(entries).await {
            warn!(error = %e, "failed to persist delivery queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::DataDir;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn queue() -> (tempfile::TempDir, DeliveryQueue) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::new(DataDir::new(tmp.path().join("data"))));
        store.init().await.unwrap();
        (tmp, DeliveryQueue::new(store))
    }

    #[tokio::test]
    async fn enqueue_persists_and_mark_delivered_removes() {
        let (_tmp, q) = queue().await;
        let id = q.enqueue("chat-1", "hello").await;
        assert_eq!(q.pending().await.len(), 1);

        q.mark_delivered(&id).await;
        assert!(q.pending().await.is_empty());
    }

    #[tokio::test]
    async fn queue_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::new(DataDir::new(tmp.path().join("data"))));
        store.init().await.unwrap();

        {
            let q = DeliveryQueue::new(Arc::clone(&store));
            q.enqueue("chat-1", "first").await;
            q.enqueue("chat-2", "second").await;
        }

        let q = DeliveryQueue::new(store);
        assert_eq!(q.load().await.unwrap(), 2);
        assert_eq!(q.pending().await.len(), 2);
    }

    #[tokio::test]
    async fn drain_sends_fresh_and_discards_stale() {
        let (_tmp, q) = queue().await;
        q.enqueue("chat-1", "fresh").await;

        // Backdate a second entry past the one-hour cutoff.
        {
            let mut entries = q.entries.lock().await;
            entries.push(PendingReply {
                id: "stale".to_owned(),
                chat_id: "chat-2".to_owned(),
                text: "old".to_owned(),
                enqueued_at: Utc::now() - chrono::TimeDelta::hours(2),
            });
        }

        let sent = AtomicUsize::new(0);
        let delivered = q
            .drain(|reply| {
                sent.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert_eq!(reply.text, "fresh");
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert!(q.pending().await.is_empty());
    }

    #[tokio::test]
    async fn failed_send_keeps_entry_queued() {
        let (_tmp, q) = queue().await;
        q.enqueue("chat-1", "retry me").await;

        let delivered = q
            .drain(|_reply| async { Err(anyhow::anyhow!("transport down")) })
            .await
            .unwrap();

        assert_eq!(delivered, 0);
        assert_eq!(q.pending().await.len(), 1);
    }
}

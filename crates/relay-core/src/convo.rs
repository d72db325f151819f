//! Conversation history: a bounded per-session ring buffer (persisted) and
//! an in-memory accumulator for messages that arrive while the agent is
//! busy. Together they guarantee no user message is lost across busy
//! periods.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_store::JsonStore;
use relay_store::models::{ConversationEntry, ConversationRole, MessageKind};
use tokio::sync::Mutex;
use tracing::warn;

/// Entries kept per session.
const RING_CAPACITY: usize = 20;
/// Stored content is truncated to this many characters for prompt budget.
const MAX_CONTENT_CHARS: usize = 500;

/// Per-session bounded conversation history, mirrored to
/// `conversations/<session>.json`.
pub struct ConversationBuffer {
    store: Arc<JsonStore>,
    sessions: Mutex<HashMap<String, VecDeque<ConversationEntry>>>,
}

impl ConversationBuffer {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Append one entry, truncating content and evicting the oldest entry
    /// past capacity. Persists the session afterwards.
    pub async fn push(
        &self,
        session_key: &str,
        role: ConversationRole,
        content: &str,
        kind: Option<MessageKind>,
    ) {
        let entry = ConversationEntry {
            role,
            content: truncate_chars(content, MAX_CONTENT_CHARS),
            timestamp: Utc::now(),
            kind,
        };

        let mut sessions = self.sessions.lock().await;
        let ring = match sessions.entry(session_key.to_owned()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let loaded = self
                    .store
                    .load_conversation(session_key)
                    .await
                    .unwrap_or_else(|err| {
                        warn!(session = session_key, error = %err, "failed to load conversation, starting empty");
                        Vec::new()
                    });
                e.insert(loaded.into_iter().collect())
            }
        };

        ring.push_back(entry);
        while ring.len() > RING_CAPACITY {
            ring.pop_front();
        }

        let snapshot: Vec<ConversationEntry> = ring.iter().cloned().collect();
        drop(sessions);

        if let Err(e) = self.store.save_conversation(session_key, &snapshot).await {
            warn!(session = session_key, error = %e, "failed to persist conversation");
        }
    }

    /// The session's history, oldest first. Loads from disk on first touch.
    pub async fn history(&self, session_key: &str) -> Vec<ConversationEntry> {
        let mut sessions = self.sessions.lock().await;
        if let Some(ring) = sessions.get(session_key) {
            return ring.iter().cloned().collect();
        }
        let loaded = self
            .store
            .load_conversation(session_key)
            .await
            .unwrap_or_default();
        sessions.insert(session_key.to_owned(), loaded.iter().cloned().collect());
        loaded
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_owned()
    } else {
        s.chars().take(max).collect()
    }
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// One message captured while the agent was busy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulatedMessage {
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// In-memory only: collects messages per session during busy periods and
/// hands them back as one formatted block.
#[derive(Default)]
pub struct MessageAccumulator {
    pending: Mutex<HashMap<String, Vec<AccumulatedMessage>>>,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn accumulate(&self, session_key: &str, text: impl Into<String>) {
        let mut pending = self.pending.lock().await;
        pending
            .entry(session_key.to_owned())
            .or_default()
            .push(AccumulatedMessage {
                text: text.into(),
                received_at: Utc::now(),
            });
    }

    /// Return and clear the session's accumulated messages.
    pub async fn drain(&self, session_key: &str) -> Vec<AccumulatedMessage> {
        self.pending
            .lock()
            .await
            .remove(session_key)
            .unwrap_or_default()
    }

    /// Render drained messages as prompt text.
    ///
    /// A single message renders as `User: <text>`; several render under a
    /// header naming how many arrived while the agent was busy, one
    /// time-stamped line each.
    pub fn format(messages: &[AccumulatedMessage]) -> String {
        match messages {
            [] => String::new(),
            [single] => format!("User: {}", single.text),
            many => {
                let mut out = format!(
                    "{} messages arrived while you were busy:\n",
                    many.len()
                );
                for msg in many {
                    out.push_str(&format!(
                        "[{}] {}\n",
                        msg.received_at.format("%H:%M:%S"),
                        msg.text
                    ));
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::DataDir;

    async fn buffer() -> (tempfile::TempDir, ConversationBuffer) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::new(DataDir::new(tmp.path().join("data"))));
        store.init().await.unwrap();
        (tmp, ConversationBuffer::new(store))
    }

    #[tokio::test]
    async fn ring_never_exceeds_capacity() {
        let (_tmp, buf) = buffer().await;
        for i in 0..30 {
            buf.push("s1", ConversationRole::User, &format!("msg {i}"), None)
                .await;
        }
        let history = buf.history("s1").await;
        assert_eq!(history.len(), RING_CAPACITY);
        // Oldest entries were evicted.
        assert_eq!(history[0].content, "msg 10");
        assert_eq!(history.last().unwrap().content, "msg 29");
    }

    #[tokio::test]
    async fn content_truncated_to_limit() {
        let (_tmp, buf) = buffer().await;
        let long = "x".repeat(2000);
        buf.push("s1", ConversationRole::Assistant, &long, Some(MessageKind::Text))
            .await;
        let history = buf.history("s1").await;
        assert_eq!(history[0].content.chars().count(), MAX_CONTENT_CHARS);
    }

    #[tokio::test]
    async fn history_survives_new_buffer_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::new(DataDir::new(tmp.path().join("data"))));
        store.init().await.unwrap();

        {
            let buf = ConversationBuffer::new(Arc::clone(&store));
            buf.push("tg:9", ConversationRole::User, "hello", None).await;
        }

        let buf = ConversationBuffer::new(store);
        let history = buf.history("tg:9").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hello");
    }

    #[tokio::test]
    async fn accumulator_drains_and_clears() {
        let acc = MessageAccumulator::new();
        acc.accumulate("s1", "one").await;
        acc.accumulate("s1", "two").await;
        acc.accumulate("s2", "other session").await;

        let drained = acc.drain("s1").await;
        assert_eq!(drained.len(), 2);
        assert!(acc.drain("s1").await.is_empty());
        assert_eq!(acc.drain("s2").await.len(), 1);
    }

    #[test]
    fn format_single_message() {
        let msgs = vec![AccumulatedMessage {
            text: "just this".to_owned(),
            received_at: Utc::now(),
        }];
        assert_eq!(MessageAccumulator::format(&msgs), "User: just this");
    }

    #[test]
    fn format_many_messages_has_header_and_timestamps() {
        let msgs = vec![
            AccumulatedMessage {
                text: "first".to_owned(),
                received_at: Utc::now(),
            },
            AccumulatedMessage {
                text: "second".to_owned(),
                received_at: Utc::now(),
            },
        ];
        let text = MessageAccumulator::format(&msgs);
        assert!(text.starts_with("2 messages arrived while you were busy:"));
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }

    #[test]
    fn format_empty_is_empty() {
        assert_eq!(MessageAccumulator::format(&[]), "");
    }
}

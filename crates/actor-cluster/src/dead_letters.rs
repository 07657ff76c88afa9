//! # Dead Letters
//!
//! Messages that could not be delivered. Addressing errors never fail a `tell`; they end up here,
//! are counted, logged at `info`, and published to subscribers.

use crate::identity::ActorId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadLetterReason {
    /// The recipient is stopped or never existed.
    Terminated,
    /// The recipient path is live under a different incarnation.
    IncarnationMismatch,
    MailboxFull,
    /// No usable association with the recipient's node.
    NoAssociation,
    WrongMessageType,
    DecodeFailed,
    EncodeFailed,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DeadLetterReason::Terminated => "recipient terminated",
            DeadLetterReason::IncarnationMismatch => "incarnation mismatch",
            DeadLetterReason::MailboxFull => "mailbox full",
            DeadLetterReason::NoAssociation => "no association",
            DeadLetterReason::WrongMessageType => "wrong message type",
            DeadLetterReason::DecodeFailed => "decode failed",
            DeadLetterReason::EncodeFailed => "encode failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub recipient: ActorId,
    /// Debug rendering of the message.
    pub message: String,
    pub reason: DeadLetterReason,
}

/// A message a sink refused, already rendered for the dead letter log.
#[derive(Debug)]
pub(crate) struct Undelivered {
    pub message: String,
    pub reason: DeadLetterReason,
}

impl Undelivered {
    pub(crate) fn of<M: fmt::Debug>(message: &M, reason: DeadLetterReason) -> Self {
        Self {
            message: format!("{message:?}"),
            reason,
        }
    }

    pub(crate) fn into_dead_letter(self, recipient: ActorId) -> DeadLetter {
        DeadLetter {
            recipient,
            message: self.message,
            reason: self.reason,
        }
    }
}

struct Inner {
    count: AtomicU64,
    published: broadcast::Sender<DeadLetter>,
}

/// Shared dead letter office of one actor system.
#[derive(Clone)]
pub struct DeadLetters {
    inner: Arc<Inner>,
}

impl DeadLetters {
    pub(crate) fn new() -> Self {
        let (published, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                count: AtomicU64::new(0),
                published,
            }),
        }
    }

    pub fn record(&self, letter: DeadLetter) {
        self.inner.count.fetch_add(1, Ordering::Relaxed);
        info!(
            reason = %letter.reason,
            "Message [{}] was not delivered to [{}]",
            letter.message,
            letter.recipient
        );
        let _ = self.inner.published.send(letter);
    }

    pub fn count(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeadLetter> {
        self.inner.published.subscribe()
    }
}

impl fmt::Debug for DeadLetters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetters")
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ActorPath, Node, UniqueNode};

    #[tokio::test]
    async fn test_record_counts_and_publishes() {
        let letters = DeadLetters::new();
        let mut subscriber = letters.subscribe();
        let recipient = ActorId::new(
            UniqueNode::new(Node::new("sys", "localhost", 1), 1),
            ActorPath::user().child("gone").unwrap(),
            1,
        );

        let undelivered = Undelivered::of(&"hello", DeadLetterReason::Terminated);
        letters.record(undelivered.into_dead_letter(recipient.clone()));

        assert_eq!(letters.count(), 1);
        let letter = subscriber.recv().await.unwrap();
        assert_eq!(letter.recipient, recipient);
        assert_eq!(letter.message, "\"hello\"");
        assert_eq!(letter.reason, DeadLetterReason::Terminated);
    }
}

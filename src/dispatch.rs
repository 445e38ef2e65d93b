pub mod priority_queue;
pub mod queue;
pub mod registry;

use std::fmt;

use crate::mail_source::{MailboxEntry, SendRequest};

pub use priority_queue::PriorityQueue;
pub use queue::{DeadLetter, DispatchQueue};
pub use registry::{QueueRegistry, StopFailures};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Sending,
    Receiving,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Sending => write!(f, "sending"),
            QueueKind::Receiving => write!(f, "receiving"),
        }
    }
}

/// Identifies a queue: one per account and direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub account: String,
    pub kind: QueueKind,
}

impl QueueId {
    pub fn sending(account: impl Into<String>) -> Self {
        QueueId { account: account.into(), kind: QueueKind::Sending }
    }

    pub fn receiving(account: impl Into<String>) -> Self {
        QueueId { account: account.into(), kind: QueueKind::Receiving }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.account, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Send { request: SendRequest, attempts: u32 },
    Receive(MailboxEntry),
}

/// A unit of work. Higher `priority` is served first; `key` is unique within
/// a queue. `index` is the entry's heap position while it is queued.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub priority: i32,
    pub key: String,
    pub index: usize,
    pub payload: Payload,
}

impl QueueEntry {
    pub fn send(priority: i32, request: SendRequest) -> Self {
        Self::resend(priority, request, 0)
    }

    /// A send entry that already failed `attempts` times.
    pub fn resend(priority: i32, request: SendRequest, attempts: u32) -> Self {
        QueueEntry {
            priority,
            key: format!("send:{}", request.id),
            index: 0,
            payload: Payload::Send { request, attempts },
        }
    }

    pub fn receive(priority: i32, entry: MailboxEntry) -> Self {
        QueueEntry {
            priority,
            key: format!("receive:{}:{}", entry.key, entry.id),
            index: 0,
            payload: Payload::Receive(entry),
        }
    }
}

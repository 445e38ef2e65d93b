use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{Payload, PriorityQueue, QueueEntry, QueueId, QueueKind};
use crate::error::{Error, Result};
use crate::mail_codec::IncomingMessage;
use crate::mail_source::{MessageSource, SendRequest};
use crate::settings::QueueConfig;

/// A send request that will not be retried any more.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub request: SendRequest,
    pub attempts: u32,
    pub reason: String,
}

struct Delayed {
    due: Instant,
    entry: QueueEntry,
}

/// A prioritized queue with one background worker. Sending queues deliver
/// their entries; receiving queues poll the account mailbox for new ones.
pub struct DispatchQueue {
    id: QueueId,
    source: Arc<dyn MessageSource>,
    config: QueueConfig,
    entries: Mutex<PriorityQueue>,
    delayed: Mutex<Vec<Delayed>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    // mailbox ids handed out or being read
    delivered: Mutex<HashSet<String>>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DispatchQueue {
    pub fn new(id: QueueId, source: Arc<dyn MessageSource>, config: QueueConfig) -> Arc<Self> {
        Arc::new(DispatchQueue {
            id,
            source,
            config,
            entries: Mutex::new(PriorityQueue::new()),
            delayed: Mutex::new(Vec::new()),
            dead_letters: Mutex::new(Vec::new()),
            delivered: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &QueueId {
        &self.id
    }

    pub fn push(&self, entry: QueueEntry) -> bool {
        locked(&self.entries).push(entry)
    }

    pub fn pop(&self) -> Option<QueueEntry> {
        locked(&self.entries).pop()
    }

    pub fn len(&self) -> usize {
        locked(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries waiting out a retry delay.
    pub fn pending_retries(&self) -> usize {
        locked(&self.delayed).len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        locked(&self.dead_letters).clone()
    }

    pub fn enqueue_send(&self, request: SendRequest) -> bool {
        let id = request.id.clone();
        let added = self.push(QueueEntry::send(self.config.send_priority, request));
        if added {
            debug!("[{}] queued message {}", self.id, id);
        } else {
            warn!("[{}] message {} is already queued", self.id, id);
        }
        added
    }

    /// Spawns the worker. Calling it again, or after `stop`, does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut workers = locked(&self.workers);
        if !workers.is_empty() || self.cancel.is_cancelled() {
            return;
        }
        let queue = Arc::clone(self);
        workers.push(tokio::spawn(queue.run()));
        info!("[{}] started", self.id);
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops the worker. An in-flight send is allowed to finish.
    pub async fn stop(&self) -> std::result::Result<(), JoinError> {
        self.cancel.cancel();
        let workers = std::mem::take(&mut *locked(&self.workers));

        let mut failure = None;
        for worker in workers {
            if let Err(err) = worker.await {
                error!("[{}] worker ended abnormally: {}", self.id, err);
                failure.get_or_insert(err);
            }
        }
        info!("[{}] stopped", self.id);
        failure.map_or(Ok(()), Err)
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.config.refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => match self.id.kind {
                    QueueKind::Sending => self.send_pending().await,
                    QueueKind::Receiving => self.poll().await,
                },
            }
        }
    }

    /// Delivers every queued entry whose retry delay is over.
    pub async fn send_pending(&self) {
        self.promote_due();
        while !self.cancel.is_cancelled() {
            let Some(QueueEntry { priority, payload, .. }) = self.pop() else {
                break;
            };
            match payload {
                Payload::Send { request, attempts } => self.send_one(priority, request, attempts).await,
                Payload::Receive(entry) => warn!("[{}] dropping mailbox entry {} from a sending queue", self.id, entry.id),
            }
        }
    }

    fn promote_due(&self) {
        let now = Instant::now();
        let due: Vec<QueueEntry> = {
            let mut delayed = locked(&self.delayed);
            let (due, waiting): (Vec<Delayed>, Vec<Delayed>) = std::mem::take(&mut *delayed).into_iter().partition(|item| item.due <= now);
            *delayed = waiting;
            due.into_iter().map(|item| item.entry).collect()
        };
        for entry in due {
            self.push(entry);
        }
    }

    // Sends in a separate task and files the outcome: done, retry later or dead letter.
    async fn send_one(&self, priority: i32, request: SendRequest, attempts: u32) {
        let (sender, receiver) = oneshot::channel();
        let source = Arc::clone(&self.source);
        let job = request.clone();
        tokio::spawn(async move {
            let _ = sender.send(source.send(&job).await);
        });

        let result = receiver.await.unwrap_or_else(|_| {
            Err(Error::Transport(io::Error::new(io::ErrorKind::Other, "send task ended without a result")))
        });
        let attempts = attempts + 1;

        match result {
            Ok(()) => info!("[{}] message {} sent", self.id, request.id),
            Err(err) if err.is_permanent() => self.bury(request, attempts, err),
            Err(err) if self.config.max_send_attempts > 0 && attempts >= self.config.max_send_attempts => {
                self.bury(request, attempts, err)
            }
            Err(err) => {
                let delay = self.config.backoff(attempts);
                warn!("[{}] message {} failed ({}), retrying in {:?}", self.id, request.id, err, delay);
                locked(&self.delayed).push(Delayed {
                    due: Instant::now() + delay,
                    entry: QueueEntry::resend(priority, request, attempts),
                });
            }
        }
    }

    fn bury(&self, request: SendRequest, attempts: u32, err: Error) {
        error!("[{}] giving up on message {} after {} attempt(s): {}", self.id, request.id, attempts, err);
        self.source.discard(&request);
        locked(&self.dead_letters).push(DeadLetter { request, attempts, reason: err.to_string() });
    }

    /// Lists the mailbox and queues every message not seen before.
    pub async fn poll(&self) {
        let listed = match self.source.stat(&self.id.account).await {
            Ok(listed) => listed,
            Err(err) => {
                error!("[{}] couldn't list mailbox: {}", self.id, err);
                return;
            }
        };

        let fresh: Vec<_> = {
            let mut delivered = locked(&self.delivered);
            let present: HashSet<&str> = listed.iter().map(|entry| entry.id.as_str()).collect();
            delivered.retain(|id| present.contains(id.as_str()));
            listed.iter().filter(|entry| !delivered.contains(&entry.id)).cloned().collect()
        };

        let added = fresh
            .into_iter()
            .filter(|entry| self.push(QueueEntry::receive(self.config.receive_priority, entry.clone())))
            .count();
        if added > 0 {
            info!("[{}] {} new message(s)", self.id, added);
        }
    }

    /// Reads every queued mailbox entry. Entries that could not be read stay
    /// queued; an error is returned only when nothing could be read.
    pub async fn receive_messages(&self) -> Result<Vec<IncomingMessage>> {
        let pending: Vec<QueueEntry> = {
            let mut entries = locked(&self.entries);
            std::iter::from_fn(|| entries.pop()).collect()
        };
        // Claimed before any read, so a poll racing with the loop below
        // cannot queue these entries again.
        {
            let mut delivered = locked(&self.delivered);
            for queued in &pending {
                if let Payload::Receive(entry) = &queued.payload {
                    delivered.insert(entry.id.clone());
                }
            }
        }

        let mut messages = Vec::new();
        let mut failure = None;
        for queued in pending {
            let Payload::Receive(entry) = queued.payload.clone() else {
                self.push(queued);
                continue;
            };

            match self.source.read(&entry).await {
                Ok(mut message) => {
                    if let Err(err) = message.parse_body() {
                        warn!("[{}] body of {} could not be parsed: {}", self.id, entry.id, err);
                    }
                    messages.push(message);
                }
                Err(Error::MessageGone(id)) => {
                    debug!("[{}] message {} left the mailbox before it was read", self.id, id);
                    locked(&self.delivered).remove(&entry.id);
                }
                Err(err) => {
                    error!("[{}] couldn't read message {}: {}", self.id, entry.id, err);
                    locked(&self.delivered).remove(&entry.id);
                    self.push(queued);
                    failure.get_or_insert(err);
                }
            }
        }

        match failure {
            Some(err) if messages.is_empty() => Err(err),
            _ => Ok(messages),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mail_source::MailboxEntry;
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::time::Duration;

    // In-memory stand-in for the mail servers.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub(crate) mailbox: Mutex<Vec<MailboxEntry>>,
        pub(crate) send_results: Mutex<VecDeque<Result<()>>>,
        pub(crate) always_fail: bool,
        pub(crate) sent: Mutex<Vec<SendRequest>>,
        pub(crate) broken_reads: Mutex<HashSet<String>>,
        pub(crate) read_delay: Option<Duration>,
        pub(crate) panic_on_stat: bool,
    }

    impl FakeSource {
        pub(crate) fn with_mailbox(ids: &[&str]) -> Self {
            let source = FakeSource::default();
            source.set_mailbox(ids);
            source
        }

        pub(crate) fn set_mailbox(&self, ids: &[&str]) {
            *self.mailbox.lock().unwrap() = ids
                .iter()
                .enumerate()
                .map(|(index, id)| MailboxEntry { key: "sales".to_string(), number: index as u32 + 1, id: id.to_string() })
                .collect();
        }
    }

    impl MessageSource for FakeSource {
        fn send<'a>(&'a self, request: &'a SendRequest) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.sent.lock().unwrap().push(request.clone());
                if self.always_fail {
                    return Err(Error::Smtp { message: "try later".to_string(), permanent: false });
                }
                self.send_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
            })
        }

        fn stat<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Vec<MailboxEntry>>> {
            Box::pin(async move {
                if self.panic_on_stat {
                    panic!("mailbox listing blew up");
                }
                Ok(self.mailbox.lock().unwrap().clone())
            })
        }

        fn read<'a>(&'a self, entry: &'a MailboxEntry) -> BoxFuture<'a, Result<IncomingMessage>> {
            Box::pin(async move {
                if let Some(delay) = self.read_delay {
                    tokio::time::sleep(delay).await;
                }
                if self.broken_reads.lock().unwrap().contains(&entry.id) {
                    return Err(Error::Transport(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
                }
                if !self.mailbox.lock().unwrap().iter().any(|listed| listed.id == entry.id) {
                    return Err(Error::MessageGone(entry.id.clone()));
                }
                let raw = format!(
                    "Subject: {}\r\nContent-Type: multipart/alternative; boundary=b\r\n\r\n--b\r\nContent-Type: text/plain\r\n\r\nhello\r\n--b--\r\n",
                    entry.id
                );
                IncomingMessage::from_bytes(raw.into_bytes())
            })
        }
    }

    fn config(max_send_attempts: u32) -> QueueConfig {
        QueueConfig { refresh_interval_seconds: 1, max_send_attempts, max_backoff_seconds: 8, ..Default::default() }
    }

    fn request(subject: &str) -> SendRequest {
        let mut request = SendRequest::new("sales");
        request.recipients = vec!["a@x.org".to_string()];
        request.subject = subject.to_string();
        request
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_in_priority_order() {
        let source = Arc::new(FakeSource::default());
        let queue = DispatchQueue::new(QueueId::sending("sales"), source.clone(), config(3));
        queue.push(QueueEntry::send(1, request("low")));
        queue.push(QueueEntry::send(9, request("high")));
        queue.start();

        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.stop().await.unwrap();

        let subjects: Vec<String> = source.sent.lock().unwrap().iter().map(|r| r.subject.clone()).collect();
        assert_eq!(subjects, vec!["high", "low"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let source = Arc::new(FakeSource::default());
        source
            .send_results
            .lock()
            .unwrap()
            .push_back(Err(Error::Transport(io::Error::new(io::ErrorKind::TimedOut, "timeout"))));
        let queue = DispatchQueue::new(QueueId::sending("sales"), source.clone(), config(5));
        queue.enqueue_send(request("retry me"));
        queue.start();

        tokio::time::sleep(Duration::from_secs(10)).await;
        queue.stop().await.unwrap();

        assert_eq!(source.sent.lock().unwrap().len(), 2);
        assert!(queue.dead_letters().is_empty());
        assert_eq!(queue.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let source = Arc::new(FakeSource::default());
        source.send_results.lock().unwrap().push_back(Err(Error::InvalidAddress("nobody".to_string())));
        let queue = DispatchQueue::new(QueueId::sending("sales"), source.clone(), config(5));
        queue.enqueue_send(request("bounce"));
        queue.start();

        tokio::time::sleep(Duration::from_secs(10)).await;
        queue.stop().await.unwrap();

        assert_eq!(source.sent.lock().unwrap().len(), 1);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 1);
        assert_eq!(dead[0].request.subject, "bounce");
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let source = Arc::new(FakeSource { always_fail: true, ..Default::default() });
        let queue = DispatchQueue::new(QueueId::sending("sales"), source.clone(), config(3));
        queue.enqueue_send(request("never"));
        queue.start();

        tokio::time::sleep(Duration::from_secs(120)).await;
        queue.stop().await.unwrap();

        assert_eq!(source.sent.lock().unwrap().len(), 3);
        assert_eq!(queue.dead_letters()[0].attempts, 3);
        assert!(queue.is_empty());
        assert_eq!(queue.pending_retries(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_send_is_ignored() {
        let queue = DispatchQueue::new(QueueId::sending("sales"), Arc::new(FakeSource::default()), config(3));
        let request = request("once");
        assert!(queue.enqueue_send(request.clone()));
        assert!(!queue.enqueue_send(request));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_and_receive() {
        let source = Arc::new(FakeSource::with_mailbox(&["uid-1", "uid-2"]));
        let queue = DispatchQueue::new(QueueId::receiving("sales"), source.clone(), config(3));

        queue.poll().await;
        queue.poll().await;
        assert_eq!(queue.len(), 2);

        let messages = queue.receive_messages().await.unwrap();
        let mut subjects: Vec<&str> = messages.iter().map(|message| message.subject()).collect();
        subjects.sort();
        assert_eq!(subjects, vec!["uid-1", "uid-2"]);
        assert_eq!(String::from_utf8_lossy(&messages[0].contents()[0].data).trim_end(), "hello");

        // already handed out
        queue.poll().await;
        assert!(queue.is_empty());

        // a message that left and came back is new again
        source.set_mailbox(&["uid-2"]);
        queue.poll().await;
        source.set_mailbox(&["uid-1", "uid-2"]);
        queue.poll().await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_during_receive_does_not_requeue() {
        let source = Arc::new(FakeSource { read_delay: Some(Duration::from_millis(100)), ..Default::default() });
        source.set_mailbox(&["uid-1", "uid-2"]);
        let queue = DispatchQueue::new(QueueId::receiving("sales"), source.clone(), config(3));
        queue.poll().await;

        let (first, ()) = tokio::join!(queue.receive_messages(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            queue.poll().await;
        });
        let first = first.unwrap();
        let second = queue.receive_messages().await.unwrap();

        let mut subjects: Vec<&str> = first.iter().chain(&second).map(|message| message.subject()).collect();
        subjects.sort();
        assert_eq!(subjects, vec!["uid-1", "uid-2"]);
    }

    #[tokio::test]
    async fn test_failed_read_stays_queued() {
        let source = Arc::new(FakeSource::with_mailbox(&["good", "bad"]));
        source.broken_reads.lock().unwrap().insert("bad".to_string());
        let queue = DispatchQueue::new(QueueId::receiving("sales"), source.clone(), config(3));

        queue.poll().await;
        let messages = queue.receive_messages().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(queue.len(), 1);

        // only the broken one is left, so the failure is reported
        assert!(matches!(queue.receive_messages().await, Err(Error::Transport(_))));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_vanished_message_is_dropped() {
        let source = Arc::new(FakeSource::with_mailbox(&["uid-1"]));
        let queue = DispatchQueue::new(QueueId::receiving("sales"), source.clone(), config(3));
        queue.poll().await;
        source.set_mailbox(&[]);
        assert!(queue.receive_messages().await.unwrap().is_empty());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_start_after_stop_does_nothing() {
        let queue = DispatchQueue::new(QueueId::receiving("sales"), Arc::new(FakeSource::default()), config(3));
        queue.start();
        queue.stop().await.unwrap();
        queue.start();
        assert!(queue.is_stopped());
        assert!(locked(&queue.workers).is_empty());
    }
}

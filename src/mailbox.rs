//! Mailbox status and the async FIFO queue behind in-process mailboxes.
//!
//! The queue supports blocking receive with an optional timeout and a
//! terminal close state: once closed, pushes and pops fail immediately
//! and any parked receiver is woken with [`QueueError::Closed`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::message::Message;

/// Lifecycle state of a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MailboxStatus {
    /// Never registered, or expired and garbage-collected.
    Missing,
    /// Registered and accepting messages.
    Active,
    /// Terminated; rejects all puts and gets.
    Terminated,
}

impl fmt::Display for MailboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Missing => "MISSING",
            Self::Active => "ACTIVE",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

impl MailboxStatus {
    /// Parses the wire rendering produced by [`fmt::Display`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MISSING" => Some(Self::Missing),
            "ACTIVE" => Some(Self::Active),
            "TERMINATED" => Some(Self::Terminated),
            _ => None,
        }
    }
}

/// Errors from [`MessageQueue`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum QueueError {
    /// The queue was closed.
    #[error("queue is closed")]
    Closed,
    /// No message arrived before the timeout elapsed.
    #[error("timed out waiting for a message")]
    Timeout,
}

struct QueueInner {
    deque: VecDeque<Message>,
    closed: bool,
}

/// An async multi-producer, single-consumer FIFO queue of messages.
///
/// FIFO holds between any single producer and the consumer. An
/// optional capacity turns `push` into a suspending operation when the
/// queue is full.
pub(crate) struct MessageQueue {
    inner: Mutex<QueueInner>,
    recv_notify: Notify,
    send_notify: Notify,
    capacity: Option<usize>,
}

impl MessageQueue {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                deque: VecDeque::new(),
                closed: false,
            }),
            recv_notify: Notify::new(),
            send_notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueues a message, suspending while a bounded queue is full.
    pub(crate) async fn push(&self, message: Message) -> Result<(), QueueError> {
        let mut pending = Some(message);
        loop {
            let notified = self.send_notify.notified();
            tokio::pin!(notified);
            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(QueueError::Closed);
                }
                let has_room = self.capacity.is_none_or(|cap| inner.deque.len() < cap);
                if has_room {
                    if let Some(message) = pending.take() {
                        inner.deque.push_back(message);
                    }
                    drop(inner);
                    self.recv_notify.notify_one();
                    return Ok(());
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Dequeues the next message, suspending until one is available,
    /// the queue closes, or the timeout elapses.
    pub(crate) async fn pop(&self, timeout: Option<Duration>) -> Result<Message, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.recv_notify.notified();
            tokio::pin!(notified);
            {
                let mut inner = self.lock();
                if let Some(message) = inner.deque.pop_front() {
                    drop(inner);
                    self.send_notify.notify_one();
                    return Ok(message);
                }
                if inner.closed {
                    return Err(QueueError::Closed);
                }
                notified.as_mut().enable();
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(QueueError::Timeout);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Removes and returns every queued message without closing.
    pub(crate) fn drain(&self) -> Vec<Message> {
        let mut inner = self.lock();
        let drained: Vec<Message> = inner.deque.drain(..).collect();
        drop(inner);
        if !drained.is_empty() {
            self.send_notify.notify_waiters();
        }
        drained
    }

    /// Closes the queue, waking every parked sender and receiver.
    /// Remaining messages are discarded.
    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.deque.clear();
        drop(inner);
        self.recv_notify.notify_waiters();
        self.send_notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{EntityId, UserId};
    use crate::message::RequestBody;
    use std::sync::Arc;
    use uuid::Uuid;

    fn ping(src: &EntityId, dest: &EntityId) -> Message {
        Message::request(src.clone(), dest.clone(), Uuid::new_v4(), RequestBody::Ping)
    }

    #[tokio::test]
    async fn pop_returns_messages_in_fifo_order() {
        let queue = MessageQueue::new(None);
        let src = EntityId::from(UserId::new(None));
        let dest = EntityId::from(UserId::new(None));

        let first = ping(&src, &dest);
        let second = ping(&src, &dest);
        queue.push(first.clone()).await.unwrap();
        queue.push(second.clone()).await.unwrap();

        assert_eq!(queue.pop(None).await.unwrap().tag, first.tag);
        assert_eq!(queue.pop(None).await.unwrap().tag, second.tag);
    }

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let queue = MessageQueue::new(None);
        let result = queue.pop(Some(Duration::from_millis(20))).await;
        assert_eq!(result.unwrap_err(), QueueError::Timeout);
    }

    #[tokio::test]
    async fn close_wakes_parked_receiver() {
        let queue = Arc::new(MessageQueue::new(None));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), QueueError::Closed);
    }

    #[tokio::test]
    async fn bounded_push_waits_for_space() {
        let queue = Arc::new(MessageQueue::new(Some(1)));
        let src = EntityId::from(UserId::new(None));
        let dest = EntityId::from(UserId::new(None));
        queue.push(ping(&src, &dest)).await.unwrap();

        let blocked = {
            let queue = Arc::clone(&queue);
            let msg = ping(&src, &dest);
            tokio::spawn(async move { queue.push(msg).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        queue.pop(None).await.unwrap();
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn push_after_close_fails() {
        let queue = MessageQueue::new(None);
        queue.close();
        let src = EntityId::from(UserId::new(None));
        let dest = EntityId::from(UserId::new(None));
        assert_eq!(
            queue.push(ping(&src, &dest)).await.unwrap_err(),
            QueueError::Closed
        );
    }
}

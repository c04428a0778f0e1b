//! Correlation channel — hands replies from the reply loop to the waiting
//! `send_command` call.
//!
//! Replies are buffered up to a fixed capacity; once full, the oldest unread
//! reply is discarded. Starting a new command clears whatever is left over so
//! a late answer to a timed-out command is never mistaken for the new one.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use homebus_domain::message::{BusMessage, ReplyAddress};

/// Buffer shared between the reply loop and command callers.
#[derive(Debug)]
pub struct CorrelationChannel {
    capacity: usize,
    replies: Mutex<VecDeque<BusMessage>>,
    arrived: Notify,
}

impl CorrelationChannel {
    /// Create a channel buffering at most `capacity` unread replies.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            replies: Mutex::new(VecDeque::with_capacity(capacity)),
            arrived: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<BusMessage>> {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer a reply, discarding the oldest one when full.
    pub fn offer(&self, reply: BusMessage) {
        {
            let mut replies = self.lock();
            if replies.len() >= self.capacity {
                replies.pop_front();
                tracing::debug!(capacity = self.capacity, "reply buffer full, dropped oldest reply");
            }
            replies.push_back(reply);
        }
        self.arrived.notify_one();
    }

    /// Drop every unread reply, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut replies = self.lock();
        let dropped = replies.len();
        replies.clear();
        dropped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Open the correlation slot for a command answered at `reply_to`.
    ///
    /// Stale replies from earlier commands are discarded.
    pub fn begin(&self, reply_to: ReplyAddress) -> PendingReply<'_> {
        let dropped = self.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "discarded stale replies");
        }
        PendingReply {
            channel: self,
            reply_to,
            created: Instant::now(),
        }
    }

    fn pop(&self) -> Option<BusMessage> {
        self.lock().pop_front()
    }

    async fn take_until(&self, deadline: Instant) -> Option<BusMessage> {
        tokio::time::timeout_at(deadline, async {
            loop {
                if let Some(reply) = self.pop() {
                    return reply;
                }
                self.arrived.notified().await;
            }
        })
        .await
        .ok()
    }
}

/// The single outstanding command awaiting its reply.
#[derive(Debug)]
pub struct PendingReply<'a> {
    channel: &'a CorrelationChannel,
    reply_to: ReplyAddress,
    created: Instant,
}

impl PendingReply<'_> {
    #[must_use]
    pub fn reply_to(&self) -> &ReplyAddress {
        &self.reply_to
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    /// Wait up to `timeout` for a first reply, then keep draining for `grace`
    /// and return the last reply seen.
    ///
    /// A bare acknowledgement never replaces a reply with content; it is
    /// returned only when nothing else arrived.
    ///
    /// Returns `None` when nothing arrived within `timeout`.
    pub async fn wait(self, timeout: Duration, grace: Duration) -> Option<BusMessage> {
        let mut latest = self.channel.take_until(self.created + timeout).await?;
        let drain_until = Instant::now() + grace;
        for _ in 0..self.channel.capacity {
            let Some(reply) = self.channel.take_until(drain_until).await else {
                break;
            };
            if reply.is_acknowledgement() && !latest.is_acknowledgement() {
                tracing::trace!(reply_to = %self.reply_to, "ignoring acknowledgement after reply");
                continue;
            }
            tracing::debug!(reply_to = %self.reply_to, "newer reply superseded previous one");
            latest = reply;
        }
        Some(latest)
    }
}

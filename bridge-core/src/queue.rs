//! Single-flight pending queue for one relay session.
//!
//! Requests are kept in strict FIFO order and only the head is ever on the
//! wire. The head is resent until the relay confirms delivery with a
//! receipt; after that the queue waits for the device's response. The
//! decision of what to do with the head at a given instant is made by
//! [`RetryPolicy::evaluate`], which the relay client calls on every tick.
//!
//! Timestamps are plain milliseconds on a caller-chosen monotonic clock.

use std::collections::VecDeque;
use std::time::Duration;

use thiserror::Error;

/// Error type for queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Queue is at capacity.
    #[error("pending queue full (capacity: {capacity})")]
    Full {
        /// Queue capacity.
        capacity: usize,
    },
}

/// A request waiting for its turn or in flight.
#[derive(Debug)]
pub struct PendingRequest<T> {
    /// Correlation id.
    pub id: String,
    /// Encrypted content to transmit.
    pub payload: String,
    /// Number of transmissions so far.
    pub attempts: u32,
    /// When the request was enqueued.
    pub enqueued_at: u64,
    /// When the request was last transmitted.
    pub last_sent: Option<u64>,
    /// Whether the relay confirmed delivery.
    pub receipted: bool,
    /// How long to wait for the response after the last transmission.
    pub response_timeout: Duration,
    /// Completion handle owned by the caller.
    pub completion: T,
}

/// FIFO of pending requests; only the head is ever in flight.
#[derive(Debug)]
pub struct PendingQueue<T> {
    max_size: usize,
    items: VecDeque<PendingRequest<T>>,
}

impl<T> PendingQueue<T> {
    /// Create a queue holding at most `max_size` requests.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            items: VecDeque::new(),
        }
    }

    /// Append a request at the tail.
    ///
    /// Returns `true` when the new request is the head, i.e. the queue was
    /// idle and transmission should start.
    pub fn enqueue(
        &mut self,
        id: impl Into<String>,
        payload: String,
        response_timeout: Duration,
        completion: T,
        now: u64,
    ) -> Result<bool, QueueError> {
        if self.items.len() >= self.max_size {
            return Err(QueueError::Full {
                capacity: self.max_size,
            });
        }
        self.items.push_back(PendingRequest {
            id: id.into(),
            payload,
            attempts: 0,
            enqueued_at: now,
            last_sent: None,
            receipted: false,
            response_timeout,
            completion,
        });
        Ok(self.items.len() == 1)
    }

    /// The request in flight, if any.
    pub fn head(&self) -> Option<&PendingRequest<T>> {
        self.items.front()
    }

    /// Record a transmission of the head and return its payload.
    pub fn record_send(&mut self, now: u64) -> Option<(String, String, u32)> {
        let head = self.items.front_mut()?;
        head.attempts += 1;
        head.last_sent = Some(now);
        Some((head.id.clone(), head.payload.clone(), head.attempts))
    }

    /// Mark the head as delivered. Receipts for anything but the head are
    /// stale and ignored.
    pub fn mark_receipt(&mut self, id: &str) -> bool {
        match self.items.front_mut() {
            Some(head) if head.id == id => {
                head.receipted = true;
                true
            }
            _ => false,
        }
    }

    /// Remove the head if it carries `id`.
    pub fn take_head_if(&mut self, id: &str) -> Option<PendingRequest<T>> {
        if self.items.front().map(|h| h.id == id).unwrap_or(false) {
            self.items.pop_front()
        } else {
            None
        }
    }

    /// Remove the request carrying `id`, wherever it sits.
    pub fn remove(&mut self, id: &str) -> Option<PendingRequest<T>> {
        let pos = self.items.iter().position(|r| r.id == id)?;
        self.items.remove(pos)
    }

    /// Remove the head unconditionally.
    pub fn advance(&mut self) -> Option<PendingRequest<T>> {
        self.items.pop_front()
    }

    /// Remove everything.
    pub fn drain(&mut self) -> Vec<PendingRequest<T>> {
        self.items.drain(..).collect()
    }

    /// Ids in queue order.
    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|r| r.id.clone()).collect()
    }

    /// Number of requests queued (including the head).
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// What to do with the head of the queue right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Never transmitted; send it.
    Send,
    /// Keep waiting.
    Wait,
    /// No receipt within the retry delay; transmit again.
    Resend,
    /// Give up with a timeout and move on. The transport is suspect and must
    /// be reconnected before the next send.
    Expire {
        /// Whether the request had been receipted.
        receipted: bool,
    },
}

/// Retry and timeout constants for a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Transmissions allowed before giving up on a receipt.
    pub max_attempts: u32,
    /// Wait after a transmission before resending.
    pub retry_delay: Duration,
}

impl RetryPolicy {
    /// Decide what to do with `request` at `now`.
    pub fn evaluate<T>(&self, request: &PendingRequest<T>, now: u64) -> Verdict {
        let Some(sent) = request.last_sent else {
            return Verdict::Send;
        };
        let elapsed = now.saturating_sub(sent);
        if !request.receipted {
            if elapsed > self.retry_delay.as_millis() as u64 {
                if request.attempts < self.max_attempts {
                    Verdict::Resend
                } else {
                    Verdict::Expire { receipted: false }
                }
            } else {
                Verdict::Wait
            }
        } else if elapsed > request.response_timeout.as_millis() as u64 {
            Verdict::Expire { receipted: true }
        } else {
            Verdict::Wait
        }
    }

    /// Whether `attempts` is the final permitted transmission.
    pub fn is_last_attempt(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn queue_abc() -> PendingQueue<&'static str> {
        let mut q = PendingQueue::new(16);
        assert!(q.enqueue("a", "A".into(), MINUTE, "a", 0).unwrap());
        assert!(!q.enqueue("b", "B".into(), MINUTE, "b", 0).unwrap());
        assert!(!q.enqueue("c", "C".into(), MINUTE, "c", 0).unwrap());
        q
    }

    #[test]
    fn only_head_is_transmitted() {
        let mut q = queue_abc();
        let (id, payload, attempt) = q.record_send(0).unwrap();
        assert_eq!((id.as_str(), payload.as_str(), attempt), ("a", "A", 1));

        // Resending still targets A until it settles.
        let (id, _, attempt) = q.record_send(6000).unwrap();
        assert_eq!((id.as_str(), attempt), ("a", 2));

        let done = q.take_head_if("a").unwrap();
        assert_eq!(done.completion, "a");
        let (id, _, _) = q.record_send(7000).unwrap();
        assert_eq!(id, "b");
    }

    #[test]
    fn response_for_non_head_is_ignored() {
        let mut q = queue_abc();
        q.record_send(0);
        assert!(q.take_head_if("b").is_none());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn receipt_only_marks_head() {
        let mut q = queue_abc();
        assert!(!q.mark_receipt("b"));
        assert!(q.mark_receipt("a"));
        assert!(q.head().unwrap().receipted);
    }

    #[test]
    fn respects_capacity() {
        let mut q = PendingQueue::new(1);
        q.enqueue("a", String::new(), MINUTE, (), 0).unwrap();
        assert_eq!(
            q.enqueue("b", String::new(), MINUTE, (), 0).unwrap_err(),
            QueueError::Full { capacity: 1 }
        );
    }

    #[test]
    fn policy_sends_unsent_head() {
        let q = queue_abc();
        assert_eq!(
            RetryPolicy::default().evaluate(q.head().unwrap(), 0),
            Verdict::Send
        );
    }

    #[test]
    fn policy_resends_without_receipt() {
        let policy = RetryPolicy::default();
        let mut q = queue_abc();
        q.record_send(1000);
        assert_eq!(policy.evaluate(q.head().unwrap(), 5000), Verdict::Wait);
        assert_eq!(policy.evaluate(q.head().unwrap(), 6001), Verdict::Resend);
    }

    #[test]
    fn policy_expires_after_max_attempts() {
        let policy = RetryPolicy::default();
        let mut q = queue_abc();
        q.record_send(0);
        q.record_send(6000);
        q.record_send(12000);
        assert!(policy.is_last_attempt(q.head().unwrap().attempts));
        assert_eq!(
            policy.evaluate(q.head().unwrap(), 17001),
            Verdict::Expire { receipted: false }
        );
    }

    #[test]
    fn policy_waits_for_response_after_receipt() {
        let policy = RetryPolicy::default();
        let mut q = queue_abc();
        q.record_send(0);
        q.mark_receipt("a");
        assert_eq!(policy.evaluate(q.head().unwrap(), 30_000), Verdict::Wait);
        assert_eq!(
            policy.evaluate(q.head().unwrap(), 60_001),
            Verdict::Expire { receipted: true }
        );
    }

    #[test]
    fn per_request_timeout_honoured() {
        let policy = RetryPolicy::default();
        let mut q = PendingQueue::new(4);
        q.enqueue("x", String::new(), Duration::from_secs(2), (), 0)
            .unwrap();
        q.record_send(0);
        q.mark_receipt("x");
        assert_eq!(
            policy.evaluate(q.head().unwrap(), 2001),
            Verdict::Expire { receipted: true }
        );
    }

    #[test]
    fn remove_from_middle_keeps_order() {
        let mut q = queue_abc();
        assert_eq!(q.remove("b").unwrap().completion, "b");
        assert!(q.remove("b").is_none());
        assert_eq!(q.ids(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn drain_returns_in_order() {
        let mut q = queue_abc();
        let drained: Vec<_> = q.drain().into_iter().map(|r| r.completion).collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(q.is_empty());
    }
}

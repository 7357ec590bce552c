use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::consumer::message_envelope::{MessageEnvelope, MAX_PRIORITY};

/// How long a receive call waits for a message.
///
/// The integer rendering follows the broker's pull semantics: negative values mean 'do not wait',
///  zero means 'wait without limit', positive values are a timeout in milliseconds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReceiveTimeout {
    NoWait,
    Forever,
    After(Duration),
}

impl From<i64> for ReceiveTimeout {
    fn from(value: i64) -> Self {
        match value {
            v if v < 0 => ReceiveTimeout::NoWait,
            0 => ReceiveTimeout::Forever,
            v => ReceiveTimeout::After(Duration::from_millis(v as u64)),
        }
    }
}

impl From<ReceiveTimeout> for i64 {
    fn from(value: ReceiveTimeout) -> Self {
        match value {
            ReceiveTimeout::NoWait => -1,
            ReceiveTimeout::Forever => 0,
            ReceiveTimeout::After(d) => d.as_millis().clamp(1, i64::MAX as u128) as i64,
        }
    }
}

/// Ordering of envelopes that were not put at the queue's head
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QueueOrdering {
    Fifo,
    /// highest priority first, FIFO among equal priorities
    Priority,
}

enum QueueEntries {
    Fifo(VecDeque<Arc<MessageEnvelope>>),
    Priority(Vec<VecDeque<Arc<MessageEnvelope>>>),
}

impl QueueEntries {
    fn new(ordering: QueueOrdering) -> QueueEntries {
        match ordering {
            QueueOrdering::Fifo => QueueEntries::Fifo(VecDeque::new()),
            QueueOrdering::Priority => QueueEntries::Priority((0..=MAX_PRIORITY).map(|_| VecDeque::new()).collect()),
        }
    }

    fn push(&mut self, envelope: Arc<MessageEnvelope>) {
        match self {
            QueueEntries::Fifo(q) => q.push_back(envelope),
            QueueEntries::Priority(levels) => {
                let level = envelope.priority() as usize;
                levels[level].push_back(envelope);
            }
        }
    }

    fn pop(&mut self) -> Option<Arc<MessageEnvelope>> {
        match self {
            QueueEntries::Fifo(q) => q.pop_front(),
            QueueEntries::Priority(levels) => levels.iter_mut()
                .rev()
                .find_map(|q| q.pop_front()),
        }
    }

    fn len(&self) -> usize {
        match self {
            QueueEntries::Fifo(q) => q.len(),
            QueueEntries::Priority(levels) => levels.iter().map(|q| q.len()).sum(),
        }
    }

    fn clear(&mut self) {
        match self {
            QueueEntries::Fifo(q) => q.clear(),
            QueueEntries::Priority(levels) => levels.iter_mut().for_each(|q| q.clear()),
        }
    }
}

struct QueueInner {
    /// envelopes put at the head, drained before everything else and in the order they were put
    head: VecDeque<Arc<MessageEnvelope>>,
    entries: QueueEntries,
    running: bool,
    closed: bool,
}

impl QueueInner {
    fn pop(&mut self) -> Option<Arc<MessageEnvelope>> {
        self.head.pop_front()
            .or_else(|| self.entries.pop())
    }
}

/// A consumer's local buffer of envelopes that arrived from the broker but were not yet handed
///  to the application.
///
/// A new queue is stopped: dequeue calls return `None` until it is started.
pub struct DispatchQueue {
    inner: Mutex<QueueInner>,
    changed: Notify,
}

impl DispatchQueue {
    pub fn new(ordering: QueueOrdering) -> DispatchQueue {
        DispatchQueue {
            inner: Mutex::new(QueueInner {
                head: VecDeque::new(),
                entries: QueueEntries::new(ordering),
                running: false,
                closed: false,
            }),
            changed: Notify::new(),
        }
    }

    /// returns `false` if the queue is closed and the envelope was discarded
    pub fn enqueue(&self, envelope: Arc<MessageEnvelope>) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.entries.push(envelope);
        }
        self.changed.notify_waiters();
        true
    }

    /// Puts an envelope ahead of all ordinary entries. Envelopes put at the head keep their
    ///  relative order, so a batch of redeliveries is observed in the order it was redelivered.
    pub fn enqueue_first(&self, envelope: Arc<MessageEnvelope>) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.head.push_back(envelope);
        }
        self.changed.notify_waiters();
        true
    }

    /// Waits for an envelope. `None` as a timeout waits until an envelope is available or the
    ///  queue is stopped or closed.
    ///
    /// Returns `None` if the queue is (or becomes) stopped or closed, or if the timeout expires.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Option<Arc<MessageEnvelope>> {
        // NB: a timeout too large to represent as an instant means no deadline
        let deadline = timeout.and_then(|d| Instant::now().checked_add(d));

        loop {
            let notified = self.changed.notified();
            {
                let mut inner = self.inner.lock();
                if inner.closed || !inner.running {
                    return None;
                }
                if let Some(envelope) = inner.pop() {
                    return Some(envelope);
                }
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    pub fn dequeue_no_wait(&self) -> Option<Arc<MessageEnvelope>> {
        let mut inner = self.inner.lock();
        if inner.closed || !inner.running {
            return None;
        }
        inner.pop()
    }

    /// Drains the queue in dequeue order, regardless of whether it is running
    pub fn remove_all(&self) -> Vec<Arc<MessageEnvelope>> {
        let mut inner = self.inner.lock();
        let mut result = Vec::with_capacity(inner.head.len() + inner.entries.len());
        while let Some(envelope) = inner.pop() {
            result.push(envelope);
        }
        result
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.head.clear();
        inner.entries.clear();
    }

    pub fn start(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.running = true;
        }
        self.changed.notify_waiters();
    }

    /// Blocked dequeue calls return `None`, buffered envelopes are kept
    pub fn stop(&self) {
        self.inner.lock().running = false;
        self.changed.notify_waiters();
    }

    /// Discards all buffered envelopes and wakes all blocked dequeue calls. A closed queue can not
    ///  be restarted.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.running = false;
            inner.head.clear();
            inner.entries.clear();
        }
        self.changed.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.head.len() + inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;
    use super::*;
    use crate::test_util::envelope::{envelope, test_consumer_id};

    fn drain(queue: &DispatchQueue) -> Vec<u64> {
        let mut result = Vec::new();
        while let Some(e) = queue.dequeue_no_wait() {
            result.push(e.delivery_id);
        }
        result
    }

    fn started(ordering: QueueOrdering) -> DispatchQueue {
        let queue = DispatchQueue::new(ordering);
        queue.start();
        queue
    }

    #[rstest]
    #[case::fifo(QueueOrdering::Fifo, vec![(1, 4), (2, 9), (3, 0), (4, 4)], vec![1, 2, 3, 4])]
    #[case::priority(QueueOrdering::Priority, vec![(1, 4), (2, 9), (3, 0), (4, 4)], vec![2, 1, 4, 3])]
    #[case::priority_equal(QueueOrdering::Priority, vec![(1, 5), (2, 5), (3, 5)], vec![1, 2, 3])]
    #[case::priority_clamped(QueueOrdering::Priority, vec![(1, 9), (2, 200)], vec![1, 2])]
    fn test_drain_order(#[case] ordering: QueueOrdering, #[case] arrivals: Vec<(u64, u8)>, #[case] expected: Vec<u64>) {
        let queue = started(ordering);
        for (id, priority) in arrivals {
            queue.enqueue(Arc::new(envelope(id).with_priority(priority)));
        }
        assert_eq!(drain(&queue), expected);
    }

    #[rstest]
    #[case::fifo(QueueOrdering::Fifo)]
    #[case::priority(QueueOrdering::Priority)]
    fn test_enqueue_first_keeps_relative_order(#[case] ordering: QueueOrdering) {
        let queue = started(ordering);
        queue.enqueue(Arc::new(envelope(10)));
        queue.enqueue(Arc::new(envelope(11).with_priority(9)));
        queue.enqueue_first(Arc::new(envelope(1)));
        queue.enqueue_first(Arc::new(envelope(2)));
        queue.enqueue_first(Arc::new(envelope(3)));

        assert_eq!(drain(&queue)[..3], [1, 2, 3]);
    }

    #[test]
    fn test_stopped_queue_keeps_entries() {
        let queue = DispatchQueue::new(QueueOrdering::Fifo);
        queue.enqueue(Arc::new(envelope(1)));
        assert!(queue.dequeue_no_wait().is_none());
        assert_eq!(queue.len(), 1);

        queue.start();
        queue.stop();
        assert!(queue.dequeue_no_wait().is_none());

        queue.start();
        assert_eq!(queue.dequeue_no_wait().map(|e| e.delivery_id), Some(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_all_and_clear() {
        let queue = DispatchQueue::new(QueueOrdering::Fifo);
        queue.enqueue(Arc::new(envelope(2)));
        queue.enqueue_first(Arc::new(envelope(1)));
        queue.enqueue(Arc::new(envelope(3)));

        let removed = queue.remove_all().iter().map(|e| e.delivery_id).collect::<Vec<_>>();
        assert_eq!(removed, vec![1, 2, 3]);
        assert!(queue.is_empty());

        queue.enqueue(Arc::new(envelope(4)));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closed_queue_discards() {
        let queue = started(QueueOrdering::Fifo);
        queue.enqueue(Arc::new(envelope(1)));
        queue.close();

        assert!(queue.is_empty());
        assert!(!queue.enqueue(Arc::new(envelope(2))));
        assert!(!queue.enqueue_first(Arc::new(envelope(3))));

        queue.start();
        assert!(!queue.is_running());
        assert!(queue.dequeue_no_wait().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = Arc::new(started(QueueOrdering::Fifo));

        let q2 = queue.clone();
        let handle = tokio::spawn(async move {
            q2.dequeue(None).await.map(|e| e.delivery_id)
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.enqueue(Arc::new(MessageEnvelope::new(test_consumer_id(), 7, Bytes::from_static(b"x"))));

        assert_eq!(handle.await.unwrap(), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_timeout() {
        let queue = started(QueueOrdering::Fifo);
        let before = Instant::now();

        assert!(queue.dequeue(Some(Duration::from_millis(50))).await.is_none());
        assert!(before.elapsed() >= Duration::from_millis(50));

        queue.enqueue(Arc::new(envelope(1)));
        assert_eq!(queue.dequeue(Some(Duration::from_millis(50))).await.map(|e| e.delivery_id), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_with_unrepresentable_timeout() {
        let queue = Arc::new(started(QueueOrdering::Fifo));
        queue.enqueue(Arc::new(envelope(1)));
        assert_eq!(queue.dequeue(Some(Duration::MAX)).await.map(|e| e.delivery_id), Some(1));

        let q2 = queue.clone();
        let handle = tokio::spawn(async move {
            q2.dequeue(Some(Duration::MAX)).await.map(|e| e.delivery_id)
        });
        tokio::time::sleep(Duration::from_secs(3600)).await;
        queue.enqueue(Arc::new(envelope(2)));
        assert_eq!(handle.await.unwrap(), Some(2));
    }

    #[rstest]
    #[case::close(true)]
    #[case::stop(false)]
    #[tokio::test(start_paused = true)]
    async fn test_blocked_dequeue_is_woken(#[case] close: bool) {
        let queue = Arc::new(started(QueueOrdering::Fifo));

        let handles = (0..3)
            .map(|_| {
                let q = queue.clone();
                tokio::spawn(async move { q.dequeue(None).await.is_none() })
            })
            .collect::<Vec<_>>();

        tokio::time::sleep(Duration::from_millis(10)).await;
        if close {
            queue.close();
        }
        else {
            queue.stop();
        }

        for h in handles {
            assert!(h.await.unwrap());
        }
    }

    #[rstest]
    #[case::negative(-5, ReceiveTimeout::NoWait)]
    #[case::zero(0, ReceiveTimeout::Forever)]
    #[case::positive(250, ReceiveTimeout::After(Duration::from_millis(250)))]
    fn test_receive_timeout_from_i64(#[case] raw: i64, #[case] expected: ReceiveTimeout) {
        assert_eq!(ReceiveTimeout::from(raw), expected);
        assert_eq!(ReceiveTimeout::from(i64::from(expected)), expected);
    }
}

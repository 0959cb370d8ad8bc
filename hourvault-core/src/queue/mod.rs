//! Bounded ingestion queue
//!
//! Decouples datagram receipt from storage. Exactly one producer (the
//! listener) and one consumer (the writer) share a bounded channel; when
//! the channel is full, new records are dropped instead of blocking the
//! listener, which bounds memory under sustained overload.

mod stats;

pub use stats::{QueueStats, QueueStatsSnapshot};

use crate::LogRecord;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

/// Create a queue holding at most `capacity` pending records
///
/// `capacity` must be non-zero; a zero-capacity channel would be a
/// rendezvous point and could never buffer a record.
pub fn bounded(capacity: usize) -> (QueueProducer, QueueConsumer) {
    debug_assert!(capacity > 0, "queue capacity must be non-zero");
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let stats = Arc::new(QueueStats::default());

    (
        QueueProducer {
            tx,
            capacity,
            stats: stats.clone(),
        },
        QueueConsumer { rx, stats },
    )
}

/// Outcome of a bounded wait on the queue
#[derive(Debug)]
pub enum Dequeued {
    /// Next record in FIFO order
    Record(LogRecord),
    /// Nothing arrived within the wait
    Idle,
    /// Producer is gone and every pending record has been taken
    Closed,
}

/// Sending half, owned by the listener
#[derive(Debug)]
pub struct QueueProducer {
    tx: Sender<LogRecord>,
    capacity: usize,
    stats: Arc<QueueStats>,
}

impl QueueProducer {
    /// Append a record; returns `false` and drops it when the queue is full
    pub fn enqueue(&self, record: LogRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.stats.record_enqueued();
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.record_dropped();
                false
            }
        }
    }

    /// Records currently pending
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }
}

/// Receiving half, owned by the writer
#[derive(Debug)]
pub struct QueueConsumer {
    rx: Receiver<LogRecord>,
    stats: Arc<QueueStats>,
}

impl QueueConsumer {
    /// Take the oldest record without blocking
    pub fn try_dequeue(&self) -> Option<LogRecord> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next record
    ///
    /// Wakes as soon as a record is enqueued.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Dequeued {
        match self.rx.recv_timeout(timeout) {
            Ok(record) => Dequeued::Record(record),
            Err(RecvTimeoutError::Timeout) => Dequeued::Idle,
            Err(RecvTimeoutError::Disconnected) => Dequeued::Closed,
        }
    }

    /// Records currently pending
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn record(i: i64) -> LogRecord {
        LogRecord::new(i, "127.0.0.1", format!("msg-{}", i))
    }

    #[test]
    fn test_queue_fifo() {
        let (producer, consumer) = bounded(16);
        for i in 0..10 {
            assert!(producer.enqueue(record(i)));
        }
        assert_eq!(producer.len(), 10);

        for i in 0..10 {
            assert_eq!(consumer.try_dequeue().unwrap().received_at(), i);
        }
        assert!(consumer.try_dequeue().is_none());
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_queue_drops_at_capacity() {
        let (producer, consumer) = bounded(3);
        assert!(producer.enqueue(record(0)));
        assert!(producer.enqueue(record(1)));
        assert!(producer.enqueue(record(2)));

        // Full: every further enqueue is rejected until the consumer drains
        assert!(!producer.enqueue(record(3)));
        assert!(!producer.enqueue(record(4)));
        assert_eq!(producer.len(), 3);

        assert_eq!(consumer.try_dequeue().unwrap().received_at(), 0);
        assert!(producer.enqueue(record(5)));

        let drained: Vec<_> = std::iter::from_fn(|| consumer.try_dequeue())
            .map(|r| r.received_at())
            .collect();
        assert_eq!(drained, vec![1, 2, 5]);

        let stats = consumer.stats().snapshot();
        assert_eq!(stats.enqueued, 4);
        assert_eq!(stats.dropped, 2);
    }

    #[test]
    fn test_queue_closed_after_drain() {
        let (producer, consumer) = bounded(4);
        producer.enqueue(record(7));
        drop(producer);

        match consumer.dequeue_timeout(Duration::from_millis(10)) {
            Dequeued::Record(r) => assert_eq!(r.received_at(), 7),
            other => panic!("expected record, got {:?}", other),
        }
        assert!(matches!(
            consumer.dequeue_timeout(Duration::from_millis(10)),
            Dequeued::Closed
        ));
    }

    #[test]
    fn test_queue_idle_timeout() {
        let (_producer, consumer) = bounded(4);
        assert!(matches!(
            consumer.dequeue_timeout(Duration::from_millis(5)),
            Dequeued::Idle
        ));
    }

    #[test]
    fn test_queue_concurrent_order() {
        let (producer, consumer) = bounded(1_000);
        let handle = thread::spawn(move || {
            for i in 0..5_000 {
                while !producer.enqueue(record(i)) {
                    thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        loop {
            match consumer.dequeue_timeout(Duration::from_secs(5)) {
                Dequeued::Record(r) => {
                    assert_eq!(r.received_at(), expected);
                    expected += 1;
                }
                Dequeued::Idle => panic!("producer stalled"),
                Dequeued::Closed => break,
            }
        }
        handle.join().unwrap();
        assert_eq!(expected, 5_000);
    }
}

//! Bounded blocking ring buffer between the capture thread and the ingest driver
//!
//! Backed by a `thingbuf` blocking channel, so the slots are allocated once up
//! front. A full ring applies backpressure: `put` blocks until the consumer
//! frees a slot (the kernel socket buffer absorbs bursts meanwhile). Nothing
//! is ever dropped by the ring itself until it is shut down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thingbuf::mpsc::{
    blocking::{channel, Receiver, Sender},
    errors::RecvTimeoutError,
};

/// How often a blocked `put` or `take` looks for a shutdown
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Result of waiting on the ring for an item
#[derive(Debug, PartialEq, Eq)]
pub enum Take<T> {
    Item(T),
    TimedOut,
    Closed,
}

impl<T> Take<T> {
    pub fn item(self) -> Option<T> {
        match self {
            Take::Item(t) => Some(t),
            _ => None,
        }
    }
}

/// Returned by `put` once the ring has been shut down, handing the item back
#[derive(Debug, PartialEq, Eq)]
pub struct Closed<T>(pub T);

pub struct DatagramRing<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    closed: AtomicBool,
}

impl<T: Default + Clone> DatagramRing<T> {
    /// # Panics
    /// If `capacity` is zero
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Ring capacity must be non-zero");
        let (tx, rx) = channel(capacity);
        Self {
            tx,
            rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue an item, blocking while the ring is full
    pub fn put(&self, mut item: T) -> Result<(), Closed<T>> {
        loop {
            if self.is_shutdown() {
                return Err(Closed(item));
            }
            match self.tx.send_timeout(item, SHUTDOWN_POLL) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_timeout() => item = e.into_inner(),
                Err(e) => return Err(Closed(e.into_inner())),
            }
        }
    }

    /// Dequeue the oldest item, waiting at most `timeout` for one to arrive
    pub fn take(&self, timeout: Duration) -> Take<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_shutdown() {
                return Take::Closed;
            }
            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(SHUTDOWN_POLL);
            match self.rx.recv_timeout(wait) {
                // Anything still queued at shutdown is discarded
                Ok(_) if self.is_shutdown() => return Take::Closed,
                Ok(item) => return Take::Item(item),
                Err(RecvTimeoutError::Closed) => return Take::Closed,
                Err(_) if Instant::now() >= deadline => return Take::TimedOut,
                Err(_) => {}
            }
        }
    }

    /// Close the ring. Every waiter wakes within a poll interval, pending items are
    /// never handed out and go away with the ring.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of items waiting to be taken
    pub fn len(&self) -> usize {
        if self.is_shutdown() {
            0
        } else {
            self.rx.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.rx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_fifo() {
        let ring = DatagramRing::new(8);
        for i in 0..8 {
            ring.put(i).unwrap();
        }
        let out: Vec<_> = (0..8).map(|_| ring.take(SHORT).item().unwrap()).collect();
        assert_eq!(out, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_fifo_wraps() {
        let ring = DatagramRing::new(3);
        let mut out = vec![];
        for i in 0..10 {
            ring.put(i).unwrap();
            if i % 2 == 1 {
                out.push(ring.take(SHORT).item().unwrap());
                out.push(ring.take(SHORT).item().unwrap());
            }
        }
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_timeout_on_empty() {
        let ring: DatagramRing<u8> = DatagramRing::new(2);
        let start = Instant::now();
        assert_eq!(ring.take(SHORT), Take::TimedOut);
        assert!(start.elapsed() >= SHORT);
    }

    #[test]
    fn test_put_blocks_when_full() {
        let ring = Arc::new(DatagramRing::new(2));
        ring.put(0).unwrap();
        ring.put(1).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let ring = ring.clone();
            let done = done.clone();
            thread::spawn(move || {
                ring.put(2).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.take(SHORT), Take::Item(0));
        producer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.take(SHORT), Take::Item(1));
        assert_eq!(ring.take(SHORT), Take::Item(2));
    }

    #[test]
    fn test_shutdown_idempotent() {
        let ring = DatagramRing::new(4);
        ring.put(1).unwrap();
        ring.shutdown();
        ring.shutdown();
        ring.shutdown();
        assert_eq!(ring.take(SHORT), Take::Closed);
        assert_eq!(ring.take(SHORT), Take::Closed);
        assert_eq!(ring.put(5), Err(Closed(5)));
        assert!(ring.is_shutdown());
    }

    #[test]
    fn test_shutdown_wakes_waiters() {
        let ring = Arc::new(DatagramRing::<u32>::new(1));
        ring.put(0).unwrap();
        let blocked_put = {
            let ring = ring.clone();
            thread::spawn(move || ring.put(1))
        };
        let consumer_ring = Arc::new(DatagramRing::<u32>::new(1));
        let blocked_take = {
            let ring = consumer_ring.clone();
            thread::spawn(move || ring.take(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(50));
        ring.shutdown();
        consumer_ring.shutdown();
        assert_eq!(blocked_put.join().unwrap(), Err(Closed(1)));
        assert_eq!(blocked_take.join().unwrap(), Take::Closed);
    }

    #[test]
    fn test_threaded_exactly_once() {
        let ring = Arc::new(DatagramRing::new(16));
        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for i in 0..10_000u32 {
                    ring.put(i).unwrap();
                }
            })
        };
        let mut expected = 0;
        while expected < 10_000 {
            if let Take::Item(v) = ring.take(Duration::from_secs(5)) {
                assert_eq!(v, expected);
                assert!(ring.len() <= ring.capacity());
                expected += 1;
            } else {
                panic!("ring stalled at {expected}");
            }
        }
        producer.join().unwrap();
        assert!(ring.is_empty());
    }
}

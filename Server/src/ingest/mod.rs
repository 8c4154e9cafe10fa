pub mod publish;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use metrics::get_metrics;
use prometheus::IntCounter;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use crate::types::{IngestConfig, OverflowPolicy, SourceKey};

/// Bounded buffer between the inbound connection and the transcoder's
/// stdin, so a stalled transcoder cannot grow memory without bound. The
/// overflow policy decides whether a full buffer drops the oldest frame or
/// holds the producer.
pub struct FrameQueue {
    inner: Mutex<Inner>,
    ready: Notify,
    space: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    frames_dropped: IntCounter,
}

struct Inner {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
}

impl FrameQueue {
    pub fn new(config: &IngestConfig) -> Self {
        let frames_dropped = get_metrics()
            .get_or_create_counter(
                "ingest_frames_dropped",
                "Frames dropped because the ingest buffer was full",
            )
            .unwrap();
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::new(),
                closed: false,
            }),
            ready: Notify::new(),
            space: Notify::new(),
            capacity: config.capacity.max(1),
            policy: config.policy,
            frames_dropped,
        }
    }

    /// Enqueue one frame. Under `Block` this suspends until the consumer
    /// makes room; under `DropOldest` it always returns promptly. Frames
    /// arriving after close are discarded.
    pub async fn push(&self, frame: Vec<u8>) {
        match self.policy {
            OverflowPolicy::DropOldest => {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    return;
                }
                if inner.frames.len() >= self.capacity {
                    inner.frames.pop_front();
                    self.frames_dropped.inc();
                    debug!("ingest buffer full, dropped oldest frame");
                }
                inner.frames.push_back(frame);
                drop(inner);
                self.ready.notify_one();
            }
            OverflowPolicy::Block => {
                let mut frame = Some(frame);
                loop {
                    let notified = self.space.notified();
                    {
                        let mut inner = self.inner.lock().unwrap();
                        if inner.closed {
                            return;
                        }
                        if inner.frames.len() < self.capacity {
                            inner.frames.push_back(frame.take().unwrap());
                            drop(inner);
                            self.ready.notify_one();
                            return;
                        }
                    }
                    notified.await;
                }
            }
        }
    }

    /// Dequeue the next frame. After close the remaining frames drain out,
    /// then `None` signals end-of-stream.
    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.ready.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(frame) = inner.frames.pop_front() {
                    drop(inner);
                    self.space.notify_one();
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark the queue closed and wake everything waiting on it.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.ready.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drains the queue into the transcoder's stdin. Dropping the pipe when the
/// queue ends is the end-of-input signal the supervisor observes; a write
/// error closes the queue so the producer stops feeding a dead pipe.
#[instrument(skip_all, fields(source = %key))]
pub async fn run_writer(key: SourceKey, queue: Arc<FrameQueue>, mut stdin: ChildStdin) {
    while let Some(frame) = queue.pop().await {
        if let Err(e) = stdin.write_all(&frame).await {
            warn!("error writing to transcoder stdin: {}", e);
            queue.close();
            break;
        }
    }
    debug!("ingest writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue(capacity: usize, policy: OverflowPolicy) -> Arc<FrameQueue> {
        Arc::new(FrameQueue::new(&IngestConfig { capacity, policy }))
    }

    #[tokio::test]
    async fn drop_oldest_keeps_the_newest_frames() {
        let queue = queue(2, OverflowPolicy::DropOldest);
        queue.push(vec![1]).await;
        queue.push(vec![2]).await;
        queue.push(vec![3]).await;

        assert_eq!(queue.pop().await, Some(vec![2]));
        assert_eq!(queue.pop().await, Some(vec![3]));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn block_policy_holds_the_producer_until_drained() {
        let queue = queue(1, OverflowPolicy::Block);
        queue.push(vec![1]).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(vec![2]).await })
        };

        // The producer cannot finish while the buffer is full.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pop().await, Some(vec![1]));
        producer.await.unwrap();
        assert_eq!(queue.pop().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn close_drains_buffered_frames_then_ends() {
        let queue = queue(4, OverflowPolicy::DropOldest);
        queue.push(vec![1]).await;
        queue.push(vec![2]).await;
        queue.close();

        assert_eq!(queue.pop().await, Some(vec![1]));
        assert_eq!(queue.pop().await, Some(vec![2]));
        assert_eq!(queue.pop().await, None);

        // Frames after close are discarded.
        queue.push(vec![3]).await;
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn close_unblocks_a_waiting_producer() {
        let queue = queue(1, OverflowPolicy::Block);
        queue.push(vec![1]).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(vec![2]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        producer.await.unwrap();
    }
}

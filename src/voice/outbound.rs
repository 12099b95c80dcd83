//! Bounded queue between microphone capture and the live channel.
//! Capture never waits on the network; when the queue is full a frame is dropped
//! according to the overflow policy.

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, RingBuffer};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Which frame to lose when the queue is full
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the stalest queued frame to make room
    #[default]
    DropOldest,
    /// Discard the incoming frame
    DropNewest,
}

/// Result of a push
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    DroppedOldest,
    DroppedNewest,
    Closed,
}

struct QueueState<T> {
    ring: HeapRb<T>,
    closed: bool,
    dropped: u64,
}

/// Single-consumer bounded queue with an overflow policy
pub struct OutboundQueue<T> {
    state: Mutex<QueueState<T>>,
    policy: OverflowPolicy,
    notify: Notify,
}

impl<T> OutboundQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ring: HeapRb::new(capacity.max(1)),
                closed: false,
                dropped: 0,
            }),
            policy,
            notify: Notify::new(),
        }
    }

    /// Enqueue without blocking
    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            match self.policy {
                OverflowPolicy::DropOldest => {
                    if state.ring.push_overwrite(item).is_some() {
                        state.dropped += 1;
                        PushOutcome::DroppedOldest
                    } else {
                        PushOutcome::Queued
                    }
                }
                OverflowPolicy::DropNewest => {
                    if state.ring.try_push(item).is_err() {
                        state.dropped += 1;
                        PushOutcome::DroppedNewest
                    } else {
                        PushOutcome::Queued
                    }
                }
            }
        };

        if outcome != PushOutcome::DroppedNewest {
            self.notify.notify_one();
        }
        outcome
    }

    /// Wait for the next item. Returns None once the queue is closed.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.ring.try_pop() {
                    return Some(item);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting items, discard pending ones and wake the consumer
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            while state.ring.try_pop().is_some() {}
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames lost to overflow so far
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

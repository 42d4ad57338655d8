//! Bounded redelivery queue and exponential backoff for the uplink.

use crate::uplink::SketchBatch;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// FIFO of undelivered batches. When full, the oldest batch is dropped.
pub struct RetryBuffer {
    capacity: usize,
    queue: VecDeque<Arc<SketchBatch>>,
    dropped_batches: u64,
    dropped_sketches: u64,
}

impl RetryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            queue: VecDeque::with_capacity(capacity),
            dropped_batches: 0,
            dropped_sketches: 0,
        }
    }

    /// Queue a batch; returns the batch pushed out to make room.
    pub fn push(&mut self, batch: Arc<SketchBatch>) -> Option<Arc<SketchBatch>> {
        let dropped = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        if let Some(old) = &dropped {
            self.dropped_batches += 1;
            self.dropped_sketches += old.len() as u64;
        }
        self.queue.push_back(batch);
        dropped
    }

    /// Oldest undelivered batch.
    pub fn front(&self) -> Option<Arc<SketchBatch>> {
        self.queue.front().cloned()
    }

    /// Remove a delivered batch. The batch may already be gone if it was dropped
    /// while in flight.
    pub fn remove(&mut self, batch_id: Uuid) -> bool {
        match self.queue.iter().position(|b| b.batch_id == batch_id) {
            Some(pos) => self.queue.remove(pos).is_some(),
            None => false,
        }
    }

    pub fn batch_ids(&self) -> Vec<Uuid> {
        self.queue.iter().map(|b| b.batch_id).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches
    }

    pub fn dropped_sketches(&self) -> u64 {
        self.dropped_sketches
    }
}

/// Exponential backoff between failed delivery attempts.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    next_attempt: Option<Instant>,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: multiplier.max(1.0),
            current: initial,
            next_attempt: None,
            failures: 0,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    /// Record a failure; returns the delay before the next attempt.
    pub fn on_failure(&mut self, now: Instant) -> Duration {
        let delay = self.current;
        self.next_attempt = Some(now + delay);
        self.failures = self.failures.saturating_add(1);
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }

    pub fn on_success(&mut self) {
        self.current = self.initial;
        self.next_attempt = None;
        self.failures = 0;
    }

    /// Consecutive failures since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }
}

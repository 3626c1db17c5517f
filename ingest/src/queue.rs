//! The ingest queue (§4.E): a single mutex-protected active buffer that
//! rotates into a stack of full queues once it crosses a threshold or goes
//! stale, plus a resend queue for batches a flush attempt failed to store.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use storage::RawReading;

pub const RESEND_MAX_RETRIES: u32 = 6;
pub const DISCARD_ON_RESEND_EXHAUSTION: u32 = 5;

/// A batch that has rotated out of the active buffer and is waiting to be
/// flushed, or that failed a flush attempt and is waiting to be resent.
pub struct PendingBatch {
    pub readings: Vec<RawReading>,
    pub rotated_at: Instant,
    pub attempts: u32,
}

struct QueueState {
    active: Vec<RawReading>,
    active_since: Instant,
    /// Full queues waiting their turn, LIFO: the most recently filled queue
    /// flushes first, so a burst does not starve the newest readings behind
    /// an arbitrarily long backlog.
    full_stack: Vec<PendingBatch>,
    resend: VecDeque<PendingBatch>,
    dropped_readings: u64,
}

pub struct IngestQueue {
    state: Mutex<QueueState>,
    threshold: usize,
    max_age: Duration,
}

#[derive(Debug, Default)]
pub struct QueueSnapshot {
    pub active_len: usize,
    pub full_stack_len: usize,
    pub resend_len: usize,
    pub dropped_readings: u64,
}

impl IngestQueue {
    pub fn new(threshold: usize, max_age: Duration) -> Self {
        IngestQueue {
            state: Mutex::new(QueueState {
                active: Vec::with_capacity(threshold),
                active_since: Instant::now(),
                full_stack: Vec::new(),
                resend: VecDeque::new(),
                dropped_readings: 0,
            }),
            threshold,
            max_age,
        }
    }

    /// Appends one reading to the active buffer. Returns `true` if this push
    /// crossed the threshold and rotated the buffer into the full stack, in
    /// which case the caller should wake the flush worker.
    pub fn push(&self, reading: RawReading) -> bool {
        let mut state = self.state.lock().unwrap();
        state.active.push(reading);
        if state.active.len() >= self.threshold {
            self.rotate(&mut state);
            true
        } else {
            false
        }
    }

    /// Rotates the active buffer out if it is non-empty and has gone stale,
    /// even though it never crossed the size threshold. Called by the flush
    /// worker on every wake so slow trickles of readings still get flushed.
    pub fn rotate_if_stale(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.active.is_empty() && state.active_since.elapsed() >= self.max_age {
            self.rotate(&mut state);
            true
        } else {
            false
        }
    }

    fn rotate(&self, state: &mut QueueState) {
        let readings = std::mem::replace(&mut state.active, Vec::with_capacity(self.threshold));
        state.active_since = Instant::now();
        state.full_stack.push(PendingBatch { readings, rotated_at: Instant::now(), attempts: 0 });
    }

    /// Pops the next batch to flush: the resend queue drains first, since
    /// those readings are older and already paid one failed round-trip.
    pub fn next_to_flush(&self) -> Option<PendingBatch> {
        let mut state = self.state.lock().unwrap();
        if let Some(batch) = state.resend.pop_front() {
            return Some(batch);
        }
        state.full_stack.pop()
    }

    /// Re-queues a batch that failed to store. Once a batch has failed
    /// `RESEND_MAX_RETRIES` times in a row, the head `DISCARD_ON_RESEND_EXHAUSTION`
    /// readings are dropped rather than the whole batch, and the remainder
    /// (if any) is requeued with a fresh retry budget -- so one malformed
    /// reading near the front of a batch cannot stall the rest of it
    /// forever. Returns the number of readings dropped on this call (zero
    /// unless exhaustion was just hit).
    pub fn requeue_failed(&self, mut batch: PendingBatch) -> usize {
        batch.attempts += 1;
        if batch.attempts < RESEND_MAX_RETRIES {
            self.state.lock().unwrap().resend.push_back(batch);
            return 0;
        }

        let drop_count = (DISCARD_ON_RESEND_EXHAUSTION as usize).min(batch.readings.len());
        batch.readings.drain(..drop_count);

        let mut state = self.state.lock().unwrap();
        state.dropped_readings += drop_count as u64;
        if !batch.readings.is_empty() {
            batch.attempts = 0;
            batch.rotated_at = Instant::now();
            state.resend.push_back(batch);
        }
        drop_count
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().unwrap();
        QueueSnapshot {
            active_len: state.active.len(),
            full_stack_len: state.full_stack.len(),
            resend_len: state.resend.len(),
            dropped_readings: state.dropped_readings,
        }
    }

    /// Drains every queue (active, full stack, resend) into one list of
    /// batches, for a clean shutdown that flushes everything it still holds.
    pub fn drain_all(&self) -> Vec<PendingBatch> {
        let mut state = self.state.lock().unwrap();
        let mut batches: Vec<PendingBatch> = state.resend.drain(..).collect();
        batches.extend(state.full_stack.drain(..));
        if !state.active.is_empty() {
            let readings = std::mem::take(&mut state.active);
            batches.push(PendingBatch { readings, rotated_at: Instant::now(), attempts: 0 });
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reading(v: i64) -> RawReading {
        RawReading { asset_code: "A".into(), payload: json!({"v": v}), user_ts: None }
    }

    #[test]
    fn rotates_active_buffer_once_threshold_is_crossed() {
        let queue = IngestQueue::new(3, Duration::from_secs(60));
        assert!(!queue.push(reading(1)));
        assert!(!queue.push(reading(2)));
        assert!(queue.push(reading(3)));
        let snap = queue.snapshot();
        assert_eq!(snap.active_len, 0);
        assert_eq!(snap.full_stack_len, 1);
    }

    #[test]
    fn resend_queue_drains_before_full_stack() {
        let queue = IngestQueue::new(1, Duration::from_secs(60));
        queue.push(reading(1));
        let first = queue.next_to_flush().unwrap();
        queue.requeue_failed(first);
        queue.push(reading(2));
        let next = queue.next_to_flush().unwrap();
        assert_eq!(next.readings[0].payload["v"], 1);
    }

    #[test]
    fn drops_head_readings_after_max_retries_and_requeues_remainder() {
        let queue = IngestQueue::new(1, Duration::from_secs(60));
        let readings: Vec<RawReading> = (0..8i64).map(reading).collect();
        let batch = PendingBatch { readings, rotated_at: Instant::now(), attempts: RESEND_MAX_RETRIES - 1 };

        let dropped = queue.requeue_failed(batch);
        assert_eq!(dropped, DISCARD_ON_RESEND_EXHAUSTION as usize);
        assert_eq!(queue.snapshot().dropped_readings, DISCARD_ON_RESEND_EXHAUSTION as u64);

        let requeued = queue.next_to_flush().unwrap();
        assert_eq!(requeued.readings.len(), 3);
        assert_eq!(requeued.attempts, 0);
    }

    #[test]
    fn drops_entire_batch_when_not_larger_than_the_discard_head() {
        let queue = IngestQueue::new(1, Duration::from_secs(60));
        let readings: Vec<RawReading> = (0..3i64).map(reading).collect();
        let batch = PendingBatch { readings, rotated_at: Instant::now(), attempts: RESEND_MAX_RETRIES - 1 };

        let dropped = queue.requeue_failed(batch);
        assert_eq!(dropped, 3);
        assert!(queue.next_to_flush().is_none());
    }

    #[test]
    fn rotate_if_stale_only_fires_past_max_age() {
        let queue = IngestQueue::new(100, Duration::from_millis(1));
        queue.push(reading(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(queue.rotate_if_stale());
        assert_eq!(queue.snapshot().full_stack_len, 1);
    }
}

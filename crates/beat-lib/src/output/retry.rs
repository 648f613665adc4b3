//! Backoff policy and the bounded send queue
//!
//! Every batch waiting for delivery lives here, whether it was just cut or is
//! waiting out a backoff. The pipeline worker is the only owner.

use crate::models::Batch;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff with a ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay before the next attempt, after `attempts` failed attempts
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[derive(Debug)]
struct QueuedBatch {
    batch: Batch,
    ready_at: Instant,
}

/// Bounded queue of batches awaiting a send attempt
///
/// Batches are keyed by sequence number, so iteration order is age order.
#[derive(Debug)]
pub struct RetryQueue {
    entries: BTreeMap<u64, QueuedBatch>,
    bytes: usize,
    max_bytes: usize,
}

impl RetryQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            bytes: 0,
            max_bytes,
        }
    }

    /// Queue a batch, evicting the oldest ones to stay within the memory bound
    ///
    /// Returns every batch that was dropped, possibly including `batch` itself
    /// when it alone exceeds the bound.
    pub fn push(&mut self, batch: Batch, ready_at: Instant) -> Vec<Batch> {
        if batch.size_bytes() > self.max_bytes {
            return vec![batch];
        }

        let mut dropped = Vec::new();
        while self.bytes + batch.size_bytes() > self.max_bytes {
            match self.entries.pop_first() {
                Some((_, oldest)) => {
                    self.bytes -= oldest.batch.size_bytes();
                    dropped.push(oldest.batch);
                }
                None => break,
            }
        }

        self.bytes += batch.size_bytes();
        self.entries
            .insert(batch.sequence(), QueuedBatch { batch, ready_at });
        dropped
    }

    /// Take the oldest batch whose backoff has elapsed
    pub fn pop_ready(&mut self, now: Instant) -> Option<Batch> {
        let sequence = self
            .entries
            .iter()
            .find(|(_, q)| q.ready_at <= now)
            .map(|(seq, _)| *seq)?;
        self.remove(sequence)
    }

    /// Earliest time any queued batch becomes ready
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.entries.values().map(|q| q.ready_at).min()
    }

    /// Make every queued batch eligible immediately
    pub fn expedite(&mut self, now: Instant) {
        for entry in self.entries.values_mut() {
            entry.ready_at = entry.ready_at.min(now);
        }
    }

    /// Remove everything, oldest first
    pub fn drain_all(&mut self) -> Vec<Batch> {
        self.bytes = 0;
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|q| q.batch)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of events across all queued batches
    pub fn event_count(&self) -> usize {
        self.entries.values().map(|q| q.batch.len()).sum()
    }

    /// Approximate memory held by queued batches
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn remove(&mut self, sequence: u64) -> Option<Batch> {
        let entry = self.entries.remove(&sequence)?;
        self.bytes -= entry.batch.size_bytes();
        Some(entry.batch)
    }
}

//! Wall-clock time source
//!
//! Wall-clock time stamps events and is injected so tests can control it.
//! Batching and retry timing use `tokio::time::Instant` directly; tests drive
//! those with a paused runtime.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait Clock: Send + Sync {
    /// Wall-clock time used for event timestamps
    fn wall(&self) -> DateTime<Utc>;
}

/// Real clock, backed by `chrono`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock
#[derive(Debug, Clone)]
pub struct ManualClock {
    wall: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            wall: Arc::new(Mutex::new(wall)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut wall = self.wall.lock().unwrap_or_else(|e| e.into_inner());
        *wall += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Set the wall clock, e.g. to step it backwards
    pub fn set_wall(&self, wall: DateTime<Utc>) {
        *self.wall.lock().unwrap_or_else(|e| e.into_inner()) = wall;
    }
}

impl Clock for ManualClock {
    fn wall(&self) -> DateTime<Utc> {
        *self.wall.lock().unwrap_or_else(|e| e.into_inner())
    }
}

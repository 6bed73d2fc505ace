//! Per-site throttle windows for soft-blocked names.
//!
//! Every site gets a rolling window: all queries landing in the same window
//! are released together at its end. Once a window has been idle for longer
//! than `window + grace` the next query opens a fresh one.

use crate::clock::Clock;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(28);
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

pub struct DelayManager {
    windows: DashMap<String, Instant>,
    window: Duration,
    grace: Duration,
    clock: Arc<dyn Clock>,
}

impl DelayManager {
    pub fn new(window: Duration, grace: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            grace,
            clock,
        }
    }

    /// When a query for `name` may be answered. May already be in the past.
    pub fn next_deadline(&self, name: &str) -> Instant {
        let now = self.clock.now();

        // El entry retiene el lock del shard: leer, reiniciar y volver a leer
        // es atómico por clave.
        let mut start = self.windows.entry(throttle_key(name).to_string()).or_insert(now);
        if now.saturating_duration_since(*start) > self.window + self.grace {
            *start = now;
        }
        *start + self.window
    }

    /// Time left until `name` may be answered; zero means now.
    pub fn next_delay(&self, name: &str) -> Duration {
        self.next_deadline(name)
            .saturating_duration_since(self.clock.now())
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

/// Last two dot-separated components of `name`, or all of it.
pub fn throttle_key(name: &str) -> &str {
    match name.rmatch_indices('.').nth(1) {
        Some((i, _)) => &name[i + 1..],
        None => name,
    }
}

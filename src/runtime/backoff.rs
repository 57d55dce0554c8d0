//! Adaptive retry delay for transient failures.
//!
//! The dispatcher sleeps for the current delay after any pass that produced
//! transient conditions, so repeated would-block or interrupted calls never
//! turn into a busy spin. The delay grows geometrically per trigger and
//! resets to its initial value once enough wall-clock time passes without
//! a new trigger.

use std::time::{Duration, Instant};

const INITIAL_US: u64 = 1_000;
const CEILING_US: u64 = 250_000;
const SEVERE_SLEEP_CAP_US: u64 = 100_000;

/// Which band a trigger falls into.
///
/// `Mild` covers ordinary per-connection conditions (would-block, aborted
/// accept); `Severe` covers platform-level failures (a failed readiness wait,
/// a failed worker spawn). The severe band sleeps less per trigger but resets
/// sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Mild,
    Severe,
}

pub struct Backoff {
    delay_us: u64,
    last_trigger: Option<Instant>,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            delay_us: INITIAL_US,
            last_trigger: None,
        }
    }

    /// Record a trigger and return how long the caller should sleep.
    ///
    /// Growth per trigger: mild adds a quarter of the current delay, severe
    /// an eighth. Both bands share the hard ceiling.
    pub fn trigger(&mut self, now: Instant, band: Band) -> Duration {
        let elapsed_us = match self.last_trigger {
            Some(t) => now.saturating_duration_since(t).as_micros() as u64,
            None => u64::MAX,
        };

        let sleep_us = match band {
            Band::Mild => {
                if elapsed_us > self.delay_us * 10 + 1_000_000 {
                    self.delay_us = INITIAL_US;
                }
                let sleep = self.delay_us;
                self.delay_us += 1 + self.delay_us / 4;
                sleep
            }
            Band::Severe => {
                if elapsed_us > self.delay_us * 4 + 250_000 {
                    self.delay_us = INITIAL_US;
                }
                let sleep = self.delay_us.min(SEVERE_SLEEP_CAP_US);
                self.delay_us += 1 + self.delay_us / 8;
                sleep
            }
        };

        self.delay_us = self.delay_us.min(CEILING_US);
        self.last_trigger = Some(now);
        Duration::from_micros(sleep_us)
    }

    /// Current delay, for diagnostics.
    pub fn current(&self) -> Duration {
        Duration::from_micros(self.delay_us)
    }
}

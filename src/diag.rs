//! Operator-facing control flags, counters, and signal wiring.
//!
//! The dispatcher never touches signal handlers itself. Signals set flags on
//! a process-scoped [`ControlFlags`] object, and the dispatcher consumes the
//! flags between passes: SIGUSR1 cycles the verbosity level through 0, 1, 2
//! and SIGUSR2 requests a read-only state dump.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Flags shared between the signal handlers and the dispatcher.
///
/// The per-pass view is read-only: the dispatcher samples these at the top of
/// each iteration and never mutates them mid-pass.
pub struct ControlFlags {
    verbosity: AtomicU8,
    cycle_verbosity: Arc<AtomicBool>,
    dump_pending: Arc<AtomicBool>,
    stop: AtomicBool,
}

impl ControlFlags {
    pub fn new(verbosity: u8) -> Self {
        Self {
            verbosity: AtomicU8::new(verbosity.min(2)),
            cycle_verbosity: Arc::new(AtomicBool::new(false)),
            dump_pending: Arc::new(AtomicBool::new(false)),
            stop: AtomicBool::new(false),
        }
    }

    /// Register SIGUSR1 (cycle verbosity) and SIGUSR2 (state dump).
    pub fn install_signal_handlers(&self) -> io::Result<()> {
        signal_hook::flag::register(
            signal_hook::consts::SIGUSR1,
            Arc::clone(&self.cycle_verbosity),
        )?;
        signal_hook::flag::register(
            signal_hook::consts::SIGUSR2,
            Arc::clone(&self.dump_pending),
        )?;
        Ok(())
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity.load(Ordering::Relaxed)
    }

    /// Apply a pending SIGUSR1, returning the new level if one was consumed.
    pub fn consume_verbosity_cycle(&self) -> Option<u8> {
        if self.cycle_verbosity.swap(false, Ordering::Relaxed) {
            let v = (self.verbosity.load(Ordering::Relaxed) + 1) % 3;
            self.verbosity.store(v, Ordering::Relaxed);
            Some(v)
        } else {
            None
        }
    }

    /// Consume a pending SIGUSR2 dump request.
    pub fn take_dump_request(&self) -> bool {
        self.dump_pending.swap(false, Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Process-wide counters, shared by the original dispatcher and any workers.
#[derive(Default)]
pub struct Stats {
    accepted: AtomicU64,
    splits: AtomicU64,
    live: AtomicUsize,
}

impl Stats {
    pub fn note_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_close(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn note_split(&self) {
        self.splits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn splits(&self) -> u64 {
        self.splits.load(Ordering::Relaxed)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

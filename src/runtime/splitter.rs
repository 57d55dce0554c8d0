//! Capacity-triggered worker splitting.
//!
//! When the original dispatcher's live connection count reaches the
//! configured ceiling, every current connection is handed off to a freshly
//! spawned worker thread running its own dispatcher, and the original keeps
//! accepting with an empty table. Ownership moves over a channel, never
//! shared: a connection belongs to exactly one loop at any moment. Workers
//! hold no listeners and exit once their last connection closes.
//!
//! A failed spawn is not fatal; the connections are relinked into the
//! original loop and the split is retried the next time the ceiling is
//! observed.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::diag::{ControlFlags, Stats};
use crate::runtime::backoff::Band;
use crate::runtime::conn::Conn;
use crate::runtime::event_loop::EventLoop;

impl EventLoop {
    /// Split when at or over the ceiling. Only meaningful in the original
    /// dispatcher; workers never split further.
    pub(super) fn maybe_split(&mut self) {
        if self.migrated || self.ceiling == 0 || self.conns.len() < self.ceiling {
            return;
        }
        self.split();
    }

    fn split(&mut self) {
        // Detach every live connection from this loop's poller so the worker
        // can register them with its own.
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        let mut moved = Vec::with_capacity(keys.len());
        for key in keys {
            let mut conn = self.conns.remove(key);
            if conn.registered.take().is_some() {
                let _ = self.poll.registry().deregister(&mut conn.sock.stream);
            }
            moved.push(conn);
        }

        let id = self.next_worker_id;
        let count = moved.len();
        let flags = Arc::clone(&self.flags);
        let stats = Arc::clone(&self.stats);
        let (tx, rx) = mpsc::channel::<Vec<Conn>>();

        let spawned = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                let Ok(conns) = rx.recv() else {
                    return;
                };
                worker_main(id, conns, flags, stats);
            });

        match spawned {
            Ok(handle) => {
                if let Err(mpsc::SendError(conns)) = tx.send(moved) {
                    // The worker died before taking delivery; keep serving.
                    error!(worker = id, "worker exited before handoff");
                    for conn in conns {
                        self.conns.insert(conn);
                    }
                    return;
                }
                self.next_worker_id += 1;
                self.workers.push(handle);
                self.stats.note_split();
                info!(worker = id, connections = count, "migrated connections to worker");
            }
            Err(e) => {
                // Resource exhaustion; relink and retry once over threshold
                // again.
                warn!(error = %e, "failed to spawn worker");
                for conn in moved {
                    self.conns.insert(conn);
                }
                thread::sleep(self.backoff.trigger(Instant::now(), Band::Severe));
            }
        }
    }

    /// Collect finished workers, logging how each ended.
    pub(super) fn reap_workers(&mut self) {
        let mut i = 0;
        while i < self.workers.len() {
            if self.workers[i].is_finished() {
                let handle = self.workers.swap_remove(i);
                let name = handle.thread().name().unwrap_or("worker").to_string();
                match handle.join() {
                    Ok(()) => debug!(worker = %name, "worker exited"),
                    Err(_) => error!(worker = %name, "worker panicked"),
                }
            } else {
                i += 1;
            }
        }
    }
}

fn worker_main(id: u64, conns: Vec<Conn>, flags: Arc<ControlFlags>, stats: Arc<Stats>) {
    let count = conns.len();
    match EventLoop::for_worker(id, conns, flags, stats) {
        Ok(mut el) => {
            info!(worker = id, connections = count, "worker serving");
            if let Err(e) = el.run() {
                error!(worker = id, error = %e, "worker loop failed");
            }
        }
        Err(e) => {
            // The connections are dropped with the failed loop; their peers
            // see an ordinary close.
            error!(worker = id, error = %e, "could not start worker loop");
        }
    }
}

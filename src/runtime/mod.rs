//! The readiness-driven runtime.
//!
//! One single-threaded dispatcher owns the listeners and every connection it
//! has accepted; handlers run to completion and never block. Scaling past
//! the per-process connection ceiling happens by handing whole connections
//! to freshly spawned workers, each an independent instance of the same
//! loop with no listeners of its own.

mod backoff;
pub mod conn;
mod event_loop;
pub mod listener;
mod splitter;

use std::io;
use std::sync::Arc;

use crate::diag::{ControlFlags, Stats};
use crate::proto::ProtocolInstance;

pub use listener::ListenSpec;

/// Run the dispatcher until the process is stopped.
pub fn run(
    listeners: Vec<ListenSpec>,
    instance: Box<dyn ProtocolInstance>,
    conns_per_proc: usize,
    flags: Arc<ControlFlags>,
) -> io::Result<()> {
    let stats = Arc::new(Stats::default());
    event_loop::EventLoop::original(listeners, instance, conns_per_proc, flags, stats)?.run()
}

#[cfg(test)]
pub(crate) mod testutil {
    use mio::net::TcpStream;

    /// A connected pair: a non-blocking server-side stream and a blocking
    /// peer to drive it from.
    pub(crate) fn stream_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), peer)
    }
}

//! Discard protocol (RFC 863): read everything, deliver nothing.
//!
//! The read-and-drop handler is also reused by the one-shot protocols, which
//! keep draining their peer while a staged reply is flushed.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use mio::net::TcpStream;

use crate::error::SetupError;
use crate::proto::{ArgCursor, ProtocolInstance};
use crate::runtime::conn::{Conn, Driver, Interest, Outcome, Sock};

pub fn construct(_args: &mut ArgCursor<'_>) -> Result<Box<dyn ProtocolInstance>, SetupError> {
    Ok(Box::new(Discard))
}

pub struct Discard;

impl ProtocolInstance for Discard {
    fn new_connection(
        &self,
        stream: TcpStream,
        _peer: SocketAddr,
        _now: Instant,
    ) -> io::Result<Conn> {
        Ok(Conn::new(
            stream,
            Box::new(DiscardDriver),
            Interest::reading(),
        ))
    }
}

/// Read one chunk and throw it away.
pub(crate) fn drain_read(sock: &mut Sock) -> Outcome {
    let mut scratch = [0u8; 512];
    sock.read_step(&mut scratch).then(|_| Outcome::Ok)
}

struct DiscardDriver;

impl Driver for DiscardDriver {
    fn on_readable(&mut self, sock: &mut Sock, _interest: &mut Interest) -> Outcome {
        drain_read(sock)
    }
}

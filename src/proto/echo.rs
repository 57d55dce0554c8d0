//! Echo protocol (RFC 862).
//!
//! Reads a chunk, then turns around and writes it back before reading more.
//! Read and write interest are mutually exclusive: while a chunk is being
//! flushed the connection does not read, so the bounce buffer never holds
//! more than one chunk.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use mio::net::TcpStream;

use crate::error::SetupError;
use crate::proto::{ArgCursor, ProtocolInstance};
use crate::runtime::conn::{Conn, Driver, Interest, Outcome, Sock};

const BOUNCE_SIZE: usize = 512;

pub fn construct(_args: &mut ArgCursor<'_>) -> Result<Box<dyn ProtocolInstance>, SetupError> {
    Ok(Box::new(Echo))
}

pub struct Echo;

impl ProtocolInstance for Echo {
    fn new_connection(
        &self,
        stream: TcpStream,
        _peer: SocketAddr,
        _now: Instant,
    ) -> io::Result<Conn> {
        Ok(Conn::new(
            stream,
            Box::new(EchoDriver::new()),
            Interest::reading(),
        ))
    }
}

struct EchoDriver {
    buf: [u8; BOUNCE_SIZE],
    len: usize,
    sent: usize,
}

impl EchoDriver {
    fn new() -> Self {
        Self {
            buf: [0; BOUNCE_SIZE],
            len: 0,
            sent: 0,
        }
    }
}

impl Driver for EchoDriver {
    fn on_readable(&mut self, sock: &mut Sock, interest: &mut Interest) -> Outcome {
        let step = sock.read_step(&mut self.buf);
        step.then(|n| {
            self.len = n;
            self.sent = 0;
            interest.read = false;
            interest.write = true;
            Outcome::Ok
        })
    }

    fn on_writable(&mut self, sock: &mut Sock, interest: &mut Interest) -> Outcome {
        let step = sock.write_step(&self.buf[self.sent..self.len]);
        step.then(|n| {
            self.sent += n;
            if self.sent == self.len {
                self.len = 0;
                self.sent = 0;
                interest.read = true;
                interest.write = false;
            }
            Outcome::Ok
        })
    }
}

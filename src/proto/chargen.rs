//! Character generator protocol (RFC 864).
//!
//! Emits the RFC's "one popular pattern": 72-column lines of printable ASCII,
//! each line starting one character later in the alphabet than the last. The
//! full pattern repeats every 7030 bytes (95 lines of 74 bytes including
//! CRLF), and a connection carries its position through partial writes.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use mio::net::TcpStream;

use crate::error::SetupError;
use crate::proto::{discard, ArgCursor, ProtocolInstance};
use crate::runtime::conn::{Conn, Driver, Interest, Outcome, Sock};

const LINE_STRIDE: usize = 74;
const PATTERN_PERIOD: usize = 7030;
const PRINTABLE: usize = 95;
const CHUNK_SIZE: usize = 512;

pub fn construct(_args: &mut ArgCursor<'_>) -> Result<Box<dyn ProtocolInstance>, SetupError> {
    Ok(Box::new(Chargen))
}

pub struct Chargen;

impl ProtocolInstance for Chargen {
    fn new_connection(
        &self,
        stream: TcpStream,
        _peer: SocketAddr,
        _now: Instant,
    ) -> io::Result<Conn> {
        Ok(Conn::new(
            stream,
            Box::new(ChargenDriver { pos: 0 }),
            Interest::reading_and_writing(),
        ))
    }
}

/// Fill `buf` with the pattern starting at byte offset `start`.
fn fill_pattern(start: usize, buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        let at = start + i;
        *b = match at % LINE_STRIDE {
            72 => b'\r',
            73 => b'\n',
            col => {
                let line = at / LINE_STRIDE;
                (32 + (line + col) % PRINTABLE) as u8
            }
        };
    }
}

struct ChargenDriver {
    /// Position in the repeating pattern, in bytes.
    pos: usize,
}

impl Driver for ChargenDriver {
    fn on_readable(&mut self, sock: &mut Sock, _interest: &mut Interest) -> Outcome {
        discard::drain_read(sock)
    }

    fn on_writable(&mut self, sock: &mut Sock, _interest: &mut Interest) -> Outcome {
        let mut chunk = [0u8; CHUNK_SIZE];
        fill_pattern(self.pos, &mut chunk);
        sock.write_step(&chunk).then(|n| {
            self.pos = (self.pos + n) % PATTERN_PERIOD;
            Outcome::Ok
        })
    }
}

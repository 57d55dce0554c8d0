//! Daytime protocol (RFC 867).
//!
//! Sends the local time as one human-readable line, then closes.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use chrono::Local;
use mio::net::TcpStream;

use crate::error::SetupError;
use crate::proto::onetime::OnetimeDriver;
use crate::proto::{ArgCursor, ProtocolInstance};
use crate::runtime::conn::Conn;

pub fn construct(_args: &mut ArgCursor<'_>) -> Result<Box<dyn ProtocolInstance>, SetupError> {
    Ok(Box::new(Daytime))
}

pub struct Daytime;

impl ProtocolInstance for Daytime {
    fn new_connection(
        &self,
        stream: TcpStream,
        _peer: SocketAddr,
        _now: Instant,
    ) -> io::Result<Conn> {
        let line = format!("{}\r\n", Local::now().format("%a %b %d %H:%M:%S %Y"));
        Ok(Conn::new(
            stream,
            Box::new(OnetimeDriver::new(line.into_bytes())),
            OnetimeDriver::interest(),
        ))
    }
}

//! Time protocol (RFC 868).
//!
//! Sends the current time as seconds since 1900-01-01 UTC, packed into four
//! big-endian bytes, then closes. The counter wraps in 2036; so does the
//! protocol.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use chrono::Utc;
use mio::net::TcpStream;

use crate::error::SetupError;
use crate::proto::onetime::OnetimeDriver;
use crate::proto::{ArgCursor, ProtocolInstance};
use crate::runtime::conn::Conn;

/// Offset between the 1900 epoch and the Unix epoch, per RFC 868.
const EPOCH_OFFSET: i64 = 2_208_988_800;

pub fn construct(_args: &mut ArgCursor<'_>) -> Result<Box<dyn ProtocolInstance>, SetupError> {
    Ok(Box::new(Time))
}

pub struct Time;

impl ProtocolInstance for Time {
    fn new_connection(
        &self,
        stream: TcpStream,
        _peer: SocketAddr,
        _now: Instant,
    ) -> io::Result<Conn> {
        let stamp = rfc868_stamp(Utc::now().timestamp());
        Ok(Conn::new(
            stream,
            Box::new(OnetimeDriver::new(stamp.to_vec())),
            OnetimeDriver::interest(),
        ))
    }
}

fn rfc868_stamp(unix_secs: i64) -> [u8; 4] {
    ((unix_secs + EPOCH_OFFSET) as u32).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_epoch_maps_to_the_1970_offset() {
        assert_eq!(rfc868_stamp(0), 2_208_988_800u32.to_be_bytes());
    }

    #[test]
    fn known_moment_round_trips() {
        // 2000-01-01T00:00:00Z is 946684800 in Unix seconds.
        let stamp = rfc868_stamp(946_684_800);
        assert_eq!(u32::from_be_bytes(stamp), 3_155_673_600);
    }
}

//! Shared driver for protocols that write one staged payload and hang up.

use bytes::Bytes;

use crate::proto::discard;
use crate::runtime::conn::{Driver, Interest, Outcome, Sock};

/// Writes a fixed payload, then signals close once fully flushed. Anything
/// the peer sends in the meantime is read and discarded.
pub(crate) struct OnetimeDriver {
    payload: Bytes,
    sent: usize,
}

impl OnetimeDriver {
    pub(crate) fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            sent: 0,
        }
    }

    pub(crate) fn interest() -> Interest {
        Interest::reading_and_writing()
    }
}

impl Driver for OnetimeDriver {
    fn on_readable(&mut self, sock: &mut Sock, _interest: &mut Interest) -> Outcome {
        discard::drain_read(sock)
    }

    fn on_writable(&mut self, sock: &mut Sock, interest: &mut Interest) -> Outcome {
        let step = sock.write_step(&self.payload[self.sent..]);
        step.then(|n| {
            self.sent += n;
            if self.sent == self.payload.len() {
                interest.write = false;
                Outcome::Close
            } else {
                Outcome::Ok
            }
        })
    }
}

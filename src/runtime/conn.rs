//! Connection objects and the per-connection handler contract.
//!
//! A [`Conn`] is the runtime record for one accepted socket: the stream, a
//! human-readable label, the connection's current interest set, and a boxed
//! [`Driver`] holding all protocol-specific state. The dispatcher services a
//! connection by invoking the driver's handlers and acting on the returned
//! [`Outcome`].

use std::io::{self, Read, Write};
use std::time::Instant;

use mio::net::TcpStream;
use mio::Interest as PollInterest;

/// What a handler invocation means for the connection.
pub enum Outcome {
    /// Progress was made (possibly partial); the connection stays open.
    Ok,
    /// Unrecoverable error; close the connection and log the cause.
    Fatal(io::Error),
    /// Recoverable condition; the connection stays open unchanged and the
    /// pass contributes to the adaptive backoff delay.
    Transient,
    /// Expected termination; close the connection without logging an error.
    Close,
}

/// Result of a single bounded read or write step on a socket.
pub enum IoStep {
    /// Bytes moved (never zero).
    Done(usize),
    WouldBlock,
    /// Peer closed or reset; treated as a graceful end.
    Closed,
    Fatal(io::Error),
}

impl IoStep {
    /// Fold the step into an [`Outcome`], applying `f` on progress.
    pub fn then(self, f: impl FnOnce(usize) -> Outcome) -> Outcome {
        match self {
            IoStep::Done(n) => f(n),
            IoStep::WouldBlock => Outcome::Transient,
            IoStep::Closed => Outcome::Close,
            IoStep::Fatal(e) => Outcome::Fatal(e),
        }
    }
}

/// Sticky readiness, set from poll events and cleared as I/O drains.
///
/// The poller is edge-driven, so readiness observed once must be remembered
/// until a short read/write or a would-block shows the socket is drained.
#[derive(Debug, Default, Clone, Copy)]
pub struct Readiness {
    pub read: bool,
    pub write: bool,
}

/// A connection's socket together with its sticky readiness state.
pub struct Sock {
    pub(crate) stream: TcpStream,
    pub(crate) ready: Readiness,
}

impl Sock {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            ready: Readiness::default(),
        }
    }

    /// One bounded read. A short read clears read readiness, since the
    /// socket is drained; a full read keeps it, since more may be pending.
    pub fn read_step(&mut self, buf: &mut [u8]) -> IoStep {
        match self.stream.read(buf) {
            Ok(0) => IoStep::Closed,
            Ok(n) => {
                if n < buf.len() {
                    self.ready.read = false;
                }
                IoStep::Done(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.ready.read = false;
                IoStep::WouldBlock
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => IoStep::WouldBlock,
            Err(e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::BrokenPipe =>
            {
                IoStep::Closed
            }
            Err(e) => IoStep::Fatal(e),
        }
    }

    /// One bounded write. A partial write means the kernel buffer is full,
    /// so write readiness is cleared until the next writable edge.
    pub fn write_step(&mut self, buf: &[u8]) -> IoStep {
        match self.stream.write(buf) {
            Ok(0) => IoStep::Closed,
            Ok(n) => {
                if n < buf.len() {
                    self.ready.write = false;
                }
                IoStep::Done(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.ready.write = false;
                IoStep::WouldBlock
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => IoStep::WouldBlock,
            Err(e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::BrokenPipe =>
            {
                IoStep::Closed
            }
            Err(e) => IoStep::Fatal(e),
        }
    }
}

/// The interests a connection currently wants serviced.
///
/// A connection with no interest at all is logically complete and is removed
/// by the dispatcher in the same pass that observes it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
    pub timer: Option<Instant>,
}

impl Interest {
    pub fn reading() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn reading_and_writing() -> Self {
        Self {
            read: true,
            write: true,
            timer: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.read && !self.write && self.timer.is_none()
    }
}

/// Per-connection protocol state machine.
///
/// Handlers run to completion, must not block, and report their effect via
/// [`Outcome`]. They may retarget the connection's interests: a read handler
/// that has staged a reply typically drops read interest and raises write
/// interest. A timer handler is invoked only once its deadline has passed and
/// is responsible for rearming or clearing the deadline; leaving a stale
/// deadline armed makes the dispatcher fire it again on the next pass.
pub trait Driver: Send {
    fn on_readable(&mut self, sock: &mut Sock, interest: &mut Interest) -> Outcome {
        let _ = (sock, interest);
        Outcome::Ok
    }

    fn on_writable(&mut self, sock: &mut Sock, interest: &mut Interest) -> Outcome {
        let _ = (sock, interest);
        Outcome::Ok
    }

    fn on_timer(&mut self, sock: &mut Sock, interest: &mut Interest, now: Instant) -> Outcome {
        let _ = (sock, interest, now);
        Outcome::Ok
    }

    /// Invoked exactly once when the connection is being removed.
    fn on_close(&mut self) {}
}

/// The runtime record for one accepted socket.
pub struct Conn {
    pub(crate) sock: Sock,
    pub(crate) label: String,
    pub(crate) interest: Interest,
    pub(crate) driver: Box<dyn Driver>,
    /// Poll registration currently in effect, if any.
    pub(crate) registered: Option<PollInterest>,
    /// Marked for removal later in the current pass.
    pub(crate) closing: bool,
    closed: bool,
}

impl Conn {
    pub fn new(stream: TcpStream, driver: Box<dyn Driver>, interest: Interest) -> Self {
        Self {
            sock: Sock::new(stream),
            label: String::new(),
            interest,
            driver,
            registered: None,
            closing: false,
            closed: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Poll interest implied by the current read/write flags.
    pub(crate) fn wants(&self) -> Option<PollInterest> {
        match (self.interest.read, self.interest.write) {
            (true, true) => Some(PollInterest::READABLE | PollInterest::WRITABLE),
            (true, false) => Some(PollInterest::READABLE),
            (false, true) => Some(PollInterest::WRITABLE),
            (false, false) => None,
        }
    }

    pub(crate) fn service_read(&mut self) -> Outcome {
        let Conn {
            sock,
            interest,
            driver,
            ..
        } = self;
        driver.on_readable(sock, interest)
    }

    pub(crate) fn service_write(&mut self) -> Outcome {
        let Conn {
            sock,
            interest,
            driver,
            ..
        } = self;
        driver.on_writable(sock, interest)
    }

    pub(crate) fn service_timer(&mut self, now: Instant) -> Outcome {
        let Conn {
            sock,
            interest,
            driver,
            ..
        } = self;
        driver.on_timer(sock, interest, now)
    }

    /// Run the close hook. Safe to call more than once; the hook itself
    /// runs only on the first call.
    pub(crate) fn shutdown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.driver.on_close();
        }
    }
}

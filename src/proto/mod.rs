//! Protocol plugins.
//!
//! Each supported protocol registers a [`ProtocolDescriptor`] in the closed
//! [`PROTOCOLS`] table: a name, an optional default port, and a constructor
//! that parses the protocol's own command-line tokens. Construction yields a
//! [`ProtocolInstance`], whose only job is to turn freshly accepted sockets
//! into configured connections. The dispatcher never looks past this
//! boundary; all wire-format knowledge lives in the plugin.

pub mod chargen;
pub mod daytime;
pub mod discard;
pub mod echo;
pub mod gen;
mod onetime;
pub mod qotd;
pub mod time;

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use mio::net::TcpStream;

use crate::error::SetupError;
use crate::runtime::conn::Conn;

pub type ConstructFn = fn(&mut ArgCursor<'_>) -> Result<Box<dyn ProtocolInstance>, SetupError>;

/// One entry in the protocol table, loaded once at startup.
pub struct ProtocolDescriptor {
    pub name: &'static str,
    /// Default TCP port, if the protocol has a well-known one.
    pub default_port: Option<u16>,
    pub construct: ConstructFn,
}

/// The supported protocols, in the order they are listed to the operator.
pub static PROTOCOLS: &[ProtocolDescriptor] = &[
    ProtocolDescriptor {
        name: "echo",
        default_port: Some(7),
        construct: echo::construct,
    },
    ProtocolDescriptor {
        name: "discard",
        default_port: Some(9),
        construct: discard::construct,
    },
    ProtocolDescriptor {
        name: "daytime",
        default_port: Some(13),
        construct: daytime::construct,
    },
    ProtocolDescriptor {
        name: "time",
        default_port: Some(37),
        construct: time::construct,
    },
    ProtocolDescriptor {
        name: "chargen",
        default_port: Some(19),
        construct: chargen::construct,
    },
    ProtocolDescriptor {
        name: "qotd",
        default_port: Some(17),
        construct: qotd::construct,
    },
    ProtocolDescriptor {
        name: "gen",
        default_port: None,
        construct: gen::construct,
    },
];

/// Look up a protocol by name, case-insensitively.
pub fn lookup(name: &str) -> Option<&'static ProtocolDescriptor> {
    PROTOCOLS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Comma-separated protocol names, for error messages.
pub fn known_names() -> String {
    PROTOCOLS
        .iter()
        .map(|p| p.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A configured protocol, owned by the dispatcher for its entire run.
pub trait ProtocolInstance: Send {
    /// Turn a freshly accepted socket into a connection with its initial
    /// interests resolved. Must not block.
    fn new_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        now: Instant,
    ) -> io::Result<Conn>;
}

/// Cursor over the trailing command-line tokens.
///
/// A constructor consumes the option tokens it recognizes from the front;
/// whatever remains is the operator's list of listen address specs.
pub struct ArgCursor<'a> {
    args: &'a [String],
    pos: usize,
}

impl<'a> ArgCursor<'a> {
    pub fn new(args: &'a [String]) -> Self {
        Self { args, pos: 0 }
    }

    /// If the next token equals `flag` and a value follows, consume both and
    /// return the value.
    pub fn take_option(&mut self, flag: &str) -> Option<&'a str> {
        if self.pos + 1 < self.args.len() && self.args[self.pos] == flag {
            let value = self.args[self.pos + 1].as_str();
            self.pos += 2;
            Some(value)
        } else {
            None
        }
    }

    /// The tokens not consumed by the protocol constructor.
    pub fn rest(&self) -> &'a [String] {
        &self.args[self.pos..]
    }
}

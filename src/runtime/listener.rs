//! Bound listening sockets.
//!
//! Listeners are built with socket2 so they are non-blocking and reusable
//! before the first accept, then handed to mio for readiness polling. Only
//! the original dispatcher ever owns listeners; migrated workers service
//! their inherited connections and nothing else.

use std::net::SocketAddr;

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::SetupError;

const LISTEN_BACKLOG: i32 = 25;

/// One listening socket plus the address spec it was requested as.
pub struct ListenSpec {
    pub spec: String,
    pub listener: TcpListener,
    /// Sticky accept readiness, set from poll events.
    pub(crate) ready: bool,
}

impl ListenSpec {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Bind and listen on `addr`, remembering `spec` for log messages.
pub fn bind(spec: &str, addr: SocketAddr) -> Result<ListenSpec, SetupError> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let build = || -> std::io::Result<std::net::TcpListener> {
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket.into())
    };

    let std_listener = build().map_err(|source| SetupError::Bind {
        spec: spec.to_string(),
        source,
    })?;

    Ok(ListenSpec {
        spec: spec.to_string(),
        listener: TcpListener::from_std(std_listener),
        ready: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_an_ephemeral_port() {
        let spec = bind("(test)", "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = spec.local_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn bind_failure_carries_the_spec() {
        // Port 1 needs privileges we should not have in a test run.
        let err = bind("lowport", "127.0.0.1:1".parse().unwrap());
        if let Err(SetupError::Bind { spec, .. }) = err {
            assert_eq!(spec, "lowport");
        }
        // Binding may succeed when running as root; either way is fine here.
    }
}

//! smallserve: the small TCP test protocols, many connections per process.
//!
//! Serves echo, discard, daytime, time, chargen, qotd, and a synthetic
//! traffic generator from a single readiness-driven event loop, splitting
//! off worker threads once a configurable number of connections is reached.
//! None of these protocols earn their keep in production anymore, but for
//! exercising firewalls and connection-tracking gear they are just right.

mod config;
mod diag;
mod error;
mod proto;
mod runtime;

use std::sync::Arc;

use config::Config;
use diag::ControlFlags;
use error::SetupError;
use proto::ArgCursor;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let desc = proto::lookup(&config.protocol).ok_or_else(|| SetupError::UnknownProtocol {
        name: config.protocol.clone(),
        known: proto::known_names(),
    })?;

    // The protocol parses its own options; whatever it leaves is addresses.
    let mut cursor = ArgCursor::new(&config.args);
    let instance = (desc.construct)(&mut cursor)?;
    let addrs = config::resolve_listen_addrs(desc, cursor.rest(), config.ipv6, config.numeric)?;

    let mut listeners = Vec::with_capacity(addrs.len());
    for (spec, addr) in addrs {
        let listener = runtime::listener::bind(&spec, addr)?;
        info!(listener = %spec, addr = %addr, "listening");
        listeners.push(listener);
    }

    let flags = Arc::new(ControlFlags::new(config.verbose));
    flags.install_signal_handlers().map_err(SetupError::Signals)?;

    info!(
        protocol = desc.name,
        conns_per_proc = config.conns_per_proc,
        ipv6 = config.ipv6,
        "starting smallserve"
    );

    runtime::run(listeners, instance, config.conns_per_proc, flags)?;
    Ok(())
}

//! Startup error taxonomy.
//!
//! Everything here is fatal before the event loop starts; once the loop is
//! running, per-connection failures are handled in place and never terminate
//! the process.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("failed to parse config file '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("unknown protocol '{name}' (recognized: {known})")]
    UnknownProtocol { name: String, known: String },

    #[error("bad {option} argument for '{proto}': {reason}")]
    BadProtocolOption {
        proto: &'static str,
        option: &'static str,
        reason: String,
    },

    #[error("invalid listen address '{spec}': {reason}")]
    BadAddress { spec: String, reason: String },

    #[error("protocol '{0}' has no default port; give an address as addr/port")]
    PortRequired(&'static str),

    #[error("failed to listen on '{spec}': {source}")]
    Bind { spec: String, source: io::Error },

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
}

//! Configuration for smallserve.
//!
//! Supports both command-line arguments and a TOML configuration file, with
//! CLI arguments taking precedence. Trailing tokens after the protocol name
//! belong first to the protocol (its own options) and then name the listen
//! addresses; the selected protocol's constructor decides where that split
//! falls.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::SetupError;
use crate::proto::ProtocolDescriptor;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "smallserve")]
#[command(version = "0.1.0")]
#[command(about = "Serve the small TCP test protocols from one process", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Connections per process before splitting off a worker (0 = unlimited)
    #[arg(short = 'N', long)]
    pub conns_per_proc: Option<usize>,

    /// Increase startup verbosity (repeatable; SIGUSR1 cycles it at runtime)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Listen on IPv6 instead of IPv4
    #[arg(short = '6', long)]
    pub ipv6: bool,

    /// No name lookups; addresses must be numeric
    #[arg(short = 'n', long)]
    pub numeric: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Protocol to serve (echo, discard, daytime, time, chargen, qotd, gen)
    pub protocol: String,

    /// Protocol options, then listen addresses (addr, /port, or addr/port)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_conns_per_proc")]
    pub conns_per_proc: usize,
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default)]
    pub numeric: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            conns_per_proc: default_conns_per_proc(),
            ipv6: false,
            numeric: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_conns_per_proc() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub protocol: String,
    /// Tokens for the protocol constructor and, after it, address specs.
    pub args: Vec<String>,
    pub conns_per_proc: usize,
    pub ipv6: bool,
    pub numeric: bool,
    pub verbose: u8,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, SetupError> {
        Self::merge(CliArgs::parse())
    }

    fn merge(cli: CliArgs) -> Result<Self, SetupError> {
        let toml_config = if let Some(ref path) = cli.config {
            let contents =
                std::fs::read_to_string(path).map_err(|source| SetupError::ConfigRead {
                    path: path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| SetupError::ConfigParse {
                path: path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            protocol: cli.protocol,
            args: cli.args,
            conns_per_proc: cli
                .conns_per_proc
                .unwrap_or(toml_config.server.conns_per_proc),
            ipv6: cli.ipv6 || toml_config.server.ipv6,
            numeric: cli.numeric || toml_config.server.numeric,
            verbose: cli.verbose,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Resolve listen address specs into bindable socket addresses.
///
/// Accepted forms are `address`, `/port`, and `address/port`; a missing port
/// falls back to the protocol's default. With no specs at all the wildcard
/// address on the default port is used.
pub fn resolve_listen_addrs(
    desc: &ProtocolDescriptor,
    specs: &[String],
    ipv6: bool,
    numeric: bool,
) -> Result<Vec<(String, SocketAddr)>, SetupError> {
    let wildcard = || -> IpAddr {
        if ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    };

    if specs.is_empty() {
        let port = desc.default_port.ok_or(SetupError::PortRequired(desc.name))?;
        return Ok(vec![(
            "(default)".to_string(),
            SocketAddr::new(wildcard(), port),
        )]);
    }

    let mut resolved = Vec::with_capacity(specs.len());
    for spec in specs {
        let (host, port) = match spec.rsplit_once('/') {
            Some((host, port_str)) => {
                let port: u16 = port_str.parse().map_err(|_| SetupError::BadAddress {
                    spec: spec.clone(),
                    reason: format!("'{port_str}' is not a port number"),
                })?;
                let host = (!host.is_empty()).then_some(host);
                (host, port)
            }
            None => {
                let port = desc.default_port.ok_or(SetupError::PortRequired(desc.name))?;
                (Some(spec.as_str()), port)
            }
        };

        let addr = match host {
            None => SocketAddr::new(wildcard(), port),
            Some(h) => {
                if let Ok(ip) = h.parse::<IpAddr>() {
                    SocketAddr::new(ip, port)
                } else if numeric {
                    return Err(SetupError::BadAddress {
                        spec: spec.clone(),
                        reason: format!("'{h}' is not a numeric address"),
                    });
                } else {
                    lookup_host(spec, h, port, ipv6)?
                }
            }
        };
        resolved.push((spec.clone(), addr));
    }
    Ok(resolved)
}

fn lookup_host(spec: &str, host: &str, port: u16, ipv6: bool) -> Result<SocketAddr, SetupError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| SetupError::BadAddress {
            spec: spec.to_string(),
            reason: e.to_string(),
        })?;

    addrs
        .into_iter()
        .find(|a| a.is_ipv6() == ipv6)
        .ok_or_else(|| SetupError::BadAddress {
            spec: spec.to_string(),
            reason: format!(
                "no {} address found for '{host}'",
                if ipv6 { "IPv6" } else { "IPv4" }
            ),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn toml_parsing_covers_all_sections() {
        let toml_str = r#"
            [server]
            conns_per_proc = 250
            ipv6 = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.conns_per_proc, 250);
        assert!(config.server.ipv6);
        assert!(!config.server.numeric);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn defaults_apply_without_a_config_file() {
        let config = TomlConfig::default();
        assert_eq!(config.server.conns_per_proc, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn cli_parses_protocol_options_after_the_protocol_name() {
        let cli = CliArgs::try_parse_from([
            "smallserve", "-N", "10", "-v", "gen", "-i", "0.5", "-n", "3", "/2000",
        ])
        .unwrap();
        assert_eq!(cli.conns_per_proc, Some(10));
        assert_eq!(cli.protocol, "gen");
        assert_eq!(cli.args, strings(&["-i", "0.5", "-n", "3", "/2000"]));
    }

    #[test]
    fn no_specs_uses_the_default_port_on_the_wildcard() {
        let desc = proto::lookup("echo").unwrap();
        let resolved = resolve_listen_addrs(desc, &[], false, false).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].1, "0.0.0.0:7".parse().unwrap());

        let resolved = resolve_listen_addrs(desc, &[], true, false).unwrap();
        assert_eq!(resolved[0].1, "[::]:7".parse().unwrap());
    }

    #[test]
    fn spec_forms_resolve_as_documented() {
        let desc = proto::lookup("chargen").unwrap();

        let specs = strings(&["127.0.0.1", "/1900", "10.1.2.3/1901"]);
        let resolved = resolve_listen_addrs(desc, &specs, false, true).unwrap();
        assert_eq!(resolved[0].1, "127.0.0.1:19".parse().unwrap());
        assert_eq!(resolved[1].1, "0.0.0.0:1900".parse().unwrap());
        assert_eq!(resolved[2].1, "10.1.2.3:1901".parse().unwrap());
    }

    #[test]
    fn gen_requires_an_explicit_port() {
        let desc = proto::lookup("gen").unwrap();
        assert!(matches!(
            resolve_listen_addrs(desc, &[], false, false),
            Err(SetupError::PortRequired("gen"))
        ));
        assert!(matches!(
            resolve_listen_addrs(desc, &strings(&["127.0.0.1"]), false, false),
            Err(SetupError::PortRequired("gen"))
        ));
        assert!(resolve_listen_addrs(desc, &strings(&["/4000"]), false, false).is_ok());
    }

    #[test]
    fn numeric_mode_rejects_names() {
        let desc = proto::lookup("echo").unwrap();
        let err = resolve_listen_addrs(desc, &strings(&["localhost/7777"]), false, true);
        assert!(matches!(err, Err(SetupError::BadAddress { .. })));
    }

    #[test]
    fn bad_port_is_reported_with_the_spec() {
        let desc = proto::lookup("echo").unwrap();
        let err = resolve_listen_addrs(desc, &strings(&["127.0.0.1/notaport"]), false, false);
        match err {
            Err(SetupError::BadAddress { spec, .. }) => assert_eq!(spec, "127.0.0.1/notaport"),
            other => panic!("expected BadAddress, got {other:?}"),
        }
    }
}

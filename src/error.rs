use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::upstream::Upstream;

/// No socket could be bound for a port. Fatal to that open call only.
#[derive(thiserror::Error, Debug)]
pub enum BindError {
    #[error("invalid configuration for port {port}: {reason}")]
    InvalidConfig { port: u16, reason: &'static str },
    #[error("could not bind port {port}: {}", format_causes(.causes))]
    Unavailable {
        port: u16,
        causes: Vec<(SocketAddr, io::Error)>,
    },
}

fn format_causes(causes: &[(SocketAddr, io::Error)]) -> String {
    causes
        .iter()
        .map(|(addr, error)| format!("{addr}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures that end a single client connection.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("failed to write handshake response: {0}")]
    HandshakeWrite(#[source] io::Error),
    #[error("failed to connect to upstream {upstream}: {source}")]
    UpstreamConnect {
        upstream: Upstream,
        #[source]
        source: io::Error,
    },
}

/// Failures of the start/stop handshake between a caller and a proxy thread.
#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("failed to create event loop: {0}")]
    Runtime(#[source] io::Error),
    #[error("timed out after {timeout:?} waiting for port {port} to start")]
    StartTimeout { port: u16, timeout: Duration },
    #[error("timed out after {timeout:?} waiting for port {port} to stop")]
    StopTimeout { port: u16, timeout: Duration },
    #[error("proxy thread for port {port} exited without reporting")]
    Exited { port: u16 },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum UpstreamParseError {
    #[error("missing port in upstream address {0:?}")]
    MissingPort(String),
    #[error("invalid port in upstream address {0:?}")]
    InvalidPort(String),
    #[error("missing host in upstream address {0:?}")]
    MissingHost(String),
}

use std::time::Duration;
use thiserror::Error;

/// Process-level failures. Only these ever reach `main`.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a client request head could not be routed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("request head is incomplete")]
    Truncated,
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("lookup of {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no IPv4 address found for {0}")]
    NoAddress(String),
}

/// Failures while bringing a connection from `Uninitialized` to `Forwarding`.
#[derive(Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("sending request upstream failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("reading request from client failed: {0}")]
    ClientRead(#[source] std::io::Error),

    #[error("client closed the connection before sending a full request head")]
    ClientClosed,

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

/// I/O failure in one relay direction.
#[derive(Error, Debug)]
#[error("{direction} relay failed: {source}")]
pub struct ForwardError {
    pub direction: crate::connection::Direction,
    #[source]
    pub source: std::io::Error,
}

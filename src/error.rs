//! Error taxonomy shared by every component (spec §7).
//!
//! Each variant maps to exactly one client-visible outcome: a specific
//! status code, or a silent teardown once response bytes may already be
//! in flight. The mapping lives in `ProxyError::status_code` /
//! `ProxyError::is_silent_after_bytes_sent` rather than being re-derived at
//! each call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("missing Host header")]
    MissingHost,

    #[error("request denied by filter rules")]
    Blocked,

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(#[source] std::io::Error),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("upstream I/O error: {0}")]
    UpstreamIo(#[source] std::io::Error),

    #[error("client I/O error: {0}")]
    ClientIo(#[source] std::io::Error),

    #[error("shutdown in progress")]
    Shutdown,
}

impl ProxyError {
    /// The status line the supervisor writes for this error, if any bytes
    /// have not yet reached the client for this transaction.
    pub fn status_line(&self) -> Option<(u16, &'static str)> {
        match self {
            ProxyError::MalformedRequest(_) => Some((400, "Bad Request")),
            ProxyError::MissingHost => Some((400, "Bad Request")),
            ProxyError::Blocked => Some((403, "Forbidden")),
            ProxyError::UpstreamConnect(_) => Some((502, "Bad Gateway")),
            ProxyError::UpstreamTimeout => Some((504, "Gateway Timeout")),
            ProxyError::UpstreamIo(_) | ProxyError::ClientIo(_) | ProxyError::Shutdown => None,
        }
    }

    /// The `ERROR`/`BLOCKED` reason text recorded in the transaction log.
    pub fn reason(&self) -> String {
        match self {
            ProxyError::MalformedRequest(m) => format!("MALFORMED_REQUEST: {m}"),
            ProxyError::MissingHost => "MISSING_HOST".to_string(),
            ProxyError::Blocked => "BLOCKED".to_string(),
            ProxyError::UpstreamConnect(e) => format!("UPSTREAM_CONNECT: {e}"),
            ProxyError::UpstreamTimeout => "UPSTREAM_TIMEOUT".to_string(),
            ProxyError::UpstreamIo(e) => format!("UPSTREAM_IO: {e}"),
            ProxyError::ClientIo(e) => format!("CLIENT_IO: {e}"),
            ProxyError::Shutdown => "SHUTDOWN".to_string(),
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

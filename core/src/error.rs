//! Error taxonomy shared across every component.
//!
//! Mirrors the component/kind split the rest of the codebase's lineage uses for
//! protocol-facing errors (e.g. a `thiserror` enum per subsystem with `#[from]`
//! conversions), rather than a single opaque `anyhow::Error` throughout the library.

use thiserror::Error;

/// Top-level error kind. Matches the taxonomy every component reports into.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration; fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// NAT probing failed outright (not just degraded to `Unknown`).
    #[error("NAT probe error: {0}")]
    Probe(String),

    /// Signaling endpoint communication failure.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Port allocation failed.
    #[error("allocation error: {0}")]
    Allocation(String),

    /// Hole punching failed (always recoverable by the caller).
    #[error("hole punch error: {0}")]
    HolePunch(String),

    /// Per-stream/session forwarding failure.
    #[error("forwarding error: {0}")]
    Forwarding(String),

    /// Not really an error: shutdown in progress. Propagated silently, never logged
    /// as a failure.
    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn signaling(msg: impl Into<String>) -> Self {
        Error::Signaling(msg.into())
    }

    pub fn allocation(msg: impl Into<String>) -> Self {
        Error::Allocation(msg.into())
    }

    pub fn hole_punch(msg: impl Into<String>) -> Self {
        Error::HolePunch(msg.into())
    }

    pub fn forwarding(msg: impl Into<String>) -> Self {
        Error::Forwarding(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

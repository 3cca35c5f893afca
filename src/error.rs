//! Public error currency for the crate.

use std::fmt;

/// Which component raised an [`Error::Internal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Cache,
    Download,
    Streaming,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::Cache => "cache",
            Component::Download => "download",
            Component::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

/// Errors returned by every public operation in the crate.
///
/// Internal glue code accumulates context with `anyhow`; by the time an
/// error crosses a public boundary it has been classified into one of
/// these variants so callers get a stable, matchable error currency.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid offset {offset}: {reason}")]
    InvalidOffset { offset: u64, reason: &'static str },

    #[error("invalid block size: expected {expected}, got {actual}")]
    InvalidBlockSize { expected: u64, actual: u64 },

    #[error("range [{from}, {to}] is not fully cached")]
    UncachedRange { from: u64, to: u64 },

    #[error("internal error in {component}")]
    Internal {
        component: Component,
        #[source]
        source: anyhow::Error,
    },

    #[error("not enough space: requested {requested} bytes, available {available:?}")]
    NotEnoughSpace {
        requested: u64,
        available: Option<u64>,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn internal(component: Component, source: impl Into<anyhow::Error>) -> Self {
        Error::Internal {
            component,
            source: source.into(),
        }
    }

    /// True when retrying the operation that produced this error has a
    /// chance of succeeding later without external intervention. A
    /// cancelled run is resumable — the caller asked it to stop, not the
    /// remote or the cache. Drivers use this to decide whether a run is
    /// `resumable`.
    pub fn is_resumable_failure(&self) -> bool {
        !matches!(self, Error::Internal { .. })
    }
}

//! Hub error types.

use std::io;
use thiserror::Error;

/// Errors surfaced by [`crate::hub::Hub`] and its collaborators.
#[derive(Error, Debug)]
pub enum Error {
    /// `Send` was called with `ttl == 0` for a user with no live connection.
    #[error("user is offline")]
    Offline,

    /// A cache attempt (`ttl > 0`) was made but no [`crate::queue::Queue`] is configured.
    #[error("queue is required to cache messages")]
    QueueRequired,

    /// A cache attempt failed. Wraps the underlying queue error, if any.
    #[error("failed to cache message: {0}")]
    CacheFailed(#[source] Box<Error>),

    /// A write was attempted on a connection that already transitioned to closed.
    #[error("can't write to closed connection")]
    ConnectionClosed,

    /// Transport I/O failure (read, write, or deadline) on a connection.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// A `BeforeSend` hook rejected delivery to a connection.
    #[error("before-send hook rejected the payload")]
    HookRejected,

    /// Hub construction was refused: ping supervisor disabled and no read
    /// timeout configured, which would leak half-open sockets silently.
    #[error("at least one of server ping or read timeout must be enabled")]
    NoLivenessCheck,
}

/// Result type alias used throughout `pulsehub-core`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap `err` as a cache failure so callers can recover both the
    /// cache-failure marker and the underlying cause via [`Self::is_cache_failed`]
    /// and [`Self::is_queue_required`].
    pub fn cache_failed(err: Error) -> Self {
        Self::CacheFailed(Box::new(err))
    }

    /// True if this error is [`Error::CacheFailed`].
    #[must_use]
    pub fn is_cache_failed(&self) -> bool {
        matches!(self, Self::CacheFailed(_))
    }

    /// True if this error (or something it wraps) is [`Error::QueueRequired`].
    #[must_use]
    pub fn is_queue_required(&self) -> bool {
        match self {
            Self::QueueRequired => true,
            Self::CacheFailed(inner) => inner.is_queue_required(),
            _ => false,
        }
    }
}

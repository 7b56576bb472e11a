//! Transport adapter contract.
//!
//! A [`ConnAdapter`] hides everything about a concrete transport behind four
//! operations. The hub and [`crate::connection::Connection`] know nothing about
//! sockets, websocket upgrades, or framing — only this trait. The one adapter this
//! workspace ships (`pulsehub::transport::FramedTcpAdapter`) implements it over a
//! length-prefixed TCP stream; any other transport is a drop-in replacement.

use std::io;

use async_trait::async_trait;

/// Uniform read/write/close/share interface over one framed message stream.
///
/// Implementors own whatever interior mutability they need: [`Self::read`] is
/// only ever called from a connection's single read-loop task, so no
/// implementation-side locking is required there, but [`Self::write`] may be
/// called concurrently with [`Self::read`] (it is *not* called concurrently with
/// itself — the caller serializes writes per adapter, see
/// [`crate::connection::Connection`]'s write latch).
#[async_trait]
pub trait ConnAdapter: Send + Sync + 'static {
    /// Block until one complete application message is available.
    ///
    /// Any framing, timeout, or transport failure is returned as `Err`; the hub
    /// treats every such failure identically (it triggers the offline latch).
    async fn read(&self) -> io::Result<Vec<u8>>;

    /// Transmit one complete application message.
    ///
    /// Implementations apply their own write deadline. Callers (here,
    /// [`crate::connection::Connection`]) must never invoke this concurrently
    /// with another `write` on the same adapter.
    async fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Idempotent from the caller's perspective: the hub guarantees it calls this
    /// at most once per adapter, but implementations should not assume that and
    /// may be called defensively more than once in error-recovery paths.
    async fn close(&self) -> io::Result<()>;

    /// True iff `self` and `other` are multiplexed on the same underlying
    /// transport. Used by SSO registration (§4.3a) to avoid displacing a peer
    /// session that shares a stream with the newcomer.
    fn share_conn(&self, other: &Self) -> bool;
}

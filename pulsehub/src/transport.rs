//! The one concrete [`pulsehub_core::adapter::ConnAdapter`] this workspace ships:
//! a length-prefixed framer over a `compio` TCP stream.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use compio::net::TcpStream;
use parking_lot::Mutex;
use pulsehub_core::adapter::ConnAdapter;

use crate::tcp::enable_tcp_nodelay;
use crate::timeout::{read_exact_with_timeout, write_all_with_timeout};

/// Default maximum accepted payload length: 4 MiB (§6's wire/format boundary).
pub const DEFAULT_MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

static NEXT_ADAPTER_ID: AtomicU64 = AtomicU64::new(0);

/// A 4-byte big-endian length prefix followed by the payload, the reference
/// framing fixed by §4.1/§6. Read and write each run under their own
/// deadline; any failure (I/O, deadline, or an oversized header) is surfaced
/// uniformly as `io::Error`, matching the contract's "the hub treats all
/// failures identically".
pub struct FramedTcpAdapter {
    stream: Mutex<Option<TcpStream>>,
    local: SocketAddr,
    peer: SocketAddr,
    id: u64,
    max_frame_len: u32,
    read_timeout: Option<Duration>,
    write_timeout: Duration,
}

impl FramedTcpAdapter {
    /// Wrap an accepted stream. `read_timeout` of `None` disables the read
    /// deadline (the hub then requires a configured ping supervisor instead).
    pub fn new(
        stream: TcpStream,
        max_frame_len: u32,
        read_timeout: Option<Duration>,
        write_timeout: Duration,
    ) -> io::Result<Self> {
        enable_tcp_nodelay(&stream)?;
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream: Mutex::new(Some(stream)),
            local,
            peer,
            id: NEXT_ADAPTER_ID.fetch_add(1, Ordering::Relaxed),
            max_frame_len,
            read_timeout,
            write_timeout,
        })
    }

    fn clone_stream(&self) -> io::Result<TcpStream> {
        self.stream
            .lock()
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))?
            .try_clone()
    }
}

#[async_trait]
impl ConnAdapter for FramedTcpAdapter {
    async fn read(&self) -> io::Result<Vec<u8>> {
        let mut stream = self.clone_stream()?;

        let header = vec![0u8; 4];
        let compio::buf::BufResult(res, header) =
            read_exact_with_timeout(&mut stream, header, self.read_timeout).await?;
        res?;

        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if len > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds max {}", self.max_frame_len),
            ));
        }

        let payload = vec![0u8; len as usize];
        let compio::buf::BufResult(res, payload) =
            read_exact_with_timeout(&mut stream, payload, self.read_timeout).await?;
        res?;

        Ok(payload)
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut stream = self.clone_stream()?;

        let mut framed = Vec::with_capacity(4 + data.len());
        framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
        framed.extend_from_slice(data);

        let compio::buf::BufResult(res, _) =
            write_all_with_timeout(&mut stream, framed, Some(self.write_timeout)).await?;
        res
    }

    /// Closing is modeled as relinquishing our handle to the stream: the
    /// underlying socket is closed when the last `TcpStream` clone drops.
    /// Subsequent `read`/`write` calls observe `NotConnected` rather than
    /// racing an in-flight shutdown against a concurrent I/O call.
    async fn close(&self) -> io::Result<()> {
        self.stream.lock().take();
        Ok(())
    }

    /// Plain TCP never multiplexes two logical sessions over one stream: two
    /// `FramedTcpAdapter`s share a transport only when they were constructed
    /// from the same accepted connection (identity, approximated by local+peer
    /// address pair and a monotonic construction id).
    fn share_conn(&self, other: &Self) -> bool {
        self.id == other.id && self.local == other.local && self.peer == other.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) =
            futures::try_join!(TcpStream::connect(addr), listener.accept()).unwrap();
        (client, accepted.0)
    }

    #[compio::test]
    async fn round_trips_a_frame() {
        let (client, server) = loopback_pair().await;
        let client = FramedTcpAdapter::new(client, DEFAULT_MAX_FRAME_LEN, None, Duration::from_secs(5)).unwrap();
        let server = FramedTcpAdapter::new(server, DEFAULT_MAX_FRAME_LEN, None, Duration::from_secs(5)).unwrap();

        client.write(b"hello hub").await.unwrap();
        let got = server.read().await.unwrap();
        assert_eq!(got, b"hello hub");
    }

    #[compio::test]
    async fn rejects_a_frame_over_the_configured_max() {
        let (client, server) = loopback_pair().await;
        let client = FramedTcpAdapter::new(client, 8, None, Duration::from_secs(5)).unwrap();
        let server = FramedTcpAdapter::new(server, 8, None, Duration::from_secs(5)).unwrap();

        client.write(b"this payload is way too long").await.unwrap();
        let err = server.read().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[compio::test]
    async fn share_conn_is_false_across_distinct_accepted_connections() {
        let (client_a, server_a) = loopback_pair().await;
        let (client_b, server_b) = loopback_pair().await;
        let _client_b = client_b;

        let a = FramedTcpAdapter::new(client_a, DEFAULT_MAX_FRAME_LEN, None, Duration::from_secs(5)).unwrap();
        let b = FramedTcpAdapter::new(server_a, DEFAULT_MAX_FRAME_LEN, None, Duration::from_secs(5)).unwrap();
        let c = FramedTcpAdapter::new(server_b, DEFAULT_MAX_FRAME_LEN, None, Duration::from_secs(5)).unwrap();

        assert!(!a.share_conn(&b));
        assert!(!a.share_conn(&c));
    }

    #[compio::test]
    async fn read_after_close_is_not_connected() {
        let (client, server) = loopback_pair().await;
        let _client = client;
        let server = FramedTcpAdapter::new(server, DEFAULT_MAX_FRAME_LEN, None, Duration::from_secs(5)).unwrap();

        server.close().await.unwrap();
        let err = server.read().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}

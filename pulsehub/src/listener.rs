//! Accept loop glue: turns raw TCP connections into registered hub connections.

use std::fmt;
use std::future::Future;
use std::hash::Hash;

use compio::net::TcpListener;
use pulsehub_core::adapter::ConnAdapter;
use pulsehub_core::device::Device;
use pulsehub_core::hub::Hub;
use tracing::warn;

use crate::transport::{FramedTcpAdapter, DEFAULT_MAX_FRAME_LEN};

/// Accepts connections from `listener` forever, authenticating each one
/// under `hub`'s configured auth timeout before registering it.
///
/// `authenticate` receives the freshly wrapped adapter and must either
/// produce a [`Device`] (the connection goes online) or fail (the adapter is
/// closed without ever reaching the hub, per the contract's treatment of
/// authentication as an external concern). Runs until the listener itself
/// errors; each accepted connection runs in its own detached task, so one
/// slow or misbehaving client never blocks the accept loop.
pub async fn serve<U, F, Fut>(listener: TcpListener, hub: Hub<U, FramedTcpAdapter>, authenticate: F)
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    F: Fn(&mut FramedTcpAdapter) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = std::io::Result<Device<U>>> + Send + 'static,
{
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed, stopping listener");
                return;
            }
        };

        let hub = hub.clone();
        let authenticate = authenticate.clone();

        compio::runtime::spawn(async move {
            let mut adapter = match FramedTcpAdapter::new(
                stream,
                DEFAULT_MAX_FRAME_LEN,
                hub.read_timeout(),
                hub.write_timeout(),
            ) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(%peer, error = %e, "failed to wrap accepted stream");
                    return;
                }
            };

            let outcome = compio::time::timeout(hub.auth_timeout(), authenticate(&mut adapter)).await;

            let device = match outcome {
                Ok(Ok(device)) => device,
                Ok(Err(e)) => {
                    warn!(%peer, error = %e, "authentication failed");
                    let _ = adapter.close().await;
                    return;
                }
                Err(_elapsed) => {
                    warn!(%peer, "authentication timed out");
                    let _ = adapter.close().await;
                    return;
                }
            };

            hub.register_connection(device, adapter).await;
        })
        .detach();
    }
}

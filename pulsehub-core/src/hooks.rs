//! Optional, narrow hook traits the application wires into [`crate::config::HubConfig`].
//!
//! Each hook is a single-method interface rather than one fat interface with many
//! mandatory methods: implementers provide [`Actor`] (the only mandatory hook) plus
//! whichever of the rest their application needs. A hook that isn't configured is
//! simply skipped by the hub at the point each would otherwise fire.

use async_trait::async_trait;

use crate::device::Device;

/// Mandatory hook: handles payloads the hub has received from a device.
#[async_trait]
pub trait Actor<U>: Send + Sync
where
    U: Send + Sync + 'static,
{
    /// Called once per inbound frame, after [`BeforeReceiveHandler`] (if configured).
    async fn on_receive(&self, dv: &Device<U>, data: &[u8]);
}

/// Transform or reject inbound payloads before [`Actor::on_receive`].
///
/// Returning `Err` drops the frame silently (observable only via logs); the hub
/// never surfaces a `BeforeReceive` error to the sender.
#[async_trait]
pub trait BeforeReceiveHandler<U>: Send + Sync
where
    U: Send + Sync + 'static,
{
    async fn before_receive(&self, dv: &Device<U>, data: &[u8]) -> Result<Option<Vec<u8>>, ()>;
}

/// Transform outbound payloads per-connection before the write.
///
/// Returning `Err` skips delivery to that one connection only; it does not abort
/// delivery to the user's other live connections.
#[async_trait]
pub trait BeforeSendHandler<U>: Send + Sync
where
    U: Send + Sync + 'static,
{
    async fn before_send(&self, dv: &Device<U>, data: &[u8]) -> Result<Option<Vec<u8>>, ()>;
}

/// Fire-and-forget notification after a successful per-connection write.
#[async_trait]
pub trait AfterSendHandler<U>: Send + Sync
where
    U: Send + Sync + 'static,
{
    async fn after_send(&self, dv: &Device<U>, data: &[u8]);
}

/// Invoked once a connection has fully closed (adapter closed, ping task stopped).
#[async_trait]
pub trait CloseHandler<U>: Send + Sync
where
    U: Send + Sync + 'static,
{
    async fn on_close(&self, dv: &Device<U>);
}

/// Produces the periodic keepalive payload. Its mere presence enables the ping
/// supervisor (§4.3g); a hub with no `PingGenerator` configured runs no ping loop
/// at all and must have a nonzero `read_timeout` instead (enforced at construction).
pub trait PingGenerator: Send + Sync {
    fn ping(&self) -> Vec<u8>;
}

/// Produces a farewell payload sent to a connection before SSO displaces it.
pub trait ByeGenerator<U>: Send + Sync
where
    U: Send + Sync + 'static,
{
    /// `kicker` is the newly-registered device causing the displacement, `reason`
    /// is a short machine string (`"sso"` for the only reason the hub currently
    /// generates), `victim` is the device being kicked.
    fn bye(&self, kicker: &Device<U>, reason: &str, victim: &Device<U>) -> Vec<u8>;
}

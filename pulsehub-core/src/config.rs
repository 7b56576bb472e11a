//! Hub construction options.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crate::hooks::{
    Actor, AfterSendHandler, BeforeReceiveHandler, BeforeSendHandler, ByeGenerator, CloseHandler,
    PingGenerator,
};
use crate::queue::{MemoryQueue, Queue};

/// Default server ping interval (§6's `ServerPingInterval`).
pub const DEFAULT_SERVER_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Default auth step deadline (§6's `AuthTimeout`).
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);
/// Default per-write deadline (§6's `WriteTimeout`).
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Consuming builder for [`crate::hub::Hub`]: one mandatory argument
/// (the [`Actor`]), everything else defaulted and overridden via `with_*`.
pub struct HubConfig<U>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    pub(crate) actor: Arc<dyn Actor<U>>,
    pub(crate) queue: Option<Arc<dyn Queue<U>>>,
    pub(crate) sso: bool,
    pub(crate) server_ping_interval: Duration,
    pub(crate) auth_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) ping_generator: Option<Arc<dyn PingGenerator>>,
    pub(crate) bye_generator: Option<Arc<dyn ByeGenerator<U>>>,
    pub(crate) before_receive: Option<Arc<dyn BeforeReceiveHandler<U>>>,
    pub(crate) before_send: Option<Arc<dyn BeforeSendHandler<U>>>,
    pub(crate) after_send: Option<Arc<dyn AfterSendHandler<U>>>,
    pub(crate) close_handler: Option<Arc<dyn CloseHandler<U>>>,
}

impl<U> HubConfig<U>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    /// Start a config with `actor` as the mandatory receive hook and the
    /// defaults: SSO on, a fresh [`MemoryQueue`], ping supervisor disabled,
    /// read timeout disabled.
    ///
    /// Note: with neither pings nor a read timeout enabled, [`crate::hub::Hub::new`]
    /// will refuse this config unless `with_ping_generator` or `with_read_timeout`
    /// is also called.
    pub fn new(actor: impl Actor<U> + 'static) -> Self {
        Self {
            actor: Arc::new(actor),
            queue: Some(Arc::new(MemoryQueue::new())),
            sso: true,
            server_ping_interval: DEFAULT_SERVER_PING_INTERVAL,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_timeout: None,
            ping_generator: None,
            bye_generator: None,
            before_receive: None,
            before_send: None,
            after_send: None,
            close_handler: None,
        }
    }

    /// Replace the offline cache backend. Pass `None` to disable caching
    /// entirely (`ttl > 0` sends then fail with [`crate::error::Error::QueueRequired`]).
    #[must_use]
    pub fn with_queue(mut self, queue: Option<Arc<dyn Queue<U>>>) -> Self {
        self.queue = queue;
        self
    }

    #[must_use]
    pub fn with_sso(mut self, sso: bool) -> Self {
        self.sso = sso;
        self
    }

    #[must_use]
    pub fn with_server_ping_interval(mut self, interval: Duration) -> Self {
        self.server_ping_interval = interval;
        self
    }

    #[must_use]
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// `None` disables the read deadline; at least one of this or
    /// `with_ping_generator` must be set, checked at `Hub::new`.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Enables the ping supervisor (§4.3g).
    #[must_use]
    pub fn with_ping_generator(mut self, gen: impl PingGenerator + 'static) -> Self {
        self.ping_generator = Some(Arc::new(gen));
        self
    }

    #[must_use]
    pub fn with_bye_generator(mut self, gen: impl ByeGenerator<U> + 'static) -> Self {
        self.bye_generator = Some(Arc::new(gen));
        self
    }

    #[must_use]
    pub fn with_before_receive(mut self, hdl: impl BeforeReceiveHandler<U> + 'static) -> Self {
        self.before_receive = Some(Arc::new(hdl));
        self
    }

    #[must_use]
    pub fn with_before_send(mut self, hdl: impl BeforeSendHandler<U> + 'static) -> Self {
        self.before_send = Some(Arc::new(hdl));
        self
    }

    #[must_use]
    pub fn with_after_send(mut self, hdl: impl AfterSendHandler<U> + 'static) -> Self {
        self.after_send = Some(Arc::new(hdl));
        self
    }

    #[must_use]
    pub fn with_close_handler(mut self, hdl: impl CloseHandler<U> + 'static) -> Self {
        self.close_handler = Some(Arc::new(hdl));
        self
    }

    pub(crate) fn has_liveness_check(&self) -> bool {
        self.ping_generator.is_some() || self.read_timeout.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    struct NopActor;
    #[async_trait::async_trait]
    impl Actor<String> for NopActor {
        async fn on_receive(&self, _dv: &Device<String>, _data: &[u8]) {}
    }

    #[test]
    fn defaults_match_reference() {
        let cfg = HubConfig::new(NopActor);
        assert!(cfg.sso);
        assert!(cfg.queue.is_some());
        assert_eq!(cfg.server_ping_interval, DEFAULT_SERVER_PING_INTERVAL);
        assert_eq!(cfg.auth_timeout, DEFAULT_AUTH_TIMEOUT);
        assert_eq!(cfg.write_timeout, DEFAULT_WRITE_TIMEOUT);
        assert!(cfg.read_timeout.is_none());
        assert!(!cfg.has_liveness_check());
    }

    #[test]
    fn read_timeout_satisfies_liveness_check() {
        let cfg = HubConfig::new(NopActor).with_read_timeout(Some(Duration::from_secs(10)));
        assert!(cfg.has_liveness_check());
    }

    #[test]
    fn no_queue_disables_caching() {
        let cfg = HubConfig::new(NopActor).with_queue(None);
        assert!(cfg.queue.is_none());
    }
}

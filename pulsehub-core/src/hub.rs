//! The single-owner, event-serialized connection registry and message broker.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use hashbrown::HashMap;
use tracing::{debug, error, info, warn};

use crate::adapter::ConnAdapter;
use crate::config::HubConfig;
use crate::connection::Connection;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::hooks::{
    Actor, AfterSendHandler, BeforeReceiveHandler, BeforeSendHandler, ByeGenerator, CloseHandler,
    PingGenerator,
};
use crate::queue::Queue;

/// Runs `fut` on a detached task, catching any panic so one crashing helper
/// (a hook, a queue backend, an adapter write) never takes down the
/// dispatcher or the process. `label` identifies the task kind in the log.
fn spawn_supervised(label: &'static str, fut: impl std::future::Future<Output = ()> + Send + 'static) {
    compio::runtime::spawn(async move {
        if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            error!(task = label, "helper task panicked");
        }
    })
    .detach();
}

/// Every way the outside world (connections, the public `Hub` handle, the ping
/// supervisor) talks to the dispatcher. A single multiplexed channel carries
/// every event kind: the contract only requires "no defined order across event
/// kinds, FIFO within one" (§4.3), which a single FIFO channel trivially
/// satisfies, and every event that must be linearized per-connection already is.
pub(crate) enum DispatchMsg<U, A>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    A: ConnAdapter,
{
    ConnState {
        conn: Arc<Connection<U, A>>,
        online: bool,
    },
    Inbound {
        device: Device<U>,
        data: Vec<u8>,
    },
    Outbound {
        uid: U,
        ttl: Duration,
        data: Vec<u8>,
        reply: flume::Sender<Result<()>>,
    },
    CheckOnline {
        uid: U,
        reply: flume::Sender<bool>,
    },
    DeliverOnOnline {
        uid: U,
    },
    Kick {
        uid: U,
    },
    OnlineList {
        reply: flume::Sender<Vec<U>>,
    },
}

/// Cheap, cloneable handle to a running hub. All state lives in the dispatcher
/// task spawned by [`Hub::new`]; cloning a `Hub` just clones a channel sender.
pub struct Hub<U, A>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    A: ConnAdapter,
{
    tx: flume::Sender<DispatchMsg<U, A>>,
    auth_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Option<Duration>,
    // Kept on the handle (not just the dispatcher) so `register_connection`
    // can spawn each connection's ping task directly, without round-tripping
    // through the dispatcher for something that never touches `cons`.
    ping_generator: Option<Arc<dyn PingGenerator>>,
    before_send: Option<Arc<dyn BeforeSendHandler<U>>>,
    server_ping_interval: Duration,
}

impl<U, A> Clone for Hub<U, A>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    A: ConnAdapter,
{
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            auth_timeout: self.auth_timeout,
            write_timeout: self.write_timeout,
            read_timeout: self.read_timeout,
            ping_generator: self.ping_generator.clone(),
            before_send: self.before_send.clone(),
            server_ping_interval: self.server_ping_interval,
        }
    }
}

impl<U, A> Hub<U, A>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    A: ConnAdapter,
{
    /// Builds and starts the dispatcher task. Refuses construction if neither
    /// a ping supervisor nor a read timeout is configured (§4.3g) — there would
    /// be no way to detect a half-open socket.
    pub fn new(config: HubConfig<U>) -> Result<Self> {
        if !config.has_liveness_check() {
            return Err(Error::NoLivenessCheck);
        }

        let (tx, rx) = flume::bounded(0);
        let auth_timeout = config.auth_timeout;
        let write_timeout = config.write_timeout;
        let read_timeout = config.read_timeout;
        let server_ping_interval = config.server_ping_interval;
        let ping_generator = config.ping_generator.clone();
        let before_send = config.before_send.clone();

        let dispatcher = Dispatcher {
            actor: config.actor,
            queue: config.queue,
            sso: config.sso,
            server_ping_interval: config.server_ping_interval,
            ping_generator: config.ping_generator,
            bye_generator: config.bye_generator,
            before_receive: config.before_receive,
            before_send: config.before_send,
            after_send: config.after_send,
            close_handler: config.close_handler,
            cons: HashMap::new(),
            tx: tx.clone(),
            rx,
        };
        compio::runtime::spawn(dispatcher.run()).detach();

        Ok(Self {
            tx,
            auth_timeout,
            write_timeout,
            read_timeout,
            ping_generator,
            before_send,
            server_ping_interval,
        })
    }

    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        self.auth_timeout
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// External entry point for every transport listener: builds a
    /// [`Connection`], registers it, optionally starts the ping task, then
    /// blocks in `read_loop` until the connection dies. Callers run this in a
    /// dedicated task per connection (§4.4).
    pub async fn register_connection(&self, device: Device<U>, adapter: A) {
        let conn = Connection::new(device, adapter, self.tx.clone());

        if self
            .tx
            .send_async(DispatchMsg::ConnState {
                conn: Arc::clone(&conn),
                online: true,
            })
            .await
            .is_err()
        {
            return;
        }

        self.start_ping_task(&conn);
        conn.read_loop().await;
    }

    /// §4.3g ping supervisor: a per-connection ticker task, cancelled when the
    /// connection closes via a dropped `flume` sender (see
    /// [`Connection::set_ping_cancel`]).
    fn start_ping_task(&self, conn: &Arc<Connection<U, A>>) {
        let Some(ping_gen) = self.ping_generator.clone() else {
            return;
        };

        let (cancel_tx, cancel_rx) = flume::bounded(0);
        conn.set_ping_cancel(cancel_tx);

        let before_send = self.before_send.clone();
        let interval = self.server_ping_interval;
        let conn = Arc::clone(conn);

        spawn_supervised("ping", async move {
            loop {
                futures::select! {
                    () = compio::time::sleep(interval).fuse() => {
                        let payload = ping_gen.ping();
                        let payload = match &before_send {
                            Some(hook) => match hook.before_send(conn.device(), &payload).await {
                                Ok(Some(replaced)) => replaced,
                                Ok(None) => payload,
                                Err(()) => {
                                    warn!(device = ?conn.device(), "before_send hook rejected ping payload");
                                    continue;
                                }
                            },
                            None => payload,
                        };
                        if conn.write(&payload).await.is_err() {
                            return;
                        }
                    }
                    _ = cancel_rx.recv_async().fuse() => return,
                }
            }
        });
    }

    /// `Send(ctx, to, data, ttl)` (§4.4): deliver now if online; if `ttl > 0`
    /// and the online attempt failed (or the user was offline), fall back to
    /// the cache.
    pub async fn send(&self, to: U, data: Vec<u8>, ttl: Duration) -> Result<()> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        if self
            .tx
            .send_async(DispatchMsg::Outbound {
                uid: to,
                ttl,
                data,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Err(Error::ConnectionClosed);
        }
        reply_rx
            .recv_async()
            .await
            .unwrap_or(Err(Error::ConnectionClosed))
    }

    pub async fn check_online(&self, uid: U) -> bool {
        let (reply_tx, reply_rx) = flume::bounded(1);
        if self
            .tx
            .send_async(DispatchMsg::CheckOnline { uid, reply: reply_tx })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.recv_async().await.unwrap_or(false)
    }

    pub async fn online(&self) -> Vec<U> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        if self
            .tx
            .send_async(DispatchMsg::OnlineList { reply: reply_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.recv_async().await.unwrap_or_default()
    }

    pub async fn kick(&self, uid: U) {
        let _ = self.tx.send_async(DispatchMsg::Kick { uid }).await;
    }
}

/// Owns all mutable hub state. Runs on exactly one task; nothing outside this
/// struct ever touches `cons`.
struct Dispatcher<U, A>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    A: ConnAdapter,
{
    actor: Arc<dyn Actor<U>>,
    queue: Option<Arc<dyn Queue<U>>>,
    sso: bool,
    server_ping_interval: Duration,
    ping_generator: Option<Arc<dyn PingGenerator>>,
    bye_generator: Option<Arc<dyn ByeGenerator<U>>>,
    before_receive: Option<Arc<dyn BeforeReceiveHandler<U>>>,
    before_send: Option<Arc<dyn BeforeSendHandler<U>>>,
    after_send: Option<Arc<dyn AfterSendHandler<U>>>,
    close_handler: Option<Arc<dyn CloseHandler<U>>>,
    cons: HashMap<U, Vec<Arc<Connection<U, A>>>>,
    tx: flume::Sender<DispatchMsg<U, A>>,
    rx: flume::Receiver<DispatchMsg<U, A>>,
}

impl<U, A> Dispatcher<U, A>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    A: ConnAdapter,
{
    async fn run(mut self) {
        while let Ok(msg) = self.rx.recv_async().await {
            match msg {
                DispatchMsg::ConnState { conn, online } => {
                    if online {
                        self.go_online(conn);
                    } else {
                        self.go_offline(&conn);
                    }
                    debug!(online_users = self.cons.len(), "connection state change");
                }
                DispatchMsg::Inbound { device, data } => self.spawn_receive(device, data),
                DispatchMsg::Outbound { uid, ttl, data, reply } => {
                    self.handle_outbound(uid, ttl, data, reply);
                }
                DispatchMsg::CheckOnline { uid, reply } => {
                    let _ = reply.send(self.cons.contains_key(&uid));
                }
                DispatchMsg::DeliverOnOnline { uid } => {
                    if self.cons.contains_key(&uid) {
                        self.spawn_drain(uid);
                    }
                    debug!(?uid, "deliver-on-online");
                }
                DispatchMsg::Kick { uid } => self.inner_kick(uid),
                DispatchMsg::OnlineList { reply } => {
                    let _ = reply.send(self.cons.keys().cloned().collect());
                }
            }
        }
    }

    /// §4.3a registration.
    fn go_online(&mut self, conn: Arc<Connection<U, A>>) {
        let uid = conn.device().uid().clone();

        match self.cons.get(&uid) {
            None => {
                self.cons.insert(uid.clone(), vec![Arc::clone(&conn)]);
                info!(?uid, "device online");
            }
            Some(existing) if self.sso => {
                let mut survivors = Vec::new();
                for peer in existing {
                    if peer.shares_transport_with(&conn) {
                        survivors.push(Arc::clone(peer));
                    } else {
                        self.spawn_bye_then_close(Arc::clone(&conn), Arc::clone(peer));
                    }
                }
                survivors.push(Arc::clone(&conn));
                self.cons.insert(uid.clone(), survivors);
            }
            Some(existing) => {
                let already_present = existing.iter().any(|c| Arc::ptr_eq(c, &conn));
                if !already_present {
                    self.cons.get_mut(&uid).expect("checked above").push(conn);
                }
            }
        }

        self.signal_deliver_on_online(uid);
    }

    /// §4.3a's last step: emit a deliver-on-online event rather than draining
    /// inline. Sent through the same channel every other dispatcher input
    /// uses (rather than calling `spawn_drain` directly) so a future second
    /// source of "this user might have cached messages" (e.g. an explicit
    /// re-check) can reuse the same event instead of duplicating the drain
    /// call site. Must be a spawned send: the dispatcher is mid-message here
    /// and the channel is unbuffered, so sending from this task synchronously
    /// would deadlock against itself.
    fn signal_deliver_on_online(&self, uid: U) {
        let tx = self.tx.clone();
        spawn_supervised("deliver-on-online", async move {
            let _ = tx.send_async(DispatchMsg::DeliverOnOnline { uid }).await;
        });
    }

    /// §4.3b deregistration.
    fn go_offline(&mut self, conn: &Arc<Connection<U, A>>) {
        let uid = conn.device().uid().clone();
        let Some(existing) = self.cons.get(&uid) else {
            return;
        };

        let before = existing.len();
        let rest: Vec<_> = existing
            .iter()
            .filter(|c| !Arc::ptr_eq(c, conn))
            .cloned()
            .collect();

        if rest.len() == before {
            // Already gone — I9, no duplicate offline events.
            return;
        }

        if rest.is_empty() {
            self.cons.remove(&uid);
        } else {
            self.cons.insert(uid, rest);
        }

        self.spawn_close(Arc::clone(conn));
    }

    fn inner_kick(&mut self, uid: U) {
        if let Some(conns) = self.cons.remove(&uid) {
            for conn in conns {
                self.spawn_close(conn);
            }
        }
    }

    fn handle_outbound(&mut self, uid: U, ttl: Duration, data: Vec<u8>, reply: flume::Sender<Result<()>>) {
        if let Some(conns) = self.cons.get(&uid).filter(|l| !l.is_empty()) {
            self.spawn_delivery(conns.clone(), uid, data, ttl, reply);
        } else if ttl.is_zero() {
            let _ = reply.send(Err(Error::Offline));
        } else {
            self.spawn_cache(uid, data, ttl, reply);
        }
    }

    /// §4.3 event 2: BeforeReceive then OnReceive, off the dispatcher.
    fn spawn_receive(&self, device: Device<U>, data: Vec<u8>) {
        let actor = Arc::clone(&self.actor);
        let before_receive = self.before_receive.clone();
        spawn_supervised("receive", async move {
            let payload = match &before_receive {
                Some(hook) => match hook.before_receive(&device, &data).await {
                    Ok(Some(replaced)) => replaced,
                    Ok(None) => data,
                    Err(()) => {
                        warn!(?device, "before_receive hook rejected frame");
                        return;
                    }
                },
                None => data,
            };
            actor.on_receive(&device, &payload).await;
        });
    }

    /// §4.3c delivery. If every connection's write fails (or is rejected by
    /// `BeforeSend`) and `ttl > 0`, the payload is cached as a fallback
    /// rather than reported to the caller as a bare write error — the same
    /// retry contract `handle_outbound` applies when the user has no live
    /// connection at all.
    fn spawn_delivery(
        &self,
        conns: Vec<Arc<Connection<U, A>>>,
        uid: U,
        data: Vec<u8>,
        ttl: Duration,
        reply: flume::Sender<Result<()>>,
    ) {
        let before_send = self.before_send.clone();
        let after_send = self.after_send.clone();
        let queue = self.queue.clone();
        spawn_supervised("delivery", async move {
            let mut last_err = None;
            for conn in &conns {
                let payload = match &before_send {
                    Some(hook) => match hook.before_send(conn.device(), &data).await {
                        Ok(Some(replaced)) => replaced,
                        Ok(None) => data.clone(),
                        Err(()) => {
                            warn!(device = ?conn.device(), "before_send hook rejected connection");
                            last_err = Some(Error::HookRejected);
                            continue;
                        }
                    },
                    None => data.clone(),
                };

                match conn.write(&payload).await {
                    Ok(()) => {
                        last_err = None;
                        if let Some(hook) = &after_send {
                            let hook = Arc::clone(hook);
                            let dv = conn.device().clone();
                            let sent = payload.clone();
                            spawn_supervised("after_send", async move { hook.after_send(&dv, &sent).await });
                        }
                    }
                    Err(e) => last_err = Some(e),
                }
            }

            match last_err {
                None => {
                    let _ = reply.send(Ok(()));
                }
                Some(_) if !ttl.is_zero() => {
                    let Some(queue) = queue else {
                        let _ = reply.send(Err(Error::QueueRequired));
                        return;
                    };
                    let cache_ttl = Some(ttl).filter(|d| !d.is_zero());
                    let result = queue
                        .enq(&uid, data, cache_ttl)
                        .await
                        .map_err(Error::cache_failed);
                    let _ = reply.send(result);
                }
                Some(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    /// §4.3d cache.
    fn spawn_cache(&self, uid: U, data: Vec<u8>, ttl: Duration, reply: flume::Sender<Result<()>>) {
        let Some(queue) = self.queue.clone() else {
            let _ = reply.send(Err(Error::QueueRequired));
            return;
        };
        spawn_supervised("cache", async move {
            let ttl = Some(ttl).filter(|d| !d.is_zero());
            let result = queue
                .enq(&uid, data, ttl)
                .await
                .map_err(Error::cache_failed);
            let _ = reply.send(result);
        });
    }

    /// §4.3e queue drain.
    fn spawn_drain(&self, uid: U) {
        let Some(queue) = self.queue.clone() else {
            return;
        };
        let tx = self.tx.clone();
        spawn_supervised("drain", async move {
            loop {
                let item = match queue.deq(&uid).await {
                    Ok(Some(item)) => item,
                    Ok(None) => return,
                    Err(e) => {
                        warn!(?uid, error = %e, "queue dequeue failed, stopping drain");
                        return;
                    }
                };

                let (reply_tx, reply_rx) = flume::bounded(1);
                let sent = tx
                    .send_async(DispatchMsg::Outbound {
                        uid: uid.clone(),
                        ttl: Duration::ZERO,
                        data: item.clone(),
                        reply: reply_tx,
                    })
                    .await
                    .is_ok();

                let outcome = if sent { reply_rx.recv_async().await.ok() } else { None };

                match outcome {
                    Some(Ok(())) => continue,
                    _ => {
                        // Best-effort re-cache without TTL; next online transition retries.
                        if let Err(e) = queue.enq(&uid, item, None).await {
                            warn!(?uid, error = %e, "failed to re-cache after drain send failure");
                        }
                        return;
                    }
                }
            }
        });
    }

    /// §4.3f SSO bye-then-close.
    fn spawn_bye_then_close(&self, newcomer: Arc<Connection<U, A>>, victim: Arc<Connection<U, A>>) {
        let bye_generator = self.bye_generator.clone();
        let before_send = self.before_send.clone();
        let close_handler = self.close_handler.clone();
        spawn_supervised("bye_then_close", async move {
            if let Some(gen) = bye_generator {
                let payload = gen.bye(newcomer.device(), "sso", victim.device());
                let payload = match &before_send {
                    Some(hook) => match hook.before_send(victim.device(), &payload).await {
                        Ok(Some(replaced)) => Some(replaced),
                        Ok(None) => Some(payload),
                        Err(()) => {
                            warn!(device = ?victim.device(), "before_send hook rejected bye payload");
                            None
                        }
                    },
                    None => Some(payload),
                };
                if let Some(payload) = payload {
                    let _ = victim.write(&payload).await;
                }
            }
            victim.close().await;
            if let Some(hook) = close_handler {
                hook.on_close(victim.device()).await;
            }
        });
    }

    fn spawn_close(&self, conn: Arc<Connection<U, A>>) {
        let close_handler = self.close_handler.clone();
        spawn_supervised("close", async move {
            conn.close().await;
            if let Some(hook) = close_handler {
                hook.on_close(conn.device()).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hooks::ByeGenerator;
    use crate::queue::MemoryQueue;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct RecordingActor {
        tx: flume::Sender<(String, Vec<u8>)>,
    }

    #[async_trait]
    impl Actor<String> for RecordingActor {
        async fn on_receive(&self, dv: &Device<String>, data: &[u8]) {
            let _ = self.tx.send_async((dv.uid().clone(), data.to_vec())).await;
        }
    }

    struct NopActor;

    #[async_trait]
    impl Actor<String> for NopActor {
        async fn on_receive(&self, _dv: &Device<String>, _data: &[u8]) {}
    }

    struct StubBye;

    impl ByeGenerator<String> for StubBye {
        fn bye(&self, _kicker: &Device<String>, _reason: &str, _victim: &Device<String>) -> Vec<u8> {
            b"bye".to_vec()
        }
    }

    struct FailingQueue;

    #[async_trait]
    impl Queue<String> for FailingQueue {
        async fn enq(&self, _uid: &String, _data: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
            Err(Error::Io(io::Error::new(io::ErrorKind::Other, "qerr")))
        }

        async fn deq(&self, _uid: &String) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn len(&self, _uid: &String) -> Result<usize> {
            Ok(0)
        }
    }

    static NEXT_TEST_ADAPTER_ID: AtomicU64 = AtomicU64::new(0);

    /// A `ConnAdapter` double: yields a fixed script of inbound messages, then
    /// pends forever (mirrors scenario 1's "Read returns one message then
    /// blocks"). Writes and closes are recorded for assertions.
    struct TestAdapter {
        group: u64,
        reads: parking_lot::Mutex<Vec<Vec<u8>>>,
        writes: flume::Sender<Vec<u8>>,
        closed: Arc<std::sync::atomic::AtomicUsize>,
        fail_writes: bool,
    }

    impl TestAdapter {
        fn new(
            group: u64,
            reads: Vec<Vec<u8>>,
        ) -> (Self, flume::Receiver<Vec<u8>>, Arc<std::sync::atomic::AtomicUsize>) {
            Self::with_write_outcome(group, reads, false)
        }

        fn new_failing_writes(
            group: u64,
        ) -> (Self, flume::Receiver<Vec<u8>>, Arc<std::sync::atomic::AtomicUsize>) {
            Self::with_write_outcome(group, vec![], true)
        }

        fn with_write_outcome(
            group: u64,
            reads: Vec<Vec<u8>>,
            fail_writes: bool,
        ) -> (Self, flume::Receiver<Vec<u8>>, Arc<std::sync::atomic::AtomicUsize>) {
            let (writes, write_rx) = flume::unbounded();
            let closed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            (
                Self {
                    group,
                    reads: parking_lot::Mutex::new(reads),
                    writes,
                    closed: closed.clone(),
                    fail_writes,
                },
                write_rx,
                closed,
            )
        }
    }

    #[async_trait]
    impl ConnAdapter for TestAdapter {
        async fn read(&self) -> io::Result<Vec<u8>> {
            let next = {
                let mut reads = self.reads.lock();
                (!reads.is_empty()).then(|| reads.remove(0))
            };
            match next {
                Some(data) => Ok(data),
                None => futures::future::pending().await,
            }
        }

        async fn write(&self, data: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
            }
            let _ = self.writes.send(data.to_vec());
            Ok(())
        }

        async fn close(&self) -> io::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn share_conn(&self, other: &Self) -> bool {
            self.group == other.group
        }
    }

    fn new_id() -> u64 {
        NEXT_TEST_ADAPTER_ID.fetch_add(1, Ordering::Relaxed)
    }

    #[compio::test]
    async fn online_round_trip() {
        let (actor_tx, actor_rx) = flume::unbounded();
        let config = HubConfig::new(RecordingActor { tx: actor_tx })
            .with_read_timeout(Some(Duration::from_secs(5)));
        let hub = Hub::new(config).unwrap();

        let (adapter, write_rx, _closed) = TestAdapter::new(new_id(), vec![b"hello".to_vec()]);
        let registering_hub = hub.clone();
        compio::runtime::spawn(async move {
            registering_hub
                .register_connection(Device::new("u1".to_string(), None), adapter)
                .await;
        })
        .detach();

        let (uid, data) = actor_rx.recv_async().await.unwrap();
        assert_eq!(uid, "u1");
        assert_eq!(data, b"hello");

        hub.send("u1".to_string(), b"reply".to_vec(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(write_rx.recv_async().await.unwrap(), b"reply");
    }

    #[compio::test]
    async fn offline_with_ttl_caches_then_drains_on_reconnect() {
        let queue = Arc::new(MemoryQueue::new());
        let config = HubConfig::new(NopActor)
            .with_read_timeout(Some(Duration::from_secs(5)))
            .with_queue(Some(queue.clone() as Arc<dyn Queue<String>>));
        let hub = Hub::new(config).unwrap();

        hub.send("u2".to_string(), b"cache-me".to_vec(), Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(queue.len(&"u2".to_string()).await.unwrap(), 1);

        let (adapter, write_rx, _closed) = TestAdapter::new(new_id(), vec![]);
        let registering_hub = hub.clone();
        compio::runtime::spawn(async move {
            registering_hub
                .register_connection(Device::new("u2".to_string(), None), adapter)
                .await;
        })
        .detach();

        let got = compio::time::timeout(Duration::from_millis(100), write_rx.recv_async())
            .await
            .expect("drain should deliver within 100ms")
            .unwrap();
        assert_eq!(got, b"cache-me");

        // Give the drain loop one more scheduling turn to observe the queue empty.
        compio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.len(&"u2".to_string()).await.unwrap(), 0);
    }

    #[compio::test]
    async fn offline_without_ttl_returns_offline_error() {
        let config = HubConfig::new(NopActor).with_read_timeout(Some(Duration::from_secs(5)));
        let hub = Hub::<String, TestAdapter>::new(config).unwrap();

        let err = hub
            .send("u3".to_string(), b"x".to_vec(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Offline));
    }

    #[compio::test]
    async fn sso_displacement_closes_non_sharing_peer() {
        let config = HubConfig::new(NopActor)
            .with_read_timeout(Some(Duration::from_secs(5)))
            .with_bye_generator(StubBye);
        let hub = Hub::new(config).unwrap();

        let (adapter_a, write_rx_a, closed_a) = TestAdapter::new(new_id(), vec![]);
        let hub_a = hub.clone();
        compio::runtime::spawn(async move {
            hub_a
                .register_connection(Device::new("u4".to_string(), None), adapter_a)
                .await;
        })
        .detach();

        // Let A's registration land before B's, so displacement has something to displace.
        compio::time::sleep(Duration::from_millis(5)).await;

        let (adapter_b, _write_rx_b, _closed_b) = TestAdapter::new(new_id(), vec![]);
        let hub_b = hub.clone();
        compio::runtime::spawn(async move {
            hub_b
                .register_connection(Device::new("u4".to_string(), None), adapter_b)
                .await;
        })
        .detach();

        assert_eq!(write_rx_a.recv_async().await.unwrap(), b"bye");
        compio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(closed_a.load(Ordering::SeqCst), 1);

        let online = hub.online().await;
        assert_eq!(online.iter().filter(|u| *u == "u4").count(), 1);
    }

    #[compio::test]
    async fn shared_transport_peers_both_survive_sso() {
        let config = HubConfig::new(NopActor)
            .with_read_timeout(Some(Duration::from_secs(5)))
            .with_bye_generator(StubBye);
        let hub = Hub::new(config).unwrap();

        let group = new_id();
        let (adapter_a, _write_rx_a, closed_a) = TestAdapter::new(group, vec![]);
        let hub_a = hub.clone();
        compio::runtime::spawn(async move {
            hub_a
                .register_connection(Device::new("u5".to_string(), None), adapter_a)
                .await;
        })
        .detach();
        compio::time::sleep(Duration::from_millis(5)).await;

        let (adapter_b, _write_rx_b, _closed_b) = TestAdapter::new(group, vec![]);
        let hub_b = hub.clone();
        compio::runtime::spawn(async move {
            hub_b
                .register_connection(Device::new("u5".to_string(), None), adapter_b)
                .await;
        })
        .detach();
        compio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(closed_a.load(Ordering::SeqCst), 0);
    }

    #[compio::test]
    async fn cache_failure_propagates_as_cache_failed() {
        let config = HubConfig::new(NopActor)
            .with_read_timeout(Some(Duration::from_secs(5)))
            .with_queue(Some(Arc::new(FailingQueue) as Arc<dyn Queue<String>>));
        let hub = Hub::<String, TestAdapter>::new(config).unwrap();

        let err = hub
            .send("u6".to_string(), b"m".to_vec(), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_cache_failed());
    }

    #[compio::test]
    async fn send_without_queue_requires_cache_and_reports_required() {
        let config = HubConfig::new(NopActor)
            .with_read_timeout(Some(Duration::from_secs(5)))
            .with_queue(None);
        let hub = Hub::<String, TestAdapter>::new(config).unwrap();

        let err = hub
            .send("u7".to_string(), b"m".to_vec(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_queue_required());
    }

    #[test]
    fn hub_new_rejects_no_liveness_check() {
        let config = HubConfig::new(NopActor);
        assert!(matches!(
            Hub::<String, TestAdapter>::new(config),
            Err(Error::NoLivenessCheck)
        ));
    }

    struct RejectingBeforeSend;

    #[async_trait]
    impl BeforeSendHandler<String> for RejectingBeforeSend {
        async fn before_send(&self, _dv: &Device<String>, _data: &[u8]) -> std::result::Result<Option<Vec<u8>>, ()> {
            Err(())
        }
    }

    #[compio::test]
    async fn online_write_failure_with_ttl_falls_back_to_cache() {
        let queue = Arc::new(MemoryQueue::new());
        let config = HubConfig::new(NopActor)
            .with_read_timeout(Some(Duration::from_secs(5)))
            .with_queue(Some(queue.clone() as Arc<dyn Queue<String>>));
        let hub = Hub::new(config).unwrap();

        let (adapter, _write_rx, _closed) = TestAdapter::new_failing_writes(new_id());
        let registering_hub = hub.clone();
        compio::runtime::spawn(async move {
            registering_hub
                .register_connection(Device::new("u8".to_string(), None), adapter)
                .await;
        })
        .detach();
        compio::time::sleep(Duration::from_millis(5)).await;

        hub.send("u8".to_string(), b"retry-me".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            queue.deq(&"u8".to_string()).await.unwrap(),
            Some(b"retry-me".to_vec())
        );
    }

    #[compio::test]
    async fn before_send_rejection_reports_hook_rejected_without_ttl() {
        let config = HubConfig::new(NopActor)
            .with_read_timeout(Some(Duration::from_secs(5)))
            .with_before_send(RejectingBeforeSend);
        let hub = Hub::new(config).unwrap();

        let (adapter, _write_rx, _closed) = TestAdapter::new(new_id(), vec![]);
        let registering_hub = hub.clone();
        compio::runtime::spawn(async move {
            registering_hub
                .register_connection(Device::new("u9".to_string(), None), adapter)
                .await;
        })
        .detach();
        compio::time::sleep(Duration::from_millis(5)).await;

        let err = hub
            .send("u9".to_string(), b"x".to_vec(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HookRejected));
    }

    #[compio::test]
    async fn before_send_rejection_with_ttl_falls_back_to_cache() {
        let queue = Arc::new(MemoryQueue::new());
        let config = HubConfig::new(NopActor)
            .with_read_timeout(Some(Duration::from_secs(5)))
            .with_queue(Some(queue.clone() as Arc<dyn Queue<String>>))
            .with_before_send(RejectingBeforeSend);
        let hub = Hub::new(config).unwrap();

        let (adapter, _write_rx, _closed) = TestAdapter::new(new_id(), vec![]);
        let registering_hub = hub.clone();
        compio::runtime::spawn(async move {
            registering_hub
                .register_connection(Device::new("u11".to_string(), None), adapter)
                .await;
        })
        .detach();
        compio::time::sleep(Duration::from_millis(5)).await;

        hub.send("u11".to_string(), b"retry-me".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            queue.deq(&"u11".to_string()).await.unwrap(),
            Some(b"retry-me".to_vec())
        );
    }

    struct PanickingActor;

    #[async_trait]
    impl Actor<String> for PanickingActor {
        async fn on_receive(&self, _dv: &Device<String>, _data: &[u8]) {
            panic!("boom");
        }
    }

    #[compio::test]
    async fn panicking_actor_does_not_crash_dispatcher() {
        let config = HubConfig::new(PanickingActor).with_read_timeout(Some(Duration::from_secs(5)));
        let hub = Hub::new(config).unwrap();

        let (adapter, _write_rx, _closed) = TestAdapter::new(new_id(), vec![b"boom".to_vec()]);
        let registering_hub = hub.clone();
        compio::runtime::spawn(async move {
            registering_hub
                .register_connection(Device::new("u10".to_string(), None), adapter)
                .await;
        })
        .detach();

        // Give the panicking `on_receive` time to run and be caught.
        compio::time::sleep(Duration::from_millis(20)).await;

        // The dispatcher is still alive and answering requests.
        let online = hub.online().await;
        assert!(online.iter().any(|u| u == "u10"));
    }
}

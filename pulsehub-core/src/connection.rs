//! A live binding of one [`Device`] to one [`ConnAdapter`].

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::adapter::ConnAdapter;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::hub::DispatchMsg;

/// One Device × one Adapter, with the lifecycle guarantees §3/§4.2 require:
/// idempotent close (I1), at-most-once offline (I2), and serialized writes (I3).
///
/// Always held behind an `Arc`: the hub indexes connections by `Arc<Connection>`
/// identity (pointer equality, via [`Arc::ptr_eq`]) and helper tasks hold their
/// own clone while delivering.
pub struct Connection<U, A>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    A: ConnAdapter,
{
    device: Device<U>,
    adapter: Arc<A>,
    hub_tx: flume::Sender<DispatchMsg<U, A>>,
    closed: AtomicBool,
    offline_triggered: AtomicBool,
    // A 1-capacity channel pre-loaded with a single token acts as an async
    // mutex: acquiring is `recv_async`, releasing is `send`. This keeps the
    // write latch on the same "everything is a channel" footing as the rest
    // of the dispatcher, and never blocks an executor thread while held.
    write_permit: (flume::Sender<()>, flume::Receiver<()>),
    ping_cancel: Mutex<Option<flume::Sender<()>>>,
}

impl<U, A> Connection<U, A>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    A: ConnAdapter,
{
    pub(crate) fn new(device: Device<U>, adapter: A, hub_tx: flume::Sender<DispatchMsg<U, A>>) -> Arc<Self> {
        let (permit_tx, permit_rx) = flume::bounded(1);
        permit_tx.send(()).expect("fresh channel never closed");
        Arc::new(Self {
            device,
            adapter: Arc::new(adapter),
            hub_tx,
            closed: AtomicBool::new(false),
            offline_triggered: AtomicBool::new(false),
            write_permit: (permit_tx, permit_rx),
            ping_cancel: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn device(&self) -> &Device<U> {
        &self.device
    }

    /// True iff `self` and `other` are multiplexed on the same transport
    /// (delegates to the adapter; see [`ConnAdapter::share_conn`]).
    #[must_use]
    pub fn shares_transport_with(&self, other: &Self) -> bool {
        self.adapter.share_conn(&other.adapter)
    }

    /// Acquire the write latch, refuse if closed, otherwise forward to the
    /// adapter. A failed adapter write fires the offline latch before the
    /// error is returned (§4.2).
    pub async fn write(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        let Ok(_permit) = self.write_permit.1.recv_async().await else {
            return Err(Error::ConnectionClosed);
        };

        if self.closed.load(Ordering::Acquire) {
            let _ = self.write_permit.0.send(());
            return Err(Error::ConnectionClosed);
        }

        let result = self.adapter.write(data).await;
        let _ = self.write_permit.0.send(());

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.trigger_offline().await;
                Err(Error::Io(e))
            }
        }
    }

    /// Reads messages until the adapter fails, posting each as an inbound-frame
    /// event to the hub. Stops exactly when `read` returns an error (I8),
    /// firing the offline-triggered-once latch on the way out.
    pub async fn read_loop(self: Arc<Self>) {
        loop {
            match self.adapter.read().await {
                Ok(data) => {
                    let msg = DispatchMsg::Inbound {
                        device: self.device.clone(),
                        data,
                    };
                    if self.hub_tx.send_async(msg).await.is_err() {
                        return;
                    }
                }
                Err(_) => {
                    self.trigger_offline().await;
                    return;
                }
            }
        }
    }

    /// Arms the offline-triggered latch 0→1 (no-op if already armed) and, on
    /// the transition, posts an offline state-change event to the hub (I2, I9).
    pub async fn trigger_offline(self: &Arc<Self>) {
        if self
            .offline_triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let msg = DispatchMsg::ConnState {
                conn: Arc::clone(self),
                online: false,
            };
            let _ = self.hub_tx.send_async(msg).await;
        }
    }

    /// Atomically sets closed 0→1 (no-op otherwise); on the transition,
    /// cancels the ping loop and closes the adapter exactly once (I1).
    pub async fn close(self: &Arc<Self>) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.ping_cancel.lock().take();
            let _ = self.adapter.close().await;
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stores the cancellation handle for this connection's ping task.
    /// Dropping the sender (done by [`Self::close`]) closes the task's
    /// receiver, ending its tick loop — the same channel-closed-as-shutdown
    /// idiom the dispatcher's own event loop relies on.
    pub(crate) fn set_ping_cancel(&self, tx: flume::Sender<()>) {
        *self.ping_cancel.lock() = Some(tx);
    }
}

impl<U, A> fmt::Debug for Connection<U, A>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    A: ConnAdapter,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("device", &self.device)
            .field("closed", &self.is_closed())
            .finish()
    }
}

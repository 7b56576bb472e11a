//! Authenticated client identity.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

/// The authenticated identity of one client session.
///
/// `Device` is produced by the authenticator and handed to
/// [`crate::hub::Hub::register_connection`]; the hub never mutates it beyond the
/// meta map, and the user-id half (`uid`) is what the connection index in
/// [`crate::hub::Hub`] routes on. `session_id` is opaque to the hub — it exists
/// for application code and logging, never compared by the hub itself.
#[derive(Clone)]
pub struct Device<U> {
    inner: Arc<DeviceInner<U>>,
}

struct DeviceInner<U> {
    uid: U,
    session_id: Option<String>,
    meta: DashMap<String, String>,
}

impl<U> Device<U>
where
    U: Eq + std::hash::Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    /// Create a device for `uid`, optionally tagged with a session id.
    pub fn new(uid: U, session_id: impl Into<Option<String>>) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                uid,
                session_id: session_id.into(),
                meta: DashMap::new(),
            }),
        }
    }

    /// The routing identity of this device.
    pub fn uid(&self) -> &U {
        &self.inner.uid
    }

    /// The opaque per-session identifier, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.inner.session_id.as_deref()
    }

    /// Read a meta value, returning an empty string if unset. Never fails.
    pub fn get_meta(&self, key: &str) -> String {
        self.inner
            .meta
            .get(key)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Write a meta value. Safe to call concurrently from multiple tasks.
    pub fn put_meta(&self, key: impl Into<String>, val: impl Into<String>) {
        self.inner.meta.insert(key.into(), val.into());
    }
}

impl<U: fmt::Debug> fmt::Debug for Device<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("uid", &self.inner.uid)
            .field("session_id", &self.inner.session_id)
            .finish()
    }
}

impl<U: PartialEq> PartialEq for Device<U> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_round_trips() {
        let dv = Device::new("u1".to_string(), Some("sess-1".to_string()));
        assert_eq!(dv.get_meta("missing"), "");
        dv.put_meta("agent", "rust-test");
        assert_eq!(dv.get_meta("agent"), "rust-test");
    }

    #[test]
    fn clone_shares_identity_and_meta() {
        let dv = Device::new(7_u64, None);
        let clone = dv.clone();
        clone.put_meta("k", "v");
        assert_eq!(dv.get_meta("k"), "v");
        assert_eq!(dv, clone);
    }

    #[test]
    fn session_id_is_opaque() {
        let dv = Device::new("u2".to_string(), None::<String>);
        assert_eq!(dv.session_id(), None);
    }
}

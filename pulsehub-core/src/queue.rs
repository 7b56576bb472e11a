//! Offline message cache: the external [`Queue`] contract plus a default
//! in-process implementation.

use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::Result;

/// FIFO-per-user offline cache, consulted by the hub whenever a `Send` with
/// `ttl > 0` finds no live connection. All operations are per-user; a missing or
/// empty user entry is not an error.
#[async_trait]
pub trait Queue<U>: Send + Sync
where
    U: Send + Sync + 'static,
{
    /// Append `data` to `uid`'s FIFO. `ttl` of `None` (or zero) means no expiry.
    async fn enq(&self, uid: &U, data: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Pop the oldest non-expired item for `uid`. `Ok(None)` means the queue is
    /// empty or unknown for this user — never an error by itself.
    async fn deq(&self, uid: &U) -> Result<Option<Vec<u8>>>;

    /// Current non-expired item count for `uid`.
    async fn len(&self, uid: &U) -> Result<usize>;
}

struct Item {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Item {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

/// Default in-process [`Queue`]: a `DashMap` of per-user item vectors, each
/// guarded by its own `parking_lot::Mutex` so unrelated users never contend.
/// Empty entries are garbage-collected eagerly on dequeue/len.
#[derive(Default)]
pub struct MemoryQueue<U: Eq + Hash> {
    queues: DashMap<U, Mutex<Vec<Item>>>,
}

impl<U> MemoryQueue<U>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    fn retain_live(items: &mut Vec<Item>, now: Instant) {
        items.retain(|item| item.is_live(now));
    }
}

#[async_trait]
impl<U> Queue<U> for MemoryQueue<U>
where
    U: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    async fn enq(&self, uid: &U, data: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.filter(|d| !d.is_zero()).map(|d| Instant::now() + d);
        let entry = self
            .queues
            .entry(uid.clone())
            .or_insert_with(|| Mutex::new(Vec::new()));
        entry.lock().push(Item { data, expires_at });
        Ok(())
    }

    async fn deq(&self, uid: &U) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.queues.get(uid) else {
            return Ok(None);
        };
        let mut items = entry.lock();
        Self::retain_live(&mut items, Instant::now());

        if items.is_empty() {
            drop(items);
            drop(entry);
            self.queues.remove(uid);
            return Ok(None);
        }

        let popped = items.remove(0);
        let now_empty = items.is_empty();
        drop(items);
        drop(entry);
        if now_empty {
            self.queues.remove(uid);
        }
        Ok(Some(popped.data))
    }

    async fn len(&self, uid: &U) -> Result<usize> {
        let Some(entry) = self.queues.get(uid) else {
            return Ok(0);
        };
        let mut items = entry.lock();
        Self::retain_live(&mut items, Instant::now());
        let n = items.len();
        drop(items);
        drop(entry);
        if n == 0 {
            self.queues.remove(uid);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[compio::test]
    async fn fifo_order_preserved() {
        let q: MemoryQueue<String> = MemoryQueue::new();
        q.enq(&"u1".to_string(), b"m1".to_vec(), None).await.unwrap();
        q.enq(&"u1".to_string(), b"m2".to_vec(), None).await.unwrap();
        assert_eq!(q.deq(&"u1".to_string()).await.unwrap(), Some(b"m1".to_vec()));
        assert_eq!(q.deq(&"u1".to_string()).await.unwrap(), Some(b"m2".to_vec()));
        assert_eq!(q.deq(&"u1".to_string()).await.unwrap(), None);
    }

    #[compio::test]
    async fn unknown_user_is_empty_not_error() {
        let q: MemoryQueue<String> = MemoryQueue::new();
        assert_eq!(q.len(&"ghost".to_string()).await.unwrap(), 0);
        assert_eq!(q.deq(&"ghost".to_string()).await.unwrap(), None);
    }

    #[compio::test]
    async fn expired_items_are_skipped() {
        let q: MemoryQueue<String> = MemoryQueue::new();
        q.enq(&"u2".to_string(), b"stale".to_vec(), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        compio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.len(&"u2".to_string()).await.unwrap(), 0);
        assert_eq!(q.deq(&"u2".to_string()).await.unwrap(), None);
    }

    #[compio::test]
    async fn zero_ttl_never_expires() {
        let q: MemoryQueue<String> = MemoryQueue::new();
        q.enq(&"u3".to_string(), b"persist".to_vec(), Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(q.len(&"u3".to_string()).await.unwrap(), 1);
    }
}

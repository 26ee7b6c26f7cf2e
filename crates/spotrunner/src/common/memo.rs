use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::common::clock::ClockRef;
use crate::common::timeutils::to_chrono;

/// Memoized value that is recomputed once it gets older than its TTL.
///
/// Without a TTL the value lives as long as the memo itself. Concurrent callers that find the
/// memo empty wait for a single refresh instead of computing the value in parallel.
pub struct Memo<V> {
    clock: ClockRef,
    ttl: Option<Duration>,
    slot: Mutex<Option<(DateTime<Utc>, V)>>,
}

impl<V: Clone> Memo<V> {
    pub fn new(clock: ClockRef, ttl: Option<Duration>) -> Self {
        Self {
            clock,
            ttl,
            slot: Mutex::new(None),
        }
    }

    fn is_fresh(&self, computed_at: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => self.clock.now() - computed_at < to_chrono(ttl),
            None => true,
        }
    }

    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let mut slot = self.slot.lock().await;
        if let Some((computed_at, value)) = slot.as_ref() {
            if self.is_fresh(*computed_at) {
                return value.clone();
            }
        }
        let value = refresh().await;
        *slot = Some((self.clock.now(), value.clone()));
        value
    }

    /// Like [`Memo::get_or_refresh`], but failed refreshes are not remembered.
    pub async fn try_get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some((computed_at, value)) = slot.as_ref() {
            if self.is_fresh(*computed_at) {
                return Ok(value.clone());
            }
        }
        let value = refresh().await?;
        *slot = Some((self.clock.now(), value.clone()));
        Ok(value)
    }
}

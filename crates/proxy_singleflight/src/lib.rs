//! A thread-safe, deduplicating map that ensures an expensive async call is
//! executed only once per key, even when multiple concurrent requests ask
//! for it at the same time.
//!
//! This is used to collapse concurrent upstream metadata fetches
//! (`package-list`, `package:<name>`) into a single request, and inside
//! object-store backed content stores to deduplicate concurrent
//! `exists`/`stat`/`list` calls against the same key.
//!
//! The implementation uses `DashMap` for thread-safe storage and
//! `tokio::sync::broadcast` channels for coordinating between concurrent
//! waiters. A key is released the instant the in-flight call returns, not
//! after every waiter has finished reading the result, so the next arrival
//! is free to retry immediately.

use std::{
    fmt,
    hash::Hash,
    sync::{Arc, Weak},
};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::broadcast;

/// Error returned by [`SingleFlight::do_call`].
///
/// When multiple tasks race on the same key, only the winner runs the
/// provided function. Other tasks subscribe to a broadcast channel. If the
/// winner's future returns an error, the winner gets back `Call(err)` and
/// the channel is dropped without a value, so subscribers receive
/// `CoalescedCallFailed`.
#[derive(Debug)]
pub enum SingleFlightError<E> {
    /// The call itself returned an error.
    Call(E),
    /// The in-flight call this task was waiting on failed or was dropped
    /// before it could publish a result.
    CoalescedCallFailed,
}

impl<E: fmt::Display> fmt::Display for SingleFlightError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SingleFlightError::Call(e) => write!(f, "call failed: {e}"),
            SingleFlightError::CoalescedCallFailed => {
                write!(f, "a coalesced call failed before publishing a result")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for SingleFlightError<E> {}

/// A keyed single-flight primitive: `do_call(key, f)` ensures that at most
/// one invocation of `f` runs concurrently per key. Other callers for the
/// same key block on the in-flight call and receive the same result.
#[derive(Clone)]
pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    map: DashMap<K, PendingOrDone<V>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Creates an empty `SingleFlight`.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Returns the number of entries currently tracked (including pending).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if no entry is tracked.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    /// Runs `f` for `key`, coalescing concurrent calls for the same key.
    ///
    /// The first caller for a key runs `f` to completion and publishes the
    /// result to any callers that arrived while it was in flight. The key
    /// is released the moment `f` returns (success or failure): a call that
    /// arrives after that point starts a fresh invocation of `f`, it is
    /// never served a stale cached value.
    pub async fn do_call<E, Fut, F>(&self, key: K, f: F) -> Result<V, SingleFlightError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, E>>,
    {
        let sender = match self.map.entry(key.clone()) {
            Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(1);
                let tx = Arc::new(tx);
                entry.insert(PendingOrDone::Pending(Arc::downgrade(&tx)));
                tx
            }
            Entry::Occupied(mut entry) => match entry.get() {
                PendingOrDone::Done(v) => return Ok(v.clone()),
                PendingOrDone::Pending(weak_tx) => {
                    if let Some(tx) = weak_tx.upgrade() {
                        // Subscribe before dropping anything so we never miss the send.
                        let mut rx = tx.subscribe();
                        drop(tx);
                        drop(entry);

                        return rx
                            .recv()
                            .await
                            .map_err(|_err| SingleFlightError::CoalescedCallFailed);
                    }

                    // The previous sender was dropped without publishing a value
                    // (e.g. its task was cancelled); become the new leader.
                    let (tx, _) = broadcast::channel(1);
                    let tx = Arc::new(tx);
                    entry.insert(PendingOrDone::Pending(Arc::downgrade(&tx)));
                    tx
                }
            },
        };

        // We won the race: release the key immediately on return so the next
        // caller is free to retry, regardless of whether `f` succeeds.
        let result = f().await;
        self.map.remove(&key);
        match result {
            Ok(value) => {
                let _ = sender.send(value.clone());
                Ok(value)
            }
            Err(err) => Err(SingleFlightError::Call(err)),
        }
    }

    /// Clears all entries matching the predicate.
    pub fn retain<F>(&self, mut f: F)
    where
        F: FnMut(&K, &PendingOrDone<V>) -> bool,
    {
        self.map.retain(|k, v| f(k, v));
    }
}

/// Internal state for a tracked key.
#[derive(Clone)]
pub enum PendingOrDone<T> {
    /// A call is in flight; waiters subscribe to the sender.
    Pending(Weak<broadcast::Sender<T>>),
    /// Reserved for callers that want to retain a completed value; unused by
    /// `do_call`, which always releases the key on completion so repeated
    /// calls re-run `f`. Kept so other callers (e.g. caches layered on top
    /// of `SingleFlight`) can distinguish "in flight" from "settled" while
    /// sharing the same map representation.
    Done(T),
}

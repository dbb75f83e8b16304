//! Completion latch: an immutable completion signal set exactly once,
//! with an outcome readable by every waiter once signalled.
//!
//! Atomic tri-state (`AtomicU8`) plus a `tokio::sync::Notify`: a waiter
//! that arrives before the value is set registers with `Notify` and wakes
//! once `set` fires; a waiter that arrives after sees the set state
//! directly and never blocks.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[repr(u8)]
enum LatchState {
    Uninitialized,
    Initializing,
    Initialized,
}

/// A one-shot, multi-waiter completion signal for a value of type `T`.
pub struct DownloadLatch<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
    notify: Notify,
}

unsafe impl<T: Sync> Sync for DownloadLatch<T> {}
unsafe impl<T: Send> Send for DownloadLatch<T> {}

impl<T> Drop for DownloadLatch<T> {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) == LatchState::Initialized as u8 {
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

impl<T> Default for DownloadLatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The latch was waited on by a follower whose context was cancelled
/// before the leader completed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cancelled while waiting for an in-progress download")]
pub struct Cancelled;

impl<T> DownloadLatch<T> {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LatchState::Uninitialized as u8),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            notify: Notify::new(),
        }
    }

    /// Waits for the outcome, or returns `Cancelled` if `cancellation`
    /// fires first. The leader itself never calls this.
    pub async fn wait(&self, cancellation: &CancellationToken) -> Result<&T, Cancelled> {
        let notified = self.notify.notified();
        if self.state.load(Ordering::Acquire) != LatchState::Initialized as u8 {
            tokio::select! {
                _ = notified => {}
                _ = cancellation.cancelled() => return Err(Cancelled),
            }
        }
        Ok(unsafe { (*self.value.get()).assume_init_ref() })
    }

    /// Sets the outcome and wakes every waiter. Called exactly once, by
    /// the leader.
    pub fn set(&self, value: T) {
        if self
            .state
            .compare_exchange(
                LatchState::Uninitialized as u8,
                LatchState::Initializing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            panic!("DownloadLatch::set called more than once");
        }

        unsafe { *self.value.get() = MaybeUninit::new(value) };
        self.state.store(LatchState::Initialized as u8, Ordering::Release);
        self.notify.notify_waiters();
    }
}

//! # Completion Synchronizer
//!
//! Binary lock shared between the blocking survey steps (broadcast, receive) and the
//! asynchronous radio event handlers (rx-complete, tx-complete, rx-timeout, reset).
//!
//! ## States
//!
//! - **Available** (count 1): nobody is waiting on the radio
//! - **Held** (count 0): a broadcaster or receiver armed the radio and waits for completion
//!
//! The lock is a capacity-1 channel carrying a unit token. Taking the token acquires the
//! lock, putting it back releases it. A full channel refuses a second token, so the count
//! can never leave `{0, 1}` even if two handlers race to release.
//!
//! ## Rendezvous Pattern
//!
//! A blocking step acquires once to enter its critical section, arms the radio, then
//! acquires a second time. That second acquire only succeeds after a handler released the
//! token, and the step finishes by releasing it again, leaving the lock available.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

type TokenChannel = Channel<CriticalSectionRawMutex, (), 1>;

/// Outcome of a guarded release
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum Release {
    /// The lock was held and is now available, a waiter (if any) is woken
    Released,
    /// The lock was already available, nothing changed
    AlreadyAvailable,
}

pub struct CompletionSync {
    token: TokenChannel,
}

impl Default for CompletionSync {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSync {
    /// Creates the lock in the available state
    pub fn new() -> Self {
        let sync = CompletionSync { token: Channel::new() };
        // A fresh capacity-1 channel always has room for the first token
        let _ = sync.token.try_send(());
        sync
    }

    /// Waits until the lock is available and takes it
    pub async fn acquire(&self) {
        self.token.receive().await;
    }

    /// Takes the lock only if it is available right now
    pub fn try_acquire(&self) -> bool {
        self.token.try_receive().is_ok()
    }

    /// Releases the lock unless it is already available
    ///
    /// This is the only release path. Handlers use the result to tell an expected
    /// completion from a stray one.
    pub fn release(&self) -> Release {
        match self.token.try_send(()) {
            Ok(()) => Release::Released,
            Err(_) => Release::AlreadyAvailable,
        }
    }

    /// True when nobody holds the lock, i.e. no step is waiting on the radio
    pub fn is_available(&self) -> bool {
        self.token.is_full()
    }

    /// Current semaphore count, always 0 or 1
    pub fn count(&self) -> usize {
        self.token.len()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use embassy_futures::join::join;
    use embassy_futures::yield_now;
    use futures::executor::block_on;

    #[test]
    fn starts_available() {
        let sync = CompletionSync::new();
        assert!(sync.is_available());
        assert_eq!(sync.count(), 1);
    }

    #[test]
    fn double_release_is_absorbed() {
        let sync = CompletionSync::new();
        assert!(sync.try_acquire());
        assert_eq!(sync.count(), 0);

        // e.g. tx-complete immediately followed by rx-timeout
        assert_eq!(sync.release(), Release::Released);
        assert_eq!(sync.release(), Release::AlreadyAvailable);
        assert_eq!(sync.count(), 1);

        assert!(sync.try_acquire());
        assert!(!sync.try_acquire());
        assert_eq!(sync.count(), 0);
    }

    #[test]
    fn second_acquire_waits_for_handler_release() {
        let sync = CompletionSync::new();
        let mut handler_fired = false;

        block_on(async {
            let waiter = async {
                sync.acquire().await;
                // radio armed here
                sync.acquire().await;
                sync.release();
            };
            let handler = async {
                for _ in 0..4 {
                    yield_now().await;
                }
                assert!(!sync.is_available());
                handler_fired = sync.release() == Release::Released;
            };
            join(waiter, handler).await;
        });

        assert!(handler_fired);
        assert!(sync.is_available());
    }
}

//! Synchronization primitives.
//!
//! Short critical sections use `SpinLock`. Threads that must wait for a
//! state change park on a [`WaitChannel`], which reproduces the classic
//! wait-channel protocol: snapshot the channel while still holding the lock
//! that guards the condition, drop the lock, then sleep until a wakeup that
//! happened after the snapshot. Wakeups are never lost: a `wake_all` between
//! `prepare` and `wait` makes the `wait` return immediately.

use core::hint;
use core::sync::atomic::{AtomicU64, Ordering};

pub type SpinLock<T> = spin::Mutex<T>;
pub type SpinGuard<'a, T> = spin::MutexGuard<'a, T>;

/// A condition to sleep on. Carries no data; the guarded state itself is the
/// condition, and waiters must recheck it after waking.
pub struct WaitChannel {
    name: &'static str,
    generation: AtomicU64,
}

/// Snapshot of a channel taken before releasing the condition's lock.
#[derive(Clone, Copy)]
pub struct WaitToken(u64);

impl WaitChannel {
    pub const fn new(name: &'static str) -> WaitChannel {
        WaitChannel {
            name,
            generation: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Must be called while still holding the lock that guards the awaited
    /// condition; the returned token orders this sleeper against wakeups.
    pub fn prepare(&self) -> WaitToken {
        WaitToken(self.generation.load(Ordering::Acquire))
    }

    /// Sleeps until a `wake_all` after the token was prepared. The caller
    /// must have released the condition's lock and must recheck the
    /// condition once this returns.
    pub fn wait(&self, token: WaitToken) {
        while self.generation.load(Ordering::Acquire) == token.0 {
            hint::spin_loop();
        }
    }

    /// Wakes every sleeper on the channel.
    pub fn wake_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn wake_before_wait_is_not_lost() {
        let wc = WaitChannel::new("test");
        let token = wc.prepare();
        wc.wake_all();
        // Returns immediately instead of sleeping forever.
        wc.wait(token);
    }

    #[test]
    fn wait_blocks_until_woken() {
        let wc = Arc::new(WaitChannel::new("test"));
        let woke = Arc::new(AtomicBool::new(false));

        let handle = {
            let wc = Arc::clone(&wc);
            let woke = Arc::clone(&woke);
            std::thread::spawn(move || {
                let token = wc.prepare();
                wc.wait(token);
                woke.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!woke.load(Ordering::SeqCst));

        wc.wake_all();
        handle.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn name_is_kept() {
        assert_eq!(WaitChannel::new("wc_wire").name(), "wc_wire");
    }
}

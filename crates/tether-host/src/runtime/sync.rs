//! Synchronization primitives abstraction for loom testing.
//!
//! When compiled with `--cfg loom`, the dispatcher queue, the context table
//! and stream membership use loom's mutex so `tether-loom-tests` can explore
//! every interleaving of the real code. Otherwise these are the std types.
//!
//! Id counters stay on std atomics in every configuration: they are `static`
//! and loom atomics cannot be constructed in a const context.

#[cfg(loom)]
pub(crate) use loom::sync::{Mutex, MutexGuard};

#[cfg(not(loom))]
pub(crate) use std::sync::{Mutex, MutexGuard};

use std::sync::PoisonError;

/// Lock `mutex`, recovering the guard if a previous holder panicked.
///
/// Every critical section in this crate leaves its state consistent before
/// running user code, so a poisoned lock carries no torn invariant.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_recovers_from_poison() {
        let shared = Arc::new(Mutex::new(1u32));
        let poisoner = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(shared.is_poisoned());
        *lock(&shared) += 1;
        assert_eq!(*lock(&shared), 2);
    }
}

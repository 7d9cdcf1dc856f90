//! Lock strategy abstraction for tier state.
//!
//! Each tier serializes behind exactly one lock. Embedders that own a
//! single-threaded heap can instantiate tiers with [`UnsyncPolicy`] and
//! pay nothing for mutual exclusion; the concurrent dispatcher uses
//! [`MutexPolicy`]. The trait exists so the choice is a type parameter
//! rather than duplicated tier code.

use parking_lot::{Mutex, MutexGuard};
use std::cell::{RefCell, RefMut};
use std::ops::DerefMut;

/// A lockable cell holding one tier's state.
pub trait LockPolicy<T> {
    type Guard<'a>: DerefMut<Target = T>
    where
        Self: 'a;

    fn new(value: T) -> Self;

    /// Acquires exclusive access to the state.
    fn lock(&self) -> Self::Guard<'_>;
}

/// Mutual exclusion via `parking_lot::Mutex`; the concurrent default.
pub struct MutexPolicy<T>(Mutex<T>);

impl<T> LockPolicy<T> for MutexPolicy<T> {
    type Guard<'a>
        = MutexGuard<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.0.lock()
    }
}

/// No mutual exclusion; a `RefCell` for single-threaded embeddings.
/// Not `Sync`, so misuse is a compile error rather than a data race.
pub struct UnsyncPolicy<T>(RefCell<T>);

impl<T> LockPolicy<T> for UnsyncPolicy<T> {
    type Guard<'a>
        = RefMut<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        Self(RefCell::new(value))
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.0.borrow_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bump<P: LockPolicy<u32>>(cell: &P) {
        *cell.lock() += 1;
    }

    #[test]
    fn mutex_policy_locks() {
        let cell = MutexPolicy::new(0u32);
        bump(&cell);
        bump(&cell);
        assert_eq!(*cell.lock(), 2);
    }

    #[test]
    fn unsync_policy_borrows() {
        let cell = UnsyncPolicy::new(0u32);
        bump(&cell);
        assert_eq!(*cell.lock(), 1);
    }

    #[test]
    fn mutex_policy_is_shareable_across_threads() {
        let cell = std::sync::Arc::new(MutexPolicy::new(0u32));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cell = std::sync::Arc::clone(&cell);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *cell.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }
        assert_eq!(*cell.lock(), 4000);
    }
}

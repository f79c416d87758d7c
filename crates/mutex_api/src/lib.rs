//! A simple mutex API.
//!
//! Code that must run both under a kernel spinlock and under ordinary host
//! mutexes (in tests) is written against the [`Mutex`] trait and picks the
//! implementation at the type level.
#![cfg_attr(not(test), no_std)]

#[cfg(feature = "std")]
extern crate std;

use core::ops::DerefMut;

/// A mutex.
pub trait Mutex {
    /// The type of the data that the mutex protects.
    type Data;

    /// The type of the guard that the `lock` method returns.
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Creates a new mutex.
    fn new(data: Self::Data) -> Self;

    /// Locks the mutex.
    fn lock(&self) -> Self::Guard<'_>;
}

#[cfg(feature = "std")]
mod std_mutex {
    use super::Mutex;

    /// An adapter implementing [`Mutex`] on top of [`std::sync::Mutex`].
    ///
    /// The trait has no channel for lock poisoning, so a poisoned lock is
    /// re-entered and its data handed out as-is.
    #[derive(Debug, Default)]
    pub struct StdMutex<T>(std::sync::Mutex<T>);

    impl<T> Mutex for StdMutex<T> {
        type Data = T;

        type Guard<'a>
            = std::sync::MutexGuard<'a, T>
        where
            T: 'a;

        fn new(data: Self::Data) -> Self {
            Self(std::sync::Mutex::new(data))
        }

        fn lock(&self) -> Self::Guard<'_> {
            self.0
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }
}

#[cfg(feature = "std")]
pub use self::std_mutex::StdMutex;

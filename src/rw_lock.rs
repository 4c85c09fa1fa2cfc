#[cfg(all(feature = "parking_lot", not(feature = "shuttle")))]
pub(crate) use parking_lot::RwLock;

#[cfg(any(not(feature = "parking_lot"), feature = "shuttle"))]
pub(crate) use fallback::RwLock;

/// Same surface as the parking_lot lock, backed by the std (or shuttle)
/// RwLock with poisoning ignored.
#[cfg(any(not(feature = "parking_lot"), feature = "shuttle"))]
mod fallback {
    use std::ops::{Deref, DerefMut};

    #[cfg(feature = "shuttle")]
    use shuttle::sync as sync_impl;
    #[cfg(not(feature = "shuttle"))]
    use std::sync as sync_impl;

    #[derive(Default, Debug)]
    pub struct RwLock<T>(sync_impl::RwLock<T>);

    #[derive(Debug)]
    pub struct RwLockReadGuard<'rwlock, T>(sync_impl::RwLockReadGuard<'rwlock, T>);

    #[derive(Debug)]
    pub struct RwLockWriteGuard<'rwlock, T>(sync_impl::RwLockWriteGuard<'rwlock, T>);

    impl<T> RwLock<T> {
        pub fn new(t: T) -> Self {
            Self(sync_impl::RwLock::new(t))
        }

        pub fn read(&self) -> RwLockReadGuard<'_, T> {
            RwLockReadGuard(self.0.read().unwrap())
        }

        pub fn write(&self) -> RwLockWriteGuard<'_, T> {
            RwLockWriteGuard(self.0.write().unwrap())
        }
    }

    impl<T> Deref for RwLockReadGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl<T> Deref for RwLockWriteGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl<T> DerefMut for RwLockWriteGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.0
        }
    }
}

pub use std::sync::atomic;
pub use std::sync::Arc;

/// A mutex that treats poisoning as a bug.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct Mutex<T: ?Sized>(std::sync::Mutex<T>);

impl<T> Mutex<T> {
    #[must_use]
    #[inline]
    pub fn new(value: T) -> Self {
        Self(std::sync::Mutex::new(value))
    }
}

impl<T: ?Sized> Mutex<T> {
    #[must_use]
    #[inline]
    pub fn lock(&self) -> std::sync::MutexGuard<T> {
        self.0.lock().unwrap()
    }

    #[must_use]
    #[inline]
    pub fn try_lock(&self) -> std::sync::MutexGuard<T> {
        self.0.try_lock().unwrap()
    }
}

/// A read-write lock
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct RwLock<T: ?Sized>(std::sync::RwLock<T>);

impl<T> RwLock<T> {
    #[must_use]
    #[inline]
    pub fn new(value: T) -> RwLock<T> {
        Self(std::sync::RwLock::new(value))
    }
}

impl<T: ?Sized> RwLock<T> {
    #[must_use]
    #[inline]
    pub fn read(&self) -> std::sync::RwLockReadGuard<T> {
        self.0.read().unwrap()
    }

    #[must_use]
    #[inline]
    pub fn try_read(&self) -> std::sync::RwLockReadGuard<T> {
        self.0.try_read().unwrap()
    }

    #[must_use]
    #[inline]
    pub fn write(&self) -> std::sync::RwLockWriteGuard<T> {
        self.0.write().unwrap()
    }

    #[must_use]
    #[inline]
    pub fn try_write(&self) -> std::sync::RwLockWriteGuard<T> {
        self.0.try_write().unwrap()
    }
}

/// A condition variable paired with [`Mutex`].
///
/// Waiters must pass the guard of the mutex that protects the waited-on
/// state, as with [`std::sync::Condvar`].
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct Condvar(std::sync::Condvar);

impl Condvar {
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self(std::sync::Condvar::new())
    }

    #[must_use]
    #[inline]
    pub fn wait<'a, T>(&self, guard: std::sync::MutexGuard<'a, T>) -> std::sync::MutexGuard<'a, T> {
        self.0.wait(guard).unwrap()
    }

    #[inline]
    pub fn notify_one(&self) {
        self.0.notify_one();
    }

    #[inline]
    pub fn notify_all(&self) {
        self.0.notify_all();
    }
}

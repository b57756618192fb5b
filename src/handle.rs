//! Single-owner wrapper around a native descriptor.
//!
//! The raw value lives behind a lock so that `close` can be called through a
//! shared reference, from any thread, while other threads use the handle.
//! Once closed the slot is empty and every later use short-circuits with
//! `ERROR_INVALID_HANDLE` instead of reaching the OS, which may already have
//! recycled the value.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::ErrorCode;
use crate::sys::{Captured, Os, RawHandle};

/// How a kind of descriptor is released.
pub(crate) trait Kind {
    const NAME: &'static str;

    fn release(os: &dyn Os, raw: RawHandle) -> Captured<bool>;
}

pub(crate) struct DeviceKind;
pub(crate) struct EventKind;
pub(crate) struct KeyKind;

impl Kind for DeviceKind {
    const NAME: &'static str = "device";

    fn release(os: &dyn Os, raw: RawHandle) -> Captured<bool> {
        os.close_handle(raw)
    }
}

impl Kind for EventKind {
    const NAME: &'static str = "event";

    fn release(os: &dyn Os, raw: RawHandle) -> Captured<bool> {
        os.close_handle(raw)
    }
}

impl Kind for KeyKind {
    const NAME: &'static str = "registry key";

    fn release(os: &dyn Os, raw: RawHandle) -> Captured<bool> {
        os.reg_close_key(raw)
    }
}

pub(crate) struct OwnedHandle<K: Kind> {
    os: Arc<dyn Os>,
    raw: RwLock<Option<RawHandle>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Kind> OwnedHandle<K> {
    pub fn new(os: Arc<dyn Os>, raw: RawHandle) -> OwnedHandle<K> {
        OwnedHandle {
            os,
            raw: RwLock::new(Some(raw)),
            _kind: PhantomData,
        }
    }

    /// Runs `f` with the raw value, keeping it from being closed meanwhile.
    /// Returns `closed` untouched when the handle is already closed.
    pub fn with<T, F>(&self, closed: T, f: F) -> T
    where
        F: FnOnce(&dyn Os, RawHandle) -> T,
    {
        let guard = self.raw.read().unwrap_or_else(PoisonError::into_inner);
        match *guard {
            Some(raw) => f(&*self.os, raw),
            None => closed,
        }
    }

    /// Like [`with`](Self::with) for calls returning a captured value.
    pub fn call<T, F>(&self, closed: T, f: F) -> Captured<T>
    where
        F: FnOnce(&dyn Os, RawHandle) -> Captured<T>,
    {
        self.with(Captured::new(closed, ErrorCode::INVALID_HANDLE), f)
    }

    /// Runs a call that may block with a copy of the raw value, without
    /// keeping [`close`](Self::close) out. A close racing with `f` leaves the
    /// OS with a stale value, which it rejects as an invalid handle, and is
    /// how blocked waits and synchronous transfers get interrupted.
    pub fn call_unlocked<T, F>(&self, closed: T, f: F) -> Captured<T>
    where
        F: FnOnce(&dyn Os, RawHandle) -> Captured<T>,
    {
        let raw = *self.raw.read().unwrap_or_else(PoisonError::into_inner);
        match raw {
            Some(raw) => f(&*self.os, raw),
            None => Captured::new(closed, ErrorCode::INVALID_HANDLE),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.raw
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Releases the descriptor. A second call fails with `ERROR_INVALID_HANDLE`.
    pub fn close(&self) -> Captured<bool> {
        let mut guard = self.raw.write().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(raw) => {
                debug!("closing {} {:?}", K::NAME, raw);
                K::release(&*self.os, raw)
            }
            None => Captured::new(false, ErrorCode::INVALID_HANDLE),
        }
    }
}

impl<K: Kind> Drop for OwnedHandle<K> {
    fn drop(&mut self) {
        let raw = self
            .raw
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(raw) = raw {
            let closed = K::release(&*self.os, raw);
            if !closed.value {
                warn!(
                    "failed to release {} {:?}: {}",
                    K::NAME,
                    raw,
                    closed.last_error
                );
            }
        }
    }
}

impl<K: Kind> fmt::Debug for OwnedHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let raw = *self.raw.read().unwrap_or_else(PoisonError::into_inner);
        match raw {
            Some(raw) => write!(f, "{}({:?})", K::NAME, raw),
            None => write!(f, "{}(closed)", K::NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::sim::Sim;
    use crate::sys::{GENERIC_READ, OPEN_EXISTING};

    fn device(sim: &Sim) -> OwnedHandle<DeviceKind> {
        let raw = sim
            .create_file("COM1", GENERIC_READ, 0, OPEN_EXISTING, 0)
            .value;
        OwnedHandle::new(Arc::new(sim.clone()), raw)
    }

    #[test]
    fn second_close_is_invalid_handle() {
        let sim = Sim::new();
        sim.add_device("COM1");
        let h = device(&sim);

        assert!(h.close().value);
        let again = h.close();
        assert!(!again.value);
        assert_eq!(again.last_error, ErrorCode::INVALID_HANDLE);
        assert!(h.is_closed());
    }

    #[test]
    fn closed_handle_never_reaches_os() {
        let sim = Sim::new();
        sim.add_device("COM1");
        let h = device(&sim);
        h.close();

        let r = h.call(false, |_, _| panic!("reached the OS"));
        assert_eq!(r.last_error, ErrorCode::INVALID_HANDLE);
    }

    #[test]
    fn unlocked_call_lets_close_through() {
        let sim = Sim::new();
        sim.add_device("COM1");
        let h = device(&sim);

        // A close issued while the call is in progress does not wait for it.
        let r = h.call_unlocked(false, |_, _| {
            assert!(h.close().value);
            Captured::new(true, ErrorCode::SUCCESS)
        });
        assert!(r.value);
        assert!(h.is_closed());
        let r = h.call_unlocked(false, |_, _| panic!("reached the OS"));
        assert_eq!(r.last_error, ErrorCode::INVALID_HANDLE);
    }

    #[test]
    fn drop_releases() {
        let sim = Sim::new();
        let dev = sim.add_device("COM1");
        {
            let _h = device(&sim);
            assert_eq!(dev.open_count(), 1);
        }
        assert_eq!(dev.open_count(), 0);
    }
}

//! Event objects and waiting.

use std::cmp;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, ErrorCode, Result};
use crate::handle::{EventKind, OwnedHandle};
use crate::sys::{Os, RawHandle, INFINITE, WAIT_ABANDONED, WAIT_OBJECT_0, WAIT_TIMEOUT};

/// How long a wait may block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// Block until signaled.
    Infinite,
    /// Block at most this many milliseconds; zero polls.
    Millis(u32),
}

impl Timeout {
    /// A wait that only tests the current state.
    pub const POLL: Timeout = Timeout::Millis(0);

    /// The native timeout value. Finite waits are clamped below `INFINITE`.
    pub fn as_millis(self) -> u32 {
        match self {
            Timeout::Infinite => INFINITE,
            Timeout::Millis(ms) => cmp::min(ms, INFINITE - 1),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Timeout {
        let ms = cmp::min(d.as_millis(), u128::from(INFINITE - 1));
        Timeout::Millis(ms as u32)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(d: Option<Duration>) -> Timeout {
        d.map_or(Timeout::Infinite, Timeout::from)
    }
}

impl From<u32> for Timeout {
    fn from(ms: u32) -> Timeout {
        Timeout::Millis(ms)
    }
}

/// How a wait ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The object was signaled.
    Signaled,
    /// The timeout elapsed first.
    Timeout,
    /// The object was a mutex whose owner exited.
    Abandoned,
    /// The wait call failed.
    Failed(ErrorCode),
}

impl WaitOutcome {
    pub(crate) fn from_raw(ret: u32, last_error: ErrorCode) -> WaitOutcome {
        match ret {
            WAIT_OBJECT_0 => WaitOutcome::Signaled,
            WAIT_TIMEOUT => WaitOutcome::Timeout,
            WAIT_ABANDONED => WaitOutcome::Abandoned,
            _ => WaitOutcome::Failed(last_error),
        }
    }

    /// `Ok` only when signaled.
    pub fn into_result(self) -> Result<()> {
        match self {
            WaitOutcome::Signaled => Ok(()),
            other => Err(Error::Wait(other)),
        }
    }
}

/// An event object, signaled to wake waiters.
pub struct Event {
    handle: OwnedHandle<EventKind>,
    manual_reset: bool,
}

impl Event {
    pub(crate) fn create(
        os: &Arc<dyn Os>,
        manual_reset: bool,
        initial_state: bool,
        name: Option<&str>,
    ) -> Result<Event> {
        let created = os.create_event(manual_reset, initial_state, name);
        if created.value.is_invalid() {
            return Err(Error::Event {
                code: created.last_error,
            });
        }
        if created.last_error == ErrorCode::ALREADY_EXISTS {
            debug!("opened existing event {:?}", name);
        }
        trace!("created event {:?}", created.value);
        Ok(Event {
            handle: OwnedHandle::new(os.clone(), created.value),
            manual_reset,
        })
    }

    /// Whether the event stays signaled until reset.
    pub fn is_manual_reset(&self) -> bool {
        self.manual_reset
    }

    /// Blocks until signaled or until `timeout` elapses.
    ///
    /// Closing the event from another thread ends the wait with
    /// [`WaitOutcome::Failed`].
    pub fn wait<T: Into<Timeout>>(&self, timeout: T) -> WaitOutcome {
        let millis = timeout.into().as_millis();
        let ret = self
            .handle
            .call_unlocked(u32::max_value(), |os, raw| {
                os.wait_for_single_object(raw, millis)
            });
        WaitOutcome::from_raw(ret.value, ret.last_error)
    }

    /// Signals the event.
    pub fn set(&self) -> Result<()> {
        self.handle
            .call(false, |os, raw| os.set_event(raw))
            .ok()
            .map_err(|code| Error::Event { code })
    }

    /// Returns the event to the unsignaled state.
    pub fn reset(&self) -> Result<()> {
        self.handle
            .call(false, |os, raw| os.reset_event(raw))
            .ok()
            .map_err(|code| Error::Event { code })
    }

    /// Releases the event. Closing twice fails with `ERROR_INVALID_HANDLE`.
    pub fn close(&self) -> Result<()> {
        self.handle.close().ok().map_err(|code| Error::Close { code })
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// The value stored into an overlapped block.
    pub(crate) fn raw(&self) -> RawHandle {
        self.handle.with(RawHandle::NULL, |_, raw| raw)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("handle", &self.handle)
            .field("manual_reset", &self.manual_reset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::sim::Sim;

    fn os() -> Arc<dyn Os> {
        Arc::new(Sim::new())
    }

    #[test]
    fn timeouts() {
        assert_eq!(Timeout::Infinite.as_millis(), INFINITE);
        assert_eq!(Timeout::Millis(INFINITE).as_millis(), INFINITE - 1);
        assert_eq!(Timeout::from(Duration::from_millis(250)), Timeout::Millis(250));
        assert_eq!(Timeout::from(None::<Duration>), Timeout::Infinite);
    }

    #[test]
    fn poll_of_unsignaled_event_times_out() {
        let ev = Event::create(&os(), true, false, None).unwrap();
        assert_eq!(ev.wait(Timeout::POLL), WaitOutcome::Timeout);
    }

    #[test]
    fn auto_reset_signals_once() {
        let ev = Event::create(&os(), false, false, None).unwrap();
        ev.set().unwrap();
        assert_eq!(ev.wait(Timeout::POLL), WaitOutcome::Signaled);
        assert_eq!(ev.wait(Timeout::POLL), WaitOutcome::Timeout);
    }

    #[test]
    fn manual_reset_stays_signaled() {
        let ev = Event::create(&os(), true, true, None).unwrap();
        assert_eq!(ev.wait(Timeout::POLL), WaitOutcome::Signaled);
        assert_eq!(ev.wait(Timeout::POLL), WaitOutcome::Signaled);
        ev.reset().unwrap();
        assert_eq!(ev.wait(Timeout::POLL), WaitOutcome::Timeout);
    }

    #[test]
    fn closed_event() {
        let ev = Event::create(&os(), true, false, None).unwrap();
        ev.close().unwrap();
        match ev.close() {
            Err(Error::Close { code }) => assert_eq!(code, ErrorCode::INVALID_HANDLE),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            ev.wait(Timeout::Infinite),
            WaitOutcome::Failed(ErrorCode::INVALID_HANDLE)
        );
        assert!(ev.set().is_err());
    }

    #[test]
    fn close_ends_a_blocked_wait() {
        use std::sync::mpsc;
        use std::thread;

        let ev = Arc::new(Event::create(&os(), false, false, None).unwrap());
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let ev = ev.clone();
            thread::spawn(move || tx.send(ev.wait(Timeout::Infinite)).unwrap())
        };
        thread::sleep(Duration::from_millis(50));

        ev.close().unwrap();
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, WaitOutcome::Failed(ErrorCode::INVALID_HANDLE));
        waiter.join().unwrap();
        match ev.set() {
            Err(Error::Event { code }) => assert_eq!(code, ErrorCode::INVALID_HANDLE),
            other => panic!("unexpected {:?}", other),
        }
    }
}

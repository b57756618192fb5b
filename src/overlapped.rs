//! In-flight asynchronous operations.
//!
//! An [`OverlappedRequest`] owns everything the OS may touch while an
//! operation is pending: the native overlapped block, the transfer buffer and
//! the event mask slot. All of them live on the heap, so the request itself
//! may move freely. Dropping a pending request cancels the operation and waits
//! until the OS has let go of that memory.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::ptr;
use std::sync::Arc;

use crate::buffer::NativeBuffer;
use crate::error::{Error, ErrorCode, Result};
use crate::event::{Event, Timeout, WaitOutcome};
use crate::handle::{DeviceKind, OwnedHandle};
use crate::kernel::Kernel;
use crate::sys::{Captured, RawOverlapped, RawTransfer, STATUS_PENDING};

/// Outcome of submitting or completing a transfer.
///
/// `last_error` is always the code captured with the call that produced the
/// result, also when it succeeded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransferResult {
    /// The call reported success
    pub success: bool,
    /// Bytes transferred; only meaningful once the operation completed
    pub bytes_transferred: u32,
    /// Code captured with the call
    pub last_error: ErrorCode,
}

/// Where a transfer stands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Completed with this many bytes.
    Done(u32),
    /// Still in flight.
    Pending,
}

impl TransferResult {
    pub(crate) fn failed(code: ErrorCode) -> TransferResult {
        TransferResult {
            success: false,
            bytes_transferred: 0,
            last_error: code,
        }
    }

    /// The operation has not completed yet.
    ///
    /// Results of this crate report `ERROR_IO_PENDING`; the raw
    /// `ERROR_IO_INCOMPLETE` of a native poll counts as pending too.
    pub fn is_pending(&self) -> bool {
        !self.success && self.last_error.is_pending()
    }

    /// Maps a failure to [`Error::Transfer`].
    pub fn into_result(self) -> Result<Progress> {
        if self.success {
            Ok(Progress::Done(self.bytes_transferred))
        } else if self.is_pending() {
            Ok(Progress::Pending)
        } else {
            Err(Error::Transfer {
                code: self.last_error,
            })
        }
    }
}

impl From<Captured<RawTransfer>> for TransferResult {
    fn from(c: Captured<RawTransfer>) -> TransferResult {
        TransferResult {
            success: c.value.ok,
            bytes_transferred: c.value.bytes,
            last_error: c.last_error,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Op {
    Read,
    Write,
    CommEvent,
}

enum Signal<'e> {
    Owned(Event),
    Borrowed(&'e Event),
}

enum State {
    Idle,
    Pending {
        device: Arc<OwnedHandle<DeviceKind>>,
        op: Op,
    },
    Complete {
        op: Op,
        result: TransferResult,
    },
}

/// One asynchronous operation and the memory the OS uses for it.
///
/// A request can be reused once its operation completed. Submitting with a
/// request that is still pending is a contract violation and panics.
pub struct OverlappedRequest<'e> {
    block: Box<UnsafeCell<RawOverlapped>>,
    mask: Box<UnsafeCell<u32>>,
    signal: Signal<'e>,
    buffer: Option<NativeBuffer>,
    state: State,
}

impl OverlappedRequest<'static> {
    /// A request signaling its own manual-reset event.
    pub fn new(kernel: &Kernel) -> Result<OverlappedRequest<'static>> {
        let event = kernel.create_event(true, false, None)?;
        Ok(OverlappedRequest::with_event(event))
    }

    /// A request that owns `event` and signals it on completion.
    pub fn with_event(event: Event) -> OverlappedRequest<'static> {
        OverlappedRequest::from_signal(Signal::Owned(event))
    }
}

impl<'e> OverlappedRequest<'e> {
    /// A request signaling an event owned elsewhere.
    pub fn borrowing(event: &'e Event) -> OverlappedRequest<'e> {
        OverlappedRequest::from_signal(Signal::Borrowed(event))
    }

    fn from_signal(signal: Signal<'e>) -> OverlappedRequest<'e> {
        OverlappedRequest {
            block: Box::new(UnsafeCell::new(RawOverlapped::default())),
            mask: Box::new(UnsafeCell::new(0)),
            signal,
            buffer: None,
            state: State::Idle,
        }
    }

    /// The completion event.
    pub fn event(&self) -> &Event {
        match self.signal {
            Signal::Owned(ref event) => event,
            Signal::Borrowed(event) => event,
        }
    }

    /// An operation was submitted and has not been observed complete.
    pub fn is_pending(&self) -> bool {
        match self.state {
            State::Pending { .. } => true,
            _ => false,
        }
    }

    /// The final result, once completion was observed.
    pub fn result(&self) -> Option<TransferResult> {
        match self.state {
            State::Complete { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Bytes transferred by the completed operation, zero before that.
    pub fn bytes_transferred(&self) -> u32 {
        self.result().map_or(0, |r| r.bytes_transferred)
    }

    /// The buffer of the last read or write, unless still in use by the OS.
    pub fn buffer(&self) -> Option<&NativeBuffer> {
        if self.is_pending() {
            None
        } else {
            self.buffer.as_ref()
        }
    }

    /// Takes back the buffer of the last read or write. Returns `None` while
    /// the operation is pending.
    pub fn take_buffer(&mut self) -> Option<NativeBuffer> {
        if self.is_pending() {
            None
        } else {
            self.buffer.take()
        }
    }

    /// Events reported by a completed comm-event wait.
    pub fn event_mask(&self) -> Option<u32> {
        match self.state {
            State::Complete {
                op: Op::CommEvent,
                result,
            } if result.success => Some(unsafe { *self.mask.get() }),
            _ => None,
        }
    }

    /// Resets the request for a new submission and returns the block.
    pub(crate) fn begin(&mut self, buffer: Option<NativeBuffer>) -> *mut RawOverlapped {
        assert!(
            !self.is_pending(),
            "overlapped request reused while an operation is pending"
        );
        let event = self.event().raw().as_raw();
        unsafe {
            *self.block.get() = RawOverlapped {
                event,
                ..RawOverlapped::default()
            };
            *self.mask.get() = 0;
        }
        self.buffer = buffer;
        self.state = State::Idle;
        self.block.get()
    }

    pub(crate) fn block_ptr(&self) -> *mut RawOverlapped {
        self.block.get()
    }

    pub(crate) fn mask_ptr(&self) -> *mut u32 {
        self.mask.get()
    }

    pub(crate) fn pending_on(&mut self, device: Arc<OwnedHandle<DeviceKind>>, op: Op) {
        self.state = State::Pending { device, op };
    }

    pub(crate) fn pending_op(&self, device: &Arc<OwnedHandle<DeviceKind>>) -> Option<Op> {
        match self.state {
            State::Pending {
                device: ref owner,
                op,
            } => {
                assert!(
                    Arc::ptr_eq(owner, device),
                    "overlapped request is pending on another device"
                );
                Some(op)
            }
            _ => None,
        }
    }

    pub(crate) fn complete(&mut self, op: Op, result: TransferResult) {
        if op == Op::Read {
            if let Some(buffer) = self.buffer.as_mut() {
                let n = (result.bytes_transferred as usize).min(buffer.capacity());
                buffer.set_len(n);
            }
        }
        trace!("{:?} completed: {:?}", op, result);
        self.state = State::Complete { op, result };
    }

    /// Status the OS left in the block.
    pub(crate) fn status(&self) -> usize {
        unsafe { ptr::read_volatile(&(*self.block.get()).internal) }
    }

    /// Count the OS left in the block.
    pub(crate) fn block_bytes(&self) -> u32 {
        unsafe { ptr::read_volatile(&(*self.block.get()).internal_high) as u32 }
    }

    /// Gives up ownership of the memory the OS may still write to.
    fn leak(&mut self) {
        let block = mem::replace(
            &mut self.block,
            Box::new(UnsafeCell::new(RawOverlapped::default())),
        );
        let mask = mem::replace(&mut self.mask, Box::new(UnsafeCell::new(0)));
        mem::forget(block);
        mem::forget(mask);
        if let Some(buffer) = self.buffer.take() {
            mem::forget(buffer);
        }
    }
}

impl<'e> Drop for OverlappedRequest<'e> {
    fn drop(&mut self) {
        let device = match self.state {
            State::Pending { ref device, op } => {
                warn!("dropping pending {:?} request, cancelling it", op);
                device.clone()
            }
            _ => return,
        };
        let ov = self.block_ptr();
        let cancelled = device.call(false, |os, raw| unsafe { os.cancel_io(raw, ov) });
        if !cancelled.value && cancelled.last_error != ErrorCode::NOT_FOUND {
            debug!("cancel of dropped request failed: {}", cancelled.last_error);
        }

        // The memory stays ours until the OS reports completion. A finished
        // block needs no wait; its event may have been consumed or reset.
        if self.status() == STATUS_PENDING {
            let signaled = self.event().wait(Timeout::Infinite) == WaitOutcome::Signaled;
            if !signaled || self.status() == STATUS_PENDING {
                device.call_unlocked(RawTransfer::default(), |os, raw| unsafe {
                    os.get_overlapped_result(raw, ov, true)
                });
            }
        }
        if self.status() == STATUS_PENDING {
            error!("overlapped request still owned by the OS, leaking its memory");
            self.leak();
        }
    }
}

impl<'e> fmt::Debug for OverlappedRequest<'e> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self.state {
            State::Idle => "idle",
            State::Pending { .. } => "pending",
            State::Complete { .. } => "complete",
        };
        f.debug_struct("OverlappedRequest")
            .field("event", self.event())
            .field("state", &state)
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::sim::Sim;

    #[test]
    fn pending_codes_count_as_pending() {
        let r = TransferResult::failed(ErrorCode::IO_INCOMPLETE);
        assert!(r.is_pending());
        assert_eq!(r.into_result().unwrap(), Progress::Pending);

        let r = TransferResult::failed(ErrorCode::OPERATION_ABORTED);
        assert!(!r.is_pending());
        match r.into_result() {
            Err(Error::Transfer { code }) => assert_eq!(code, ErrorCode::OPERATION_ABORTED),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn fresh_request_is_idle() {
        let kernel = Kernel::from(Sim::new());
        let req = OverlappedRequest::new(&kernel).unwrap();
        assert!(!req.is_pending());
        assert_eq!(req.result(), None);
        assert_eq!(req.bytes_transferred(), 0);
        assert_eq!(req.event_mask(), None);
    }

    #[test]
    fn begin_resets_the_block() {
        let kernel = Kernel::from(Sim::new());
        let event = kernel.create_event(true, false, None).unwrap();
        let mut req = OverlappedRequest::borrowing(&event);
        let ov = req.begin(Some(NativeBuffer::new(4)));
        let block = unsafe { *ov };
        assert_eq!(block.offset, 0);
        assert_eq!(block.offset_high, 0);
        assert_eq!(block.event, event.raw().as_raw());
        assert_eq!(req.buffer().map(NativeBuffer::capacity), Some(4));
    }
}

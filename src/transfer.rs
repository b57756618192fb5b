//! Reads, writes and their completion.
//!
//! On an overlapped device a submission usually returns right away with
//! `ERROR_IO_PENDING`; the request then stays pending until
//! [`Device::wait_for_completion`] observes the final status. On a
//! synchronous device every submission blocks and completes in place.

use std::ptr;

use crate::buffer::NativeBuffer;
use crate::device::Device;
use crate::error::{Error, ErrorCode, Result};
use crate::event::{Timeout, WaitOutcome};
use crate::overlapped::{Op, OverlappedRequest, TransferResult};
use crate::sys::{Captured, Os, RawHandle, RawOverlapped, RawTransfer, STATUS_PENDING};

fn transfer_len(len: usize) -> u32 {
    assert!(
        len <= u32::max_value() as usize,
        "transfer of {} bytes is too large",
        len
    );
    len as u32
}

impl Device {
    fn block_for(&self, ov: *mut RawOverlapped) -> *mut RawOverlapped {
        if self.is_overlapped() {
            ov
        } else {
            ptr::null_mut()
        }
    }

    /// Issues a submission. Synchronous transfers block, so they run without
    /// keeping a concurrent [`close`](Device::close) out.
    fn submit<F>(&self, f: F) -> Captured<RawTransfer>
    where
        F: FnOnce(&dyn Os, RawHandle) -> Captured<RawTransfer>,
    {
        if self.is_overlapped() {
            self.handle.call(RawTransfer::default(), f)
        } else {
            self.handle.call_unlocked(RawTransfer::default(), f)
        }
    }

    fn submitted(
        &self,
        request: &mut OverlappedRequest,
        op: Op,
        captured: Captured<RawTransfer>,
    ) -> TransferResult {
        let result = TransferResult::from(captured);
        if self.is_overlapped() && result.is_pending() {
            trace!("{}: {:?} pending", self.path(), op);
            request.pending_on(self.handle.clone(), op);
        } else {
            request.complete(op, result);
        }
        result
    }

    /// Writes the meaningful bytes of `buffer`.
    ///
    /// The request owns the buffer until the write completed; get it back
    /// with [`OverlappedRequest::take_buffer`].
    ///
    /// # Panics
    ///
    /// If `request` is still pending.
    pub fn write(&self, request: &mut OverlappedRequest, buffer: NativeBuffer) -> TransferResult {
        let len = transfer_len(buffer.len());
        let data = buffer.as_ptr();
        let ov = self.block_for(request.begin(Some(buffer)));
        trace!("{}: write {} bytes", self.path(), len);
        let captured = self.submit(|os, raw| unsafe { os.write_file(raw, data, len, ov) });
        self.submitted(request, Op::Write, captured)
    }

    /// Reads up to `max_len` bytes into `buffer`.
    ///
    /// Once completed, the buffer's length is the number of bytes read.
    ///
    /// # Panics
    ///
    /// If `max_len` exceeds the buffer's capacity or `request` is still
    /// pending.
    pub fn read(
        &self,
        request: &mut OverlappedRequest,
        mut buffer: NativeBuffer,
        max_len: usize,
    ) -> TransferResult {
        assert!(
            max_len <= buffer.capacity(),
            "read of {} bytes into a buffer of {}",
            max_len,
            buffer.capacity()
        );
        let len = transfer_len(max_len);
        buffer.set_len(0);
        let data = buffer.as_mut_ptr();
        let ov = self.block_for(request.begin(Some(buffer)));
        trace!("{}: read up to {} bytes", self.path(), len);
        let captured = self.submit(|os, raw| unsafe { os.read_file(raw, data, len, ov) });
        self.submitted(request, Op::Read, captured)
    }

    /// Waits for one of the events selected with
    /// [`set_comm_mask`](Device::set_comm_mask). The events that occurred are
    /// reported by [`OverlappedRequest::event_mask`] after completion.
    pub fn wait_comm_event(&self, request: &mut OverlappedRequest) -> TransferResult {
        let ov = self.block_for(request.begin(None));
        let mask = request.mask_ptr();
        let captured = self
            .handle
            .call(false, |os, raw| unsafe { os.wait_comm_event(raw, mask, ov) })
            .map(|ok| RawTransfer { ok, bytes: 0 });
        self.submitted(request, Op::CommEvent, captured)
    }

    /// Observes the completion of the operation submitted with `request`.
    ///
    /// A blocking call suspends until the operation completed or the event
    /// was signaled; an operation the OS already finished is picked up
    /// without waiting, whatever state the event is in. A non-blocking call
    /// never suspends. A still pending operation is reported with
    /// `ERROR_IO_PENDING` either way. Once completed, the same result is
    /// returned on every later call.
    ///
    /// The device is not locked while blocking, so another thread can close
    /// it to abort the operation. The result then carries the count the OS
    /// reported and `ERROR_INVALID_HANDLE`.
    ///
    /// # Panics
    ///
    /// If `request` is pending on another device.
    pub fn wait_for_completion(
        &self,
        request: &mut OverlappedRequest,
        blocking: bool,
    ) -> TransferResult {
        if let Some(result) = request.result() {
            return result;
        }
        let op = match request.pending_op(&self.handle) {
            Some(op) => op,
            None => return TransferResult::failed(ErrorCode::INVALID_PARAMETER),
        };

        if blocking && request.status() == STATUS_PENDING {
            if let WaitOutcome::Failed(code) = request.event().wait(Timeout::Infinite) {
                return TransferResult::failed(code);
            }
        }

        let ov = request.block_ptr();
        let polled = self.handle.with(None, |os, raw| {
            Some(unsafe { os.get_overlapped_result(raw, ov, false) })
        });
        let mut result = match polled {
            Some(captured) => TransferResult::from(captured),
            None if request.status() == STATUS_PENDING => {
                TransferResult::failed(ErrorCode::IO_PENDING)
            }
            None => TransferResult {
                success: false,
                bytes_transferred: request.block_bytes(),
                last_error: ErrorCode::INVALID_HANDLE,
            },
        };
        if result.is_pending() {
            result.last_error = ErrorCode::IO_PENDING;
        } else {
            request.complete(op, result);
        }
        result
    }

    /// Asks the OS to abort the operation of `request`.
    ///
    /// The request stays pending until its completion, now reporting
    /// `ERROR_OPERATION_ABORTED` unless it finished first, is observed.
    pub fn cancel(&self, request: &OverlappedRequest) -> Result<()> {
        let ov = request.block_ptr();
        self.handle
            .call(false, |os, raw| unsafe { os.cancel_io(raw, ov) })
            .ok()
            .map_err(|code| Error::Transfer { code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::sys::sim::{Completion, Sim};
    use crate::sys::{FILE_FLAG_OVERLAPPED, GENERIC_READ, GENERIC_WRITE, OPEN_EXISTING};

    fn setup(flags: u32) -> (crate::sys::sim::SimDevice, Kernel, Device) {
        let sim = Sim::new();
        let port = sim.add_device("COM1");
        let kernel = Kernel::from(sim);
        let dev = kernel
            .open(
                "COM1",
                GENERIC_READ | GENERIC_WRITE,
                0,
                OPEN_EXISTING,
                flags,
            )
            .unwrap();
        (port, kernel, dev)
    }

    #[test]
    fn synchronous_write_completes_in_place() {
        let (port, kernel, dev) = setup(0);
        let mut req = OverlappedRequest::new(&kernel).unwrap();
        let r = dev.write(&mut req, NativeBuffer::from_slice(b"12345"));
        assert!(r.success);
        assert_eq!(r.bytes_transferred, 5);
        assert!(!req.is_pending());
        assert_eq!(port.take_written(), b"12345");
    }

    #[test]
    fn overlapped_write_pends_until_waited() {
        let (port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
        let mut req = OverlappedRequest::new(&kernel).unwrap();

        let r = dev.write(&mut req, NativeBuffer::from_slice(b"abc"));
        assert!(!r.success);
        assert_eq!(r.last_error, ErrorCode::IO_PENDING);
        assert!(req.is_pending());
        assert!(req.take_buffer().is_none());

        let r = dev.wait_for_completion(&mut req, true);
        assert!(r.success);
        assert_eq!(r.bytes_transferred, 3);
        assert_eq!(port.take_written(), b"abc");
        assert_eq!(req.take_buffer().unwrap().as_slice(), b"abc");
    }

    #[test]
    fn poll_does_not_complete() {
        let (port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
        port.set_completion(Completion::Manual);
        let mut req = OverlappedRequest::new(&kernel).unwrap();
        dev.write(&mut req, NativeBuffer::from_slice(b"x"));

        let r = dev.wait_for_completion(&mut req, false);
        assert!(r.is_pending());
        assert_eq!(r.last_error, ErrorCode::IO_PENDING);

        assert_eq!(port.complete_pending(), 1);
        let r = dev.wait_for_completion(&mut req, false);
        assert!(r.success);
        assert_eq!(r.bytes_transferred, 1);
        assert_eq!(dev.wait_for_completion(&mut req, true), r);
    }

    #[test]
    fn read_sets_buffer_length() {
        let (port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
        port.inject(b"hi");
        let mut req = OverlappedRequest::new(&kernel).unwrap();
        dev.read(&mut req, NativeBuffer::new(16), 16);
        let r = dev.wait_for_completion(&mut req, true);
        assert_eq!(r.bytes_transferred, 2);
        assert_eq!(req.buffer().unwrap().as_slice(), b"hi");
    }

    #[test]
    #[should_panic]
    fn read_longer_than_capacity_panics() {
        let (_port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
        let mut req = OverlappedRequest::new(&kernel).unwrap();
        dev.read(&mut req, NativeBuffer::new(4), 5);
    }

    #[test]
    fn cancel_aborts() {
        let (port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
        port.set_completion(Completion::Manual);
        let mut req = OverlappedRequest::new(&kernel).unwrap();
        dev.read(&mut req, NativeBuffer::new(8), 8);
        dev.cancel(&req).unwrap();
        let r = dev.wait_for_completion(&mut req, true);
        assert!(!r.success);
        assert_eq!(r.last_error, ErrorCode::OPERATION_ABORTED);

        match dev.cancel(&req) {
            Err(Error::Transfer { code }) => assert_eq!(code, ErrorCode::NOT_FOUND),
            other => panic!("unexpected {:?}", other),
        }
    }
}

//! A blocking serial port built on the overlapped core.

use std::cmp;
use std::fmt;
use std::io;
use std::sync::Arc;

use crate::buffer::NativeBuffer;
use crate::device::Device;
use crate::error::{Error, ErrorCode, Result};
use crate::event::{Timeout, WaitOutcome};
use crate::kernel::Kernel;
use crate::overlapped::{OverlappedRequest, TransferResult};
use crate::settings::{PortConfig, PortSettings, Timeouts};
use crate::sys::{EV_RXCHAR, FILE_FLAG_OVERLAPPED, GENERIC_READ, GENERIC_WRITE, OPEN_EXISTING};

/// An exclusively opened serial port.
///
/// Reads block until data arrives; writes fail if they take longer than the
/// write timeout. Closing the port through [`device`](SerialPort::device)
/// from another thread makes blocked calls fail with [`Error::PortClosed`].
pub struct SerialPort {
    device: Arc<Device>,
    name: String,
    settings: PortSettings,
    timeouts: Timeouts,
    read_request: OverlappedRequest<'static>,
    write_request: OverlappedRequest<'static>,
    input: Vec<u8>,
}

impl SerialPort {
    /// Opens port `name`, e.g. `COM3`, and applies `settings`.
    ///
    /// Fails with [`Error::PortInUse`] if someone else holds the port and
    /// with [`Error::PortNotFound`] if it does not exist. The port is closed
    /// again if the settings cannot be applied.
    pub fn open(kernel: &Kernel, name: &str, settings: &PortSettings) -> Result<SerialPort> {
        let path = format!(r"\\.\{}", name);
        let device = match kernel.open(
            &path,
            GENERIC_READ | GENERIC_WRITE,
            0,
            OPEN_EXISTING,
            FILE_FLAG_OVERLAPPED,
        ) {
            Ok(device) => device,
            Err(Error::Open { code, .. }) if code == ErrorCode::ACCESS_DENIED => {
                return Err(Error::PortInUse(name.to_string()))
            }
            Err(Error::Open { code, .. }) if code == ErrorCode::FILE_NOT_FOUND => {
                return Err(Error::PortNotFound(name.to_string()))
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = configure(&device, settings) {
            if let Err(close) = device.close() {
                warn!("closing {} after failed setup: {}", name, close);
            }
            return Err(e);
        }

        let port = SerialPort {
            device: Arc::new(device),
            name: name.to_string(),
            settings: *settings,
            timeouts: Timeouts::default(),
            read_request: OverlappedRequest::new(kernel)?,
            write_request: OverlappedRequest::new(kernel)?,
            input: Vec::new(),
        };
        debug!("opened {} at {} baud", name, settings.baud_rate);
        Ok(port)
    }

    /// Opens the port described by a configuration file entry.
    pub fn open_with(kernel: &Kernel, config: &PortConfig) -> Result<SerialPort> {
        let mut port = SerialPort::open(kernel, &config.port, &config.settings)?;
        port.timeouts = config.timeouts;
        Ok(port)
    }

    /// The port name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The settings the port was opened with.
    pub fn settings(&self) -> &PortSettings {
        &self.settings
    }

    /// Current timeouts.
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Replaces the timeouts.
    pub fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.timeouts = timeouts;
    }

    /// The underlying device, shareable with a thread that may close it.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Closes the port.
    pub fn close(&self) -> Result<()> {
        debug!("closing {}", self.name);
        self.device.close()
    }

    /// Whether the port was closed.
    pub fn is_closed(&self) -> bool {
        self.device.is_closed()
    }

    fn check_open(&self) -> Result<()> {
        if self.device.is_closed() {
            Err(Error::PortClosed(format!("{} is closed", self.name)))
        } else {
            Ok(())
        }
    }

    fn native_error(&self, operation: &str, code: ErrorCode) -> Error {
        if code == ErrorCode::INVALID_HANDLE || code == ErrorCode::OPERATION_ABORTED {
            Error::PortClosed(format!("{} failed, {} was closed", operation, self.name))
        } else {
            Error::Transfer { code }
        }
    }

    /// Writes all of `data`, failing after the write timeout.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if data.is_empty() {
            return Ok(());
        }
        let submitted = self
            .device
            .write(&mut self.write_request, NativeBuffer::from_slice(data));
        let millis = self.timeouts.write_ms;
        let result = if submitted.is_pending() {
            self.finish(true, "write", millis, "WriteFile")?
        } else {
            submitted
        };
        if !result.success {
            return Err(self.native_error("WriteFile", result.last_error));
        }
        if result.bytes_transferred as usize != data.len() {
            return Err(Error::ShortTransfer {
                expected: data.len() as u32,
                actual: result.bytes_transferred,
            });
        }
        trace!("{}: wrote {} bytes", self.name, data.len());
        Ok(())
    }

    /// Waits for a pending request to finish within `millis`, cancelling it
    /// on timeout.
    fn finish(
        &mut self,
        write: bool,
        operation: &'static str,
        millis: u32,
        call: &str,
    ) -> Result<TransferResult> {
        let device = self.device.clone();
        let request = if write {
            &mut self.write_request
        } else {
            &mut self.read_request
        };
        match request.event().wait(Timeout::Millis(millis)) {
            WaitOutcome::Signaled => {
                let result = device.wait_for_completion(request, false);
                if result.is_pending() {
                    debug!("{} signaled before it completed", operation);
                    return Ok(settle(&device, request));
                }
                Ok(result)
            }
            WaitOutcome::Timeout => {
                settle(&device, request);
                Err(Error::Timeout { operation, millis })
            }
            WaitOutcome::Abandoned => {
                settle(&device, request);
                Err(Error::Wait(WaitOutcome::Abandoned))
            }
            WaitOutcome::Failed(code) => {
                settle(&device, request);
                Err(self.native_error(call, code))
            }
        }
    }

    /// Blocks until data arrives and returns everything queued.
    pub fn read_available(&mut self) -> Result<Vec<u8>> {
        self.check_open()?;
        loop {
            self.await_data()?;
            let status = self
                .device
                .clear_comm_error()
                .map_err(|e| match e.code() {
                    Some(code) => self.native_error("ClearCommError", code),
                    None => e,
                })?;
            if status.in_queue == 0 {
                continue;
            }
            return self.read_queued(status.in_queue as usize);
        }
    }

    fn await_data(&mut self) -> Result<()> {
        let submitted = self.device.wait_comm_event(&mut self.read_request);
        let result = if submitted.is_pending() {
            loop {
                match self
                    .read_request
                    .event()
                    .wait(Timeout::Millis(self.timeouts.read_ms))
                {
                    WaitOutcome::Signaled => {
                        break self
                            .device
                            .wait_for_completion(&mut self.read_request, false)
                    }
                    WaitOutcome::Timeout => continue,
                    WaitOutcome::Abandoned => return Err(Error::Wait(WaitOutcome::Abandoned)),
                    WaitOutcome::Failed(code) => {
                        return Err(self.native_error("WaitForSingleObject", code))
                    }
                }
            }
        } else {
            submitted
        };
        if !result.success {
            return Err(self.native_error("WaitCommEvent", result.last_error));
        }
        // Some drivers signal events that were not asked for; only an empty
        // mask means failure.
        match self.read_request.event_mask() {
            Some(mask) if mask != 0 => {
                if mask & EV_RXCHAR == 0 {
                    trace!("{}: ignoring comm event mask {:#x}", self.name, mask);
                }
                Ok(())
            }
            _ => Err(Error::PortClosed(format!(
                "a communication error was signaled on {}",
                self.name
            ))),
        }
    }

    fn read_queued(&mut self, available: usize) -> Result<Vec<u8>> {
        let submitted = self.device.read(
            &mut self.read_request,
            NativeBuffer::new(available),
            available,
        );
        let millis = self.timeouts.read_ms;
        let result = if submitted.is_pending() {
            self.finish(false, "read", millis, "ReadFile")?
        } else {
            submitted
        };
        if !result.success {
            return Err(self.native_error("ReadFile", result.last_error));
        }
        if result.bytes_transferred as usize != available {
            return Err(Error::ShortTransfer {
                expected: available as u32,
                actual: result.bytes_transferred,
            });
        }
        let data = self
            .read_request
            .take_buffer()
            .map(|b| b.to_vec())
            .unwrap_or_default();
        trace!("{}: read {} bytes", self.name, data.len());
        Ok(data)
    }
}

/// Cancels the operation of `request` and waits until the OS handed it
/// back, leaving the request ready for reuse.
fn settle(device: &Device, request: &mut OverlappedRequest) -> TransferResult {
    if let Err(e) = device.cancel(request) {
        debug!("cancel of {}: {}", device.path(), e);
    }
    loop {
        // Reset first so a completion from here on signals again.
        if let Err(e) = request.event().reset() {
            debug!("reset of completion event: {}", e);
        }
        let result = device.wait_for_completion(request, true);
        if !result.is_pending() {
            return result;
        }
    }
}

fn configure(device: &Device, settings: &PortSettings) -> Result<()> {
    let mut config = device.read_config()?;
    settings.apply(&mut config)?;
    device.write_config(&config)?;
    device.set_comm_mask(EV_RXCHAR)
}

impl io::Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.input.is_empty() {
            self.input = self.read_available()?;
        }
        let n = cmp::min(buf.len(), self.input.len());
        buf[..n].copy_from_slice(&self.input[..n]);
        self.input.drain(..n);
        Ok(n)
    }
}

impl io::Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for SerialPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SerialPort")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("settings", &self.settings)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

//! Device handles.

use std::fmt;
use std::sync::Arc;

use crate::config::LineConfig;
use crate::error::{Error, Result};
use crate::handle::{DeviceKind, OwnedHandle};
use crate::sys::{CommStatus, NativeDcb, Os, FILE_FLAG_OVERLAPPED};

/// An open device such as a serial port.
///
/// The descriptor has exactly one owner and is closed on drop. [`close`]
/// works through a shared reference so another thread can close the device
/// to abort transfers blocked on it. After closing, every operation fails
/// with `ERROR_INVALID_HANDLE` without reaching the OS.
///
/// [`close`]: Device::close
pub struct Device {
    pub(crate) handle: Arc<OwnedHandle<DeviceKind>>,
    path: String,
    overlapped: bool,
}

impl Device {
    pub(crate) fn open(
        os: &Arc<dyn Os>,
        path: &str,
        access: u32,
        share_mode: u32,
        disposition: u32,
        flags: u32,
    ) -> Result<Device> {
        let opened = os.create_file(path, access, share_mode, disposition, flags);
        if opened.value.is_invalid() {
            debug!("open {} failed: {}", path, opened.last_error);
            return Err(Error::Open {
                path: path.to_string(),
                code: opened.last_error,
            });
        }
        let overlapped = flags & FILE_FLAG_OVERLAPPED != 0;
        debug!(
            "opened {} as {:?} (overlapped: {})",
            path, opened.value, overlapped
        );
        Ok(Device {
            handle: Arc::new(OwnedHandle::new(os.clone(), opened.value)),
            path: path.to_string(),
            overlapped,
        })
    }

    /// The path the device was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether transfers on this device are overlapped.
    pub fn is_overlapped(&self) -> bool {
        self.overlapped
    }

    /// Closes the device, aborting its pending transfers.
    ///
    /// Closing twice fails with `ERROR_INVALID_HANDLE`.
    pub fn close(&self) -> Result<()> {
        self.handle
            .close()
            .ok()
            .map_err(|code| Error::Close { code })
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Reads the current line configuration.
    pub fn read_config(&self) -> Result<LineConfig> {
        let mut dcb = NativeDcb::sized();
        self.handle
            .call(false, |os, raw| os.get_comm_state(raw, &mut dcb))
            .ok()
            .map_err(|code| Error::Config { code })?;
        LineConfig::decode(&dcb)
    }

    /// Applies a line configuration in one OS call.
    ///
    /// The configuration is validated before the OS is involved.
    pub fn write_config(&self, config: &LineConfig) -> Result<()> {
        let dcb = config.encode()?;
        self.handle
            .call(false, |os, raw| os.set_comm_state(raw, &dcb))
            .ok()
            .map_err(|code| Error::Config { code })?;
        debug!(
            "{}: {} baud, {} data bits, {:?}, {:?}",
            self.path, config.baud_rate, config.byte_size, config.parity, config.stop_bits
        );
        Ok(())
    }

    /// Selects the communication events reported by
    /// [`wait_comm_event`](Self::wait_comm_event).
    pub fn set_comm_mask(&self, mask: u32) -> Result<()> {
        self.handle
            .call(false, |os, raw| os.set_comm_mask(raw, mask))
            .ok()
            .map_err(|code| Error::Comm { code })
    }

    /// Clears the device's error state and reports its queues.
    pub fn clear_comm_error(&self) -> Result<CommStatus> {
        let status = self
            .handle
            .call(None, |os, raw| os.clear_comm_error(raw));
        status.value.ok_or(Error::Comm {
            code: status.last_error,
        })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("handle", &*self.handle)
            .field("overlapped", &self.overlapped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::kernel::Kernel;
    use crate::sys::sim::Sim;
    use crate::sys::{GENERIC_READ, GENERIC_WRITE, OPEN_EXISTING};

    fn open(kernel: &Kernel, path: &str) -> Result<Device> {
        kernel.open(
            path,
            GENERIC_READ | GENERIC_WRITE,
            0,
            OPEN_EXISTING,
            FILE_FLAG_OVERLAPPED,
        )
    }

    #[test]
    fn open_reports_mode_and_path() {
        let sim = Sim::new();
        sim.add_device("COM1");
        let kernel = Kernel::from(sim);
        let dev = open(&kernel, r"\\.\COM1").unwrap();
        assert!(dev.is_overlapped());
        assert_eq!(dev.path(), r"\\.\COM1");
    }

    #[test]
    fn config_calls_fail_after_close() {
        let sim = Sim::new();
        sim.add_device("COM1");
        let kernel = Kernel::from(sim);
        let dev = open(&kernel, "COM1").unwrap();
        dev.close().unwrap();

        match dev.read_config() {
            Err(Error::Config { code }) => assert_eq!(code, ErrorCode::INVALID_HANDLE),
            other => panic!("unexpected {:?}", other),
        }
        match dev.set_comm_mask(1) {
            Err(Error::Comm { code }) => assert_eq!(code, ErrorCode::INVALID_HANDLE),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn invalid_config_never_reaches_the_device() {
        let sim = Sim::new();
        let port = sim.add_device("COM1");
        let kernel = Kernel::from(sim);
        let dev = open(&kernel, "COM1").unwrap();

        let before = port.config_block();
        let mut config = dev.read_config().unwrap();
        config.byte_size = 3;
        assert!(dev.write_config(&config).is_err());
        assert_eq!(port.config_block(), before);
    }

    #[test]
    fn comm_status_reports_queued_input() {
        let sim = Sim::new();
        let port = sim.add_device("COM1");
        let kernel = Kernel::from(sim);
        let dev = open(&kernel, "COM1").unwrap();
        port.inject(b"hello");
        assert_eq!(dev.clear_comm_error().unwrap().in_queue, 5);
    }
}

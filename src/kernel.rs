//! Entry point binding the typed API to a set of native primitives.

use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{ErrorCode, Result};
use crate::event::Event;
use crate::registry::RegistryKey;
use crate::sys::sim::Sim;
use crate::sys::{Os, RegRoot};

/// Creates devices, events and registry keys on one [`Os`] backend.
///
/// Cloning is cheap; clones share the backend.
#[derive(Clone)]
pub struct Kernel {
    os: Arc<dyn Os>,
}

impl Kernel {
    /// Uses the given primitives.
    pub fn new(os: Arc<dyn Os>) -> Kernel {
        Kernel { os }
    }

    /// The Win32 API of the running system.
    #[cfg(windows)]
    pub fn native() -> Kernel {
        Kernel::new(Arc::new(crate::sys::windows::Win32))
    }

    /// Opens a device.
    ///
    /// Arguments are passed to `CreateFile` unchanged; transfers on the
    /// device are overlapped only if `flags` contains
    /// [`FILE_FLAG_OVERLAPPED`](crate::sys::FILE_FLAG_OVERLAPPED).
    pub fn open(
        &self,
        path: &str,
        access: u32,
        share_mode: u32,
        disposition: u32,
        flags: u32,
    ) -> Result<Device> {
        Device::open(&self.os, path, access, share_mode, disposition, flags)
    }

    /// Creates an event, or opens the existing one carrying `name`.
    pub fn create_event(
        &self,
        manual_reset: bool,
        initial_state: bool,
        name: Option<&str>,
    ) -> Result<Event> {
        Event::create(&self.os, manual_reset, initial_state, name)
    }

    /// Opens a registry key below a predefined root.
    pub fn open_registry_key(&self, root: RegRoot, subkey: &str, access: u32) -> Result<RegistryKey> {
        RegistryKey::open(&self.os, root, subkey, access)
    }

    /// A human readable description of `code`.
    pub fn describe(&self, code: ErrorCode) -> String {
        match self.os.format_message(code) {
            Some(msg) => format!("{} (Error-Code: {})", msg, code.0),
            None => code.to_string(),
        }
    }
}

impl From<Sim> for Kernel {
    fn from(sim: Sim) -> Kernel {
        Kernel::new(Arc::new(sim))
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.pad("Kernel")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_codes() {
        let kernel = Kernel::from(Sim::new());
        assert_eq!(
            kernel.describe(ErrorCode::ACCESS_DENIED),
            "Access is denied. (Error-Code: 5)"
        );
        assert_eq!(kernel.describe(ErrorCode(4242)), "Error-Code: 4242");
    }
}

//! Registry access for port discovery.

use std::fmt;
use std::sync::Arc;

use serialport::{SerialPortInfo, SerialPortType};

use crate::error::{Error, ErrorCode, Result};
use crate::handle::{KeyKind, OwnedHandle};
use crate::kernel::Kernel;
use crate::sys::{Os, RawRegValue, RegRoot, KEY_READ};

/// Key below which the OS lists serial devices.
pub const SERIALCOMM_KEY: &str = r"HARDWARE\DEVICEMAP\SERIALCOMM";

/// Buffer size used for value names and data while discovering ports.
const VALUE_BUFFER_LEN: usize = 255;

/// An open registry key.
pub struct RegistryKey {
    handle: OwnedHandle<KeyKind>,
    path: String,
}

/// One value of a registry key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryValue {
    /// Value name
    pub name: String,
    /// Value type, e.g. [`REG_SZ`](crate::sys::REG_SZ)
    pub kind: u32,
    /// Raw value data, as many bytes as the OS reported
    pub data: Vec<u8>,
}

/// Result of enumerating one index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Enumerated {
    /// The value at that index.
    Item(RegistryValue),
    /// The index is past the last value.
    NoMoreItems,
}

impl RegistryKey {
    pub(crate) fn open(
        os: &Arc<dyn Os>,
        root: RegRoot,
        subkey: &str,
        access: u32,
    ) -> Result<RegistryKey> {
        let opened = os.reg_open_key(root, subkey, access);
        if opened.last_error != ErrorCode::SUCCESS {
            debug!("open of registry key {} failed: {}", subkey, opened.last_error);
            return Err(Error::Registry {
                code: opened.last_error,
            });
        }
        Ok(RegistryKey {
            handle: OwnedHandle::new(os.clone(), opened.value),
            path: subkey.to_string(),
        })
    }

    /// Path below the root the key was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads the value at `index` into buffers of the given sizes.
    ///
    /// The name buffer includes room for the terminating NUL. Values that do
    /// not fit fail with `ERROR_MORE_DATA`.
    pub fn enum_value(&self, index: u32, name_capacity: usize, data_capacity: usize) -> Result<Enumerated> {
        let mut name = vec![0u8; name_capacity];
        let mut data = vec![0u8; data_capacity];
        let r = self.handle.call(RawRegValue::default(), |os, raw| {
            os.reg_enum_value(raw, index, &mut name, &mut data)
        });
        match r.last_error {
            ErrorCode::SUCCESS => {}
            ErrorCode::NO_MORE_ITEMS => return Ok(Enumerated::NoMoreItems),
            code => return Err(Error::Registry { code }),
        }
        name.truncate(r.value.name_len as usize);
        data.truncate(r.value.data_len as usize);
        Ok(Enumerated::Item(RegistryValue {
            name: String::from_utf8_lossy(&name).into_owned(),
            kind: r.value.kind,
            data,
        }))
    }

    /// Iterates over all values with the given buffer sizes.
    pub fn values(&self, name_capacity: usize, data_capacity: usize) -> Values {
        Values {
            key: self,
            index: 0,
            name_capacity,
            data_capacity,
            done: false,
        }
    }

    /// Releases the key. Closing twice fails with `ERROR_INVALID_HANDLE`.
    pub fn close(&self) -> Result<()> {
        self.handle
            .close()
            .ok()
            .map_err(|code| Error::Close { code })
    }
}

impl fmt::Debug for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RegistryKey")
            .field("path", &self.path)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Iterator returned by [`RegistryKey::values`].
pub struct Values<'a> {
    key: &'a RegistryKey,
    index: u32,
    name_capacity: usize,
    data_capacity: usize,
    done: bool,
}

impl<'a> Iterator for Values<'a> {
    type Item = Result<RegistryValue>;

    fn next(&mut self) -> Option<Result<RegistryValue>> {
        if self.done {
            return None;
        }
        let item = self
            .key
            .enum_value(self.index, self.name_capacity, self.data_capacity);
        self.index += 1;
        match item {
            Ok(Enumerated::Item(value)) => Some(Ok(value)),
            Ok(Enumerated::NoMoreItems) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Lists the serial ports the OS currently knows.
///
/// Each value below [`SERIALCOMM_KEY`] names one port in its data; the value
/// name is the device the port belongs to. A missing key means there are no
/// ports.
pub fn find_ports(kernel: &Kernel) -> Result<Vec<SerialPortInfo>> {
    let key = match kernel.open_registry_key(RegRoot::LocalMachine, SERIALCOMM_KEY, KEY_READ) {
        Ok(key) => key,
        Err(Error::Registry { code }) if code == ErrorCode::FILE_NOT_FOUND => {
            return Ok(Vec::new())
        }
        Err(e) => return Err(e),
    };

    let mut ports = Vec::new();
    for value in key.values(VALUE_BUFFER_LEN, VALUE_BUFFER_LEN) {
        let value = value?;
        let data = match value.data.iter().position(|&b| b == 0) {
            Some(end) => &value.data[..end],
            None => &value.data[..],
        };
        let port_name = String::from_utf8_lossy(data).into_owned();
        trace!("found {} ({})", port_name, value.name);
        ports.push(SerialPortInfo {
            port_name,
            port_type: SerialPortType::Unknown,
        });
    }
    debug!("found {} serial ports", ports.len());
    Ok(ports)
}

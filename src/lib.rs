//! # comm-overlapped - Overlapped serial port I/O for Windows
//!
//! This crate is the native I/O core of a serial communication library. It
//! opens device handles, configures line parameters and runs cancellable
//! asynchronous reads and writes, reporting for every OS call the error code
//! captured right after that call returned.
//!
//! The pieces, from the bottom up:
//!
//!   - [`sys::Os`]: the native primitives, implemented by the Win32 API and by
//!     the in-process [`sys::sim::Sim`] kernel used for testing.
//!   - [`Device`], [`Event`] and [`RegistryKey`]: typed, single-owner handles.
//!   - [`LineConfig`]: the line configuration and its `DCB` codec.
//!   - [`OverlappedRequest`] and the transfer methods of [`Device`]: the
//!     overlapped I/O state machine.
//!   - [`SerialPort`]: a blocking port with timeouts on top of it all.
//!
//! ```no_run
//! # fn main() -> comm_overlapped::Result<()> {
//! # #[cfg(windows)] {
//! use comm_overlapped::{Kernel, PortSettings, SerialPort};
//!
//! let kernel = Kernel::native();
//! let mut port = SerialPort::open(&kernel, "COM3", &PortSettings::new(115_200))?;
//! port.write_all(b"AT\r")?;
//! let reply = port.read_available()?;
//! # }
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

#[macro_use]
extern crate log;

pub mod sys;

mod buffer;
mod config;
mod device;
mod error;
mod event;
mod handle;
mod kernel;
mod overlapped;
mod port;
mod registry;
mod settings;
mod transfer;

pub use crate::buffer::NativeBuffer;
pub use crate::config::{
    size_of_config_block, ControlChars, DtrControl, LineConfig, LineFlags, Parity, Reserved,
    RtsControl, StopBits,
};
pub use crate::device::Device;
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::event::{Event, Timeout, WaitOutcome};
pub use crate::kernel::Kernel;
pub use crate::overlapped::{OverlappedRequest, Progress, TransferResult};
pub use crate::port::SerialPort;
pub use crate::registry::{
    find_ports, Enumerated, RegistryKey, RegistryValue, Values, SERIALCOMM_KEY,
};
pub use crate::settings::{DataBits, FlowControl, PortConfig, PortSettings, Timeouts};
pub use crate::sys::{CommStatus, RegRoot};

// Port descriptions are the serialport crate's.
pub use serialport::{SerialPortInfo, SerialPortType};

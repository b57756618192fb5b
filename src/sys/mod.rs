//! Native primitives.
//!
//! Everything the core asks of the operating system goes through the [`Os`]
//! trait. Each method performs exactly one native call and hands back its
//! result fused with the error code read on the same thread immediately after
//! the call returned, so no other call can overwrite the code in between.
//!
//! Two implementations exist: [`windows::Win32`] on Windows and the in-process
//! [`sim::Sim`] kernel that runs everywhere.

use std::fmt;

use crate::error::ErrorCode;

pub mod sim;

#[cfg(windows)]
pub mod windows;

/// `GENERIC_READ` access right.
pub const GENERIC_READ: u32 = 0x8000_0000;
/// `GENERIC_WRITE` access right.
pub const GENERIC_WRITE: u32 = 0x4000_0000;
/// Allow other opens for reading.
pub const FILE_SHARE_READ: u32 = 0x0000_0001;
/// Allow other opens for writing.
pub const FILE_SHARE_WRITE: u32 = 0x0000_0002;
/// Open only if the device exists.
pub const OPEN_EXISTING: u32 = 3;
/// Open, creating if missing.
pub const OPEN_ALWAYS: u32 = 4;
/// Plain attributes.
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;
/// Request overlapped (asynchronous) transfers on the handle.
pub const FILE_FLAG_OVERLAPPED: u32 = 0x4000_0000;

/// Registry read access.
pub const KEY_READ: u32 = 0x0002_0019;
/// Registry value type of NUL terminated strings.
pub const REG_SZ: u32 = 1;

/// The wait object was signaled.
pub const WAIT_OBJECT_0: u32 = 0x0000_0000;
/// The wait object was a mutex abandoned by its owner.
pub const WAIT_ABANDONED: u32 = 0x0000_0080;
/// The timeout elapsed.
pub const WAIT_TIMEOUT: u32 = 0x0000_0102;
/// The wait itself failed.
pub const WAIT_FAILED: u32 = 0xFFFF_FFFF;
/// Wait without a time bound.
pub const INFINITE: u32 = 0xFFFF_FFFF;

/// Status left in [`RawOverlapped::internal`] while an operation is in flight.
pub const STATUS_PENDING: usize = 0x0000_0103;

/// Communication event: a character was received.
pub const EV_RXCHAR: u32 = 0x0001;
/// Communication event: the event character was received.
pub const EV_RXFLAG: u32 = 0x0002;
/// Communication event: the output buffer drained.
pub const EV_TXEMPTY: u32 = 0x0004;
/// Communication event: CTS changed state.
pub const EV_CTS: u32 = 0x0008;
/// Communication event: DSR changed state.
pub const EV_DSR: u32 = 0x0010;
/// Communication event: RLSD changed state.
pub const EV_RLSD: u32 = 0x0020;
/// Communication event: a break was detected.
pub const EV_BREAK: u32 = 0x0040;
/// Communication event: a line status error occurred.
pub const EV_ERR: u32 = 0x0080;
/// Communication event: a ring indicator was detected.
pub const EV_RING: u32 = 0x0100;

/// A raw native descriptor as the OS hands it out.
///
/// This is the value exchanged with [`Os`] implementations only. The public
/// API wraps it in [`Device`](crate::Device), [`Event`](crate::Event) and
/// [`RegistryKey`](crate::RegistryKey), none of which can be built from a raw
/// value.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct RawHandle(isize);

impl RawHandle {
    /// The `INVALID_HANDLE_VALUE` sentinel.
    pub const INVALID: RawHandle = RawHandle(-1);
    /// The null handle.
    pub const NULL: RawHandle = RawHandle(0);

    /// Wraps a native value.
    pub fn from_raw(raw: isize) -> RawHandle {
        RawHandle(raw)
    }

    /// The native value.
    pub fn as_raw(self) -> isize {
        self.0
    }

    /// Returns `true` for both failure sentinels (null and `INVALID_HANDLE_VALUE`).
    pub fn is_invalid(self) -> bool {
        self == RawHandle::INVALID || self == RawHandle::NULL
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0)
    }
}

/// A value returned by a native call together with the thread's last error,
/// read right after that call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Captured<T> {
    /// What the call returned
    pub value: T,
    /// Last error captured with the call
    pub last_error: ErrorCode,
}

impl<T> Captured<T> {
    /// Pairs a value with a captured code.
    pub fn new(value: T, last_error: ErrorCode) -> Captured<T> {
        Captured { value, last_error }
    }

    /// Transforms the value and keeps the captured code.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Captured<U> {
        Captured {
            value: f(self.value),
            last_error: self.last_error,
        }
    }
}

impl Captured<bool> {
    /// `Ok(())` when the call reported success, else the captured code.
    pub fn ok(self) -> Result<(), ErrorCode> {
        if self.value {
            Ok(())
        } else {
            Err(self.last_error)
        }
    }
}

/// Output of a read, write or completion query.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RawTransfer {
    /// The call returned `TRUE`
    pub ok: bool,
    /// Bytes the call reported as transferred
    pub bytes: u32,
}

/// Mirror of the native `OVERLAPPED` block.
///
/// The layout is fixed and identical to the OS structure on both 32 and
/// 64 bit targets. The OS writes `internal` (status) and `internal_high`
/// (bytes transferred) until the operation completes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RawOverlapped {
    /// Completion status, [`STATUS_PENDING`] while in flight
    pub internal: usize,
    /// Bytes transferred
    pub internal_high: usize,
    /// Low 32 bits of the file position, always zero here
    pub offset: u32,
    /// High 32 bits of the file position, always zero here
    pub offset_high: u32,
    /// Event signaled on completion
    pub event: isize,
}

/// Mirror of the native `DCB` line configuration block.
///
/// `bits` packs the flag fields exactly as the OS does:
///
/// | bits  | field              |
/// |-------|--------------------|
/// | 0     | fBinary            |
/// | 1     | fParity            |
/// | 2     | fOutxCtsFlow       |
/// | 3     | fOutxDsrFlow       |
/// | 4-5   | fDtrControl        |
/// | 6     | fDsrSensitivity    |
/// | 7     | fTXContinueOnXoff  |
/// | 8     | fOutX              |
/// | 9     | fInX               |
/// | 10    | fErrorChar         |
/// | 11    | fNull              |
/// | 12-13 | fRtsControl        |
/// | 14    | fAbortOnError      |
/// | 15-31 | fDummy2 (reserved) |
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NativeDcb {
    /// Size of this structure in bytes
    pub dcb_length: u32,
    /// Baud rate
    pub baud_rate: u32,
    /// Packed flag fields
    pub bits: u32,
    /// Reserved, must be passed through
    pub w_reserved: u16,
    /// XON watermark
    pub xon_lim: u16,
    /// XOFF watermark
    pub xoff_lim: u16,
    /// Data bits per byte
    pub byte_size: u8,
    /// Parity scheme
    pub parity: u8,
    /// Stop bits scheme
    pub stop_bits: u8,
    /// XON character
    pub xon_char: u8,
    /// XOFF character
    pub xoff_char: u8,
    /// Parity error replacement character
    pub error_char: u8,
    /// End of input character
    pub eof_char: u8,
    /// Event character
    pub evt_char: u8,
    /// Reserved, must be passed through
    pub w_reserved1: u16,
}

impl NativeDcb {
    /// Size of the block in bytes.
    pub const SIZE: u32 = 28;

    /// A zeroed block with its length field set.
    pub fn sized() -> NativeDcb {
        NativeDcb {
            dcb_length: NativeDcb::SIZE,
            ..NativeDcb::default()
        }
    }
}

/// Output of `ClearCommError`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CommStatus {
    /// Error flags that were pending and are now cleared
    pub errors: u32,
    /// Packed `COMSTAT` flag bits
    pub flags: u32,
    /// Bytes received but not yet read
    pub in_queue: u32,
    /// Bytes still to be transmitted
    pub out_queue: u32,
}

/// A predefined registry root.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegRoot {
    /// `HKEY_CURRENT_USER`
    CurrentUser,
    /// `HKEY_LOCAL_MACHINE`
    LocalMachine,
}

/// Output of one `RegEnumValue` call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RawRegValue {
    /// Characters written to the name buffer, without the terminator
    pub name_len: u32,
    /// Value type
    pub kind: u32,
    /// Bytes written to (or required by) the data buffer
    pub data_len: u32,
}

/// The native primitives used by the core.
///
/// Implementations must read the thread's last error right after the native
/// call and before anything else that could touch it; that is the only way a
/// [`Captured`] may be produced. Registry calls return their status directly,
/// and implementations put it into `last_error`.
///
/// Methods taking raw pointers are `unsafe`: the OS may keep using them after
/// the call returns, until the operation bound to the overlapped block has
/// completed.
pub trait Os: Send + Sync {
    /// `CreateFile`.
    fn create_file(
        &self,
        path: &str,
        access: u32,
        share_mode: u32,
        disposition: u32,
        flags: u32,
    ) -> Captured<RawHandle>;

    /// `CloseHandle`.
    fn close_handle(&self, handle: RawHandle) -> Captured<bool>;

    /// `CreateEvent`.
    fn create_event(
        &self,
        manual_reset: bool,
        initial_state: bool,
        name: Option<&str>,
    ) -> Captured<RawHandle>;

    /// `SetEvent`.
    fn set_event(&self, event: RawHandle) -> Captured<bool>;

    /// `ResetEvent`.
    fn reset_event(&self, event: RawHandle) -> Captured<bool>;

    /// `WaitForSingleObject`.
    fn wait_for_single_object(&self, handle: RawHandle, millis: u32) -> Captured<u32>;

    /// `GetCommState`.
    fn get_comm_state(&self, handle: RawHandle, dcb: &mut NativeDcb) -> Captured<bool>;

    /// `SetCommState`.
    fn set_comm_state(&self, handle: RawHandle, dcb: &NativeDcb) -> Captured<bool>;

    /// `WriteFile`. A null `overlapped` performs a synchronous transfer.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for `len` bytes and, like `overlapped`, stay valid
    /// and unmoved until the operation has completed.
    unsafe fn write_file(
        &self,
        handle: RawHandle,
        buf: *const u8,
        len: u32,
        overlapped: *mut RawOverlapped,
    ) -> Captured<RawTransfer>;

    /// `ReadFile`. A null `overlapped` performs a synchronous transfer.
    ///
    /// # Safety
    ///
    /// Same contract as [`Os::write_file`], for writable memory.
    unsafe fn read_file(
        &self,
        handle: RawHandle,
        buf: *mut u8,
        len: u32,
        overlapped: *mut RawOverlapped,
    ) -> Captured<RawTransfer>;

    /// `GetOverlappedResult`.
    ///
    /// # Safety
    ///
    /// `overlapped` must be the block of an operation submitted on `handle`.
    unsafe fn get_overlapped_result(
        &self,
        handle: RawHandle,
        overlapped: *mut RawOverlapped,
        wait: bool,
    ) -> Captured<RawTransfer>;

    /// `CancelIoEx`. A null `overlapped` cancels everything on the handle.
    ///
    /// # Safety
    ///
    /// `overlapped` must be null or point to a live block.
    unsafe fn cancel_io(&self, handle: RawHandle, overlapped: *mut RawOverlapped)
        -> Captured<bool>;

    /// `SetCommMask`.
    fn set_comm_mask(&self, handle: RawHandle, mask: u32) -> Captured<bool>;

    /// `WaitCommEvent`.
    ///
    /// # Safety
    ///
    /// `mask` and `overlapped` must stay valid until completion.
    unsafe fn wait_comm_event(
        &self,
        handle: RawHandle,
        mask: *mut u32,
        overlapped: *mut RawOverlapped,
    ) -> Captured<bool>;

    /// `ClearCommError`; `None` when the call failed.
    fn clear_comm_error(&self, handle: RawHandle) -> Captured<Option<CommStatus>>;

    /// `RegOpenKeyEx`.
    fn reg_open_key(&self, root: RegRoot, subkey: &str, access: u32) -> Captured<RawHandle>;

    /// `RegCloseKey`.
    fn reg_close_key(&self, key: RawHandle) -> Captured<bool>;

    /// `RegEnumValue`. The capacities of `name` and `data` are passed as the
    /// input lengths.
    fn reg_enum_value(
        &self,
        key: RawHandle,
        index: u32,
        name: &mut [u8],
        data: &mut [u8],
    ) -> Captured<RawRegValue>;

    /// `FormatMessage` for a system error code.
    fn format_message(&self, code: ErrorCode) -> Option<String>;
}

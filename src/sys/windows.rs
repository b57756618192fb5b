//! Win32 implementation of [`Os`].
#![cfg(windows)]

use std::ffi::{CString, OsStr};
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::ptr;

use winapi::ctypes::c_char;
use winapi::shared::minwindef::{DWORD, FALSE, HKEY, TRUE};
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::fileapi::{CreateFileW, ReadFile, WriteFile};
use winapi::um::handleapi::CloseHandle;
use winapi::um::ioapiset::{CancelIoEx, GetOverlappedResult};
use winapi::um::minwinbase::OVERLAPPED;
use winapi::um::synchapi::{CreateEventW, ResetEvent, SetEvent, WaitForSingleObject};
use winapi::um::winbase::{
    ClearCommError, FormatMessageW, GetCommState, SetCommMask, SetCommState, WaitCommEvent, COMSTAT,
    DCB, FORMAT_MESSAGE_FROM_SYSTEM, FORMAT_MESSAGE_IGNORE_INSERTS,
};
use winapi::um::winnt::HANDLE;
use winapi::um::winreg::{
    RegCloseKey, RegEnumValueA, RegOpenKeyExA, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE,
};

use crate::error::ErrorCode;
use crate::sys::{
    Captured, CommStatus, NativeDcb, Os, RawHandle, RawOverlapped, RawRegValue, RawTransfer,
    RegRoot,
};

// `RawOverlapped` is handed to the OS as an `OVERLAPPED`.
const _OVERLAPPED_SIZE: [(); mem::size_of::<OVERLAPPED>()] = [(); mem::size_of::<RawOverlapped>()];
const _DCB_SIZE: [(); mem::size_of::<DCB>()] = [(); NativeDcb::SIZE as usize];

/// Reads the calling thread's last error. Must directly follow the native call.
#[inline(always)]
fn captured<T>(value: T) -> Captured<T> {
    let code = unsafe { GetLastError() };
    Captured::new(value, ErrorCode(code))
}

fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(Some(0)).collect()
}

fn handle(raw: RawHandle) -> HANDLE {
    raw.as_raw() as HANDLE
}

fn raw(handle: HANDLE) -> RawHandle {
    RawHandle::from_raw(handle as isize)
}

fn overlapped(ptr: *mut RawOverlapped) -> *mut OVERLAPPED {
    ptr as *mut OVERLAPPED
}

fn root_key(root: RegRoot) -> HKEY {
    match root {
        RegRoot::CurrentUser => HKEY_CURRENT_USER,
        RegRoot::LocalMachine => HKEY_LOCAL_MACHINE,
    }
}

fn to_native(dcb: &NativeDcb) -> DCB {
    let mut out: DCB = unsafe { mem::zeroed() };
    out.DCBlength = dcb.dcb_length;
    out.BaudRate = dcb.baud_rate;
    out.BitFields = dcb.bits;
    out.wReserved = dcb.w_reserved;
    out.XonLim = dcb.xon_lim;
    out.XoffLim = dcb.xoff_lim;
    out.ByteSize = dcb.byte_size;
    out.Parity = dcb.parity;
    out.StopBits = dcb.stop_bits;
    out.XonChar = dcb.xon_char as c_char;
    out.XoffChar = dcb.xoff_char as c_char;
    out.ErrorChar = dcb.error_char as c_char;
    out.EofChar = dcb.eof_char as c_char;
    out.EvtChar = dcb.evt_char as c_char;
    out.wReserved1 = dcb.w_reserved1;
    out
}

fn from_native(dcb: &DCB) -> NativeDcb {
    NativeDcb {
        dcb_length: dcb.DCBlength,
        baud_rate: dcb.BaudRate,
        bits: dcb.BitFields,
        w_reserved: dcb.wReserved,
        xon_lim: dcb.XonLim,
        xoff_lim: dcb.XoffLim,
        byte_size: dcb.ByteSize,
        parity: dcb.Parity,
        stop_bits: dcb.StopBits,
        xon_char: dcb.XonChar as u8,
        xoff_char: dcb.XoffChar as u8,
        error_char: dcb.ErrorChar as u8,
        eof_char: dcb.EofChar as u8,
        evt_char: dcb.EvtChar as u8,
        w_reserved1: dcb.wReserved1,
    }
}

/// The real Win32 API.
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32;

impl Os for Win32 {
    fn create_file(
        &self,
        path: &str,
        access: u32,
        share_mode: u32,
        disposition: u32,
        flags: u32,
    ) -> Captured<RawHandle> {
        let path = wide(path);
        let h = unsafe {
            CreateFileW(
                path.as_ptr(),
                access,
                share_mode,
                ptr::null_mut(),
                disposition,
                flags,
                ptr::null_mut(),
            )
        };
        captured(raw(h))
    }

    fn close_handle(&self, h: RawHandle) -> Captured<bool> {
        let ret = unsafe { CloseHandle(handle(h)) };
        captured(ret != FALSE)
    }

    fn create_event(
        &self,
        manual_reset: bool,
        initial_state: bool,
        name: Option<&str>,
    ) -> Captured<RawHandle> {
        let name = name.map(wide);
        let name_ptr = name.as_ref().map_or(ptr::null(), |n| n.as_ptr());
        let h = unsafe {
            CreateEventW(
                ptr::null_mut(),
                if manual_reset { TRUE } else { FALSE },
                if initial_state { TRUE } else { FALSE },
                name_ptr,
            )
        };
        captured(raw(h))
    }

    fn set_event(&self, event: RawHandle) -> Captured<bool> {
        let ret = unsafe { SetEvent(handle(event)) };
        captured(ret != FALSE)
    }

    fn reset_event(&self, event: RawHandle) -> Captured<bool> {
        let ret = unsafe { ResetEvent(handle(event)) };
        captured(ret != FALSE)
    }

    fn wait_for_single_object(&self, h: RawHandle, millis: u32) -> Captured<u32> {
        let ret = unsafe { WaitForSingleObject(handle(h), millis) };
        captured(ret)
    }

    fn get_comm_state(&self, h: RawHandle, dcb: &mut NativeDcb) -> Captured<bool> {
        let mut native = to_native(dcb);
        let ret = unsafe { GetCommState(handle(h), &mut native) };
        let result = captured(ret != FALSE);
        if result.value {
            *dcb = from_native(&native);
        }
        result
    }

    fn set_comm_state(&self, h: RawHandle, dcb: &NativeDcb) -> Captured<bool> {
        let mut native = to_native(dcb);
        let ret = unsafe { SetCommState(handle(h), &mut native) };
        captured(ret != FALSE)
    }

    unsafe fn write_file(
        &self,
        h: RawHandle,
        buf: *const u8,
        len: u32,
        ov: *mut RawOverlapped,
    ) -> Captured<RawTransfer> {
        let mut written: DWORD = 0;
        // The count out-parameter must be null for overlapped calls; the
        // count lands in the overlapped block instead.
        let count = if ov.is_null() { &mut written as *mut DWORD } else { ptr::null_mut() };
        let ret = WriteFile(handle(h), buf as *const _, len, count, overlapped(ov));
        let result = captured(ret != FALSE);
        let bytes = match (result.value, ov.is_null()) {
            (true, true) => written,
            (true, false) => (*ov).internal_high as u32,
            (false, _) => 0,
        };
        result.map(|ok| RawTransfer { ok, bytes })
    }

    unsafe fn read_file(
        &self,
        h: RawHandle,
        buf: *mut u8,
        len: u32,
        ov: *mut RawOverlapped,
    ) -> Captured<RawTransfer> {
        let mut read: DWORD = 0;
        let count = if ov.is_null() { &mut read as *mut DWORD } else { ptr::null_mut() };
        let ret = ReadFile(handle(h), buf as *mut _, len, count, overlapped(ov));
        let result = captured(ret != FALSE);
        let bytes = match (result.value, ov.is_null()) {
            (true, true) => read,
            (true, false) => (*ov).internal_high as u32,
            (false, _) => 0,
        };
        result.map(|ok| RawTransfer { ok, bytes })
    }

    unsafe fn get_overlapped_result(
        &self,
        h: RawHandle,
        ov: *mut RawOverlapped,
        wait: bool,
    ) -> Captured<RawTransfer> {
        let mut transferred: DWORD = 0;
        let ret = GetOverlappedResult(
            handle(h),
            overlapped(ov),
            &mut transferred,
            if wait { TRUE } else { FALSE },
        );
        captured(ret != FALSE).map(|ok| RawTransfer {
            ok,
            bytes: transferred,
        })
    }

    unsafe fn cancel_io(&self, h: RawHandle, ov: *mut RawOverlapped) -> Captured<bool> {
        let ret = CancelIoEx(handle(h), overlapped(ov));
        captured(ret != FALSE)
    }

    fn set_comm_mask(&self, h: RawHandle, mask: u32) -> Captured<bool> {
        let ret = unsafe { SetCommMask(handle(h), mask) };
        captured(ret != FALSE)
    }

    unsafe fn wait_comm_event(
        &self,
        h: RawHandle,
        mask: *mut u32,
        ov: *mut RawOverlapped,
    ) -> Captured<bool> {
        let ret = WaitCommEvent(handle(h), mask, overlapped(ov));
        captured(ret != FALSE)
    }

    fn clear_comm_error(&self, h: RawHandle) -> Captured<Option<CommStatus>> {
        let mut errors: DWORD = 0;
        let mut stat: COMSTAT = unsafe { mem::zeroed() };
        let ret = unsafe { ClearCommError(handle(h), &mut errors, &mut stat) };
        captured(ret != FALSE).map(|ok| {
            if ok {
                Some(CommStatus {
                    errors,
                    flags: stat.BitFields,
                    in_queue: stat.cbInQue,
                    out_queue: stat.cbOutQue,
                })
            } else {
                None
            }
        })
    }

    fn reg_open_key(&self, root: RegRoot, subkey: &str, access: u32) -> Captured<RawHandle> {
        let subkey = match CString::new(subkey) {
            Ok(s) => s,
            Err(_) => return Captured::new(RawHandle::NULL, ErrorCode::INVALID_PARAMETER),
        };
        let mut key: HKEY = ptr::null_mut();
        let status = unsafe { RegOpenKeyExA(root_key(root), subkey.as_ptr(), 0, access, &mut key) };
        Captured::new(
            RawHandle::from_raw(key as isize),
            ErrorCode(status as u32),
        )
    }

    fn reg_close_key(&self, key: RawHandle) -> Captured<bool> {
        let status = unsafe { RegCloseKey(key.as_raw() as HKEY) };
        Captured::new(status == 0, ErrorCode(status as u32))
    }

    fn reg_enum_value(
        &self,
        key: RawHandle,
        index: u32,
        name: &mut [u8],
        data: &mut [u8],
    ) -> Captured<RawRegValue> {
        let mut name_len = name.len() as DWORD;
        let mut data_len = data.len() as DWORD;
        let mut kind: DWORD = 0;
        let status = unsafe {
            RegEnumValueA(
                key.as_raw() as HKEY,
                index,
                name.as_mut_ptr() as *mut c_char,
                &mut name_len,
                ptr::null_mut(),
                &mut kind,
                data.as_mut_ptr(),
                &mut data_len,
            )
        };
        Captured::new(
            RawRegValue {
                name_len,
                kind,
                data_len,
            },
            ErrorCode(status as u32),
        )
    }

    fn format_message(&self, code: ErrorCode) -> Option<String> {
        let mut buf = [0u16; 512];
        let len = unsafe {
            FormatMessageW(
                FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS,
                ptr::null(),
                code.0,
                0,
                buf.as_mut_ptr(),
                buf.len() as DWORD,
                ptr::null_mut(),
            )
        };
        if len == 0 {
            return None;
        }
        let msg = String::from_utf16_lossy(&buf[..len as usize]);
        Some(msg.trim_end().to_string())
    }
}

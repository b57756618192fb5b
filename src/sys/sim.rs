//! An in-process kernel with simulated serial devices.
//!
//! `Sim` implements [`Os`] without touching the real operating system. It
//! keeps its own handle table, auto and manual reset events, registry values
//! and a thread-local last error, so every state transition of the core can
//! be exercised on any platform.
//!
//! Devices differ from real COM ports in a few deliberate ways:
//!
//! * reads complete with whatever is queued (at least one byte), the way a
//!   port configured with `ReadIntervalTimeout = MAXDWORD` behaves;
//! * synchronous reads never block, they may return zero bytes;
//! * the status slot of a completed overlapped block holds the Win32 error
//!   code itself rather than an NTSTATUS.
//!
//! When overlapped operations finish is controlled per device with
//! [`Completion`].

use std::cell::Cell;
use std::cmp;
use std::collections::{HashMap, VecDeque};
use std::ptr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::ErrorCode;
use crate::registry::SERIALCOMM_KEY;
use crate::sys::{
    Captured, CommStatus, NativeDcb, Os, RawHandle, RawOverlapped, RawRegValue, RawTransfer,
    RegRoot, EV_RXCHAR, GENERIC_READ, GENERIC_WRITE, INFINITE, OPEN_ALWAYS, OPEN_EXISTING, REG_SZ,
    STATUS_PENDING, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};

thread_local! {
    static LAST_ERROR: Cell<u32> = Cell::new(0);
}

fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|e| e.set(code.0));
}

/// Reads the simulated last error. Must directly follow the simulated call.
fn captured<T>(value: T) -> Captured<T> {
    Captured::new(value, ErrorCode(LAST_ERROR.with(|e| e.get())))
}

fn fail<T>(code: ErrorCode, value: T) -> T {
    set_last_error(code);
    value
}

fn succeed<T>(value: T) -> T {
    set_last_error(ErrorCode::SUCCESS);
    value
}

fn device_name(path: &str) -> String {
    let name = path
        .trim_start_matches(r"\\.\")
        .trim_start_matches(r"\\?\");
    name.to_ascii_uppercase()
}

fn key_path(path: &str) -> String {
    path.trim_matches('\\').to_ascii_lowercase()
}

/// When overlapped operations on a simulated device finish.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Operations that can finish do so inside the submitting call.
    Immediate,
    /// Submissions always report `ERROR_IO_PENDING`. Writes finish once a
    /// thread blocks waiting for them; reads once data is queued.
    OnWait,
    /// Nothing finishes until [`SimDevice::complete_pending`] is called.
    Manual,
}

#[derive(Clone)]
struct OpenDevice {
    name: String,
    access: u32,
    share_mode: u32,
    overlapped: bool,
}

enum Entry {
    Device(OpenDevice),
    Event(u64),
    Key(usize),
}

struct EventState {
    manual_reset: bool,
    signaled: bool,
    name: Option<String>,
    refs: usize,
}

struct DeviceState {
    dcb: NativeDcb,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    completion: Completion,
    loopback: bool,
    comm_mask: u32,
}

impl DeviceState {
    fn new() -> DeviceState {
        DeviceState {
            dcb: default_dcb(),
            rx: VecDeque::new(),
            tx: Vec::new(),
            completion: Completion::OnWait,
            loopback: false,
            comm_mask: 0,
        }
    }

    fn accept(&mut self, data: &[u8]) {
        if self.loopback {
            self.rx.extend(data.iter().cloned());
        } else {
            self.tx.extend_from_slice(data);
        }
    }

    /// Tries to finish `io`, returning its final status and count.
    unsafe fn try_complete(&mut self, io: &PendingIo) -> Option<(ErrorCode, u32)> {
        match io.op {
            PendingOp::Write { buf, len } => {
                let data = std::slice::from_raw_parts(buf, len as usize);
                self.accept(data);
                Some((ErrorCode::SUCCESS, len))
            }
            PendingOp::Read { buf, len } => {
                if self.rx.is_empty() {
                    return None;
                }
                let n = cmp::min(len as usize, self.rx.len());
                for (i, byte) in self.rx.drain(..n).enumerate() {
                    *buf.add(i) = byte;
                }
                Some((ErrorCode::SUCCESS, n as u32))
            }
            PendingOp::CommEvent { mask } => {
                if self.comm_mask & EV_RXCHAR != 0 && !self.rx.is_empty() {
                    *mask = EV_RXCHAR;
                    Some((ErrorCode::SUCCESS, 0))
                } else {
                    None
                }
            }
        }
    }
}

fn default_dcb() -> NativeDcb {
    NativeDcb {
        baud_rate: 9600,
        // fBinary, DTR_CONTROL_ENABLE, RTS_CONTROL_ENABLE
        bits: 0x0001 | (1 << 4) | (1 << 12),
        xon_lim: 2048,
        xoff_lim: 512,
        byte_size: 8,
        xon_char: 0x11,
        xoff_char: 0x13,
        ..NativeDcb::sized()
    }
}

#[derive(Copy, Clone)]
enum PendingOp {
    Write { buf: *const u8, len: u32 },
    Read { buf: *mut u8, len: u32 },
    CommEvent { mask: *mut u32 },
}

struct PendingIo {
    handle: isize,
    device: String,
    overlapped: *mut RawOverlapped,
    event: isize,
    op: PendingOp,
}

// The pointers belong to callers that keep them alive until completion.
unsafe impl Send for PendingIo {}

struct RegKey {
    root: RegRoot,
    path: String,
    values: Vec<(String, u32, Vec<u8>)>,
}

struct State {
    next_handle: isize,
    next_event: u64,
    handles: HashMap<isize, Entry>,
    events: HashMap<u64, EventState>,
    devices: HashMap<String, DeviceState>,
    keys: Vec<RegKey>,
    pending: Vec<PendingIo>,
}

impl State {
    fn insert(&mut self, entry: Entry) -> RawHandle {
        self.next_handle += 4;
        let raw = self.next_handle;
        self.handles.insert(raw, entry);
        RawHandle::from_raw(raw)
    }

    fn open_device(&self, h: RawHandle) -> Option<OpenDevice> {
        match self.handles.get(&h.as_raw()) {
            Some(Entry::Device(open)) => Some(open.clone()),
            _ => None,
        }
    }

    fn event_id(&self, h: RawHandle) -> Option<u64> {
        match self.handles.get(&h.as_raw()) {
            Some(Entry::Event(id)) => Some(*id),
            _ => None,
        }
    }

    fn set_signaled(&mut self, event: isize, signaled: bool) {
        if let Some(Entry::Event(id)) = self.handles.get(&event) {
            if let Some(ev) = self.events.get_mut(id) {
                ev.signaled = signaled;
            }
        }
    }

    fn finish(&mut self, io: PendingIo, status: ErrorCode, bytes: u32) {
        unsafe {
            (*io.overlapped).internal = status.0 as usize;
            (*io.overlapped).internal_high = bytes as usize;
        }
        self.set_signaled(io.event, true);
    }

    /// Completes every eligible pending operation, repeating while progress is
    /// made so that loopback writes can feed reads queued after them.
    fn settle<F>(&mut self, eligible: F) -> usize
    where
        F: Fn(&PendingIo, &DeviceState) -> bool,
    {
        let mut completed = 0;
        loop {
            let before = completed;
            let mut i = 0;
            while i < self.pending.len() {
                let done = {
                    let io = &self.pending[i];
                    match self.devices.get_mut(&io.device) {
                        Some(dev) => {
                            if eligible(io, dev) {
                                unsafe { dev.try_complete(io) }
                            } else {
                                None
                            }
                        }
                        None => None,
                    }
                };
                match done {
                    Some((status, bytes)) => {
                        let io = self.pending.remove(i);
                        self.finish(io, status, bytes);
                        completed += 1;
                    }
                    None => i += 1,
                }
            }
            if completed == before {
                return completed;
            }
        }
    }

    /// Progress made when a thread starts blocking on a completion.
    fn settle_on_wait(&mut self) -> usize {
        self.settle(|_, dev| dev.completion != Completion::Manual)
    }

    /// Progress made when data arrives on `device`.
    fn settle_input(&mut self, device: &str) -> usize {
        self.settle(|io, dev| {
            io.device == device
                && dev.completion != Completion::Manual
                && match io.op {
                    PendingOp::Write { .. } => false,
                    _ => true,
                }
        })
    }

    fn abort(&mut self, handle: isize, overlapped: *mut RawOverlapped) -> usize {
        let mut aborted = 0;
        let mut i = 0;
        while i < self.pending.len() {
            let io = &self.pending[i];
            if io.handle == handle && (overlapped.is_null() || io.overlapped == overlapped) {
                let io = self.pending.remove(i);
                self.finish(io, ErrorCode::OPERATION_ABORTED, 0);
                aborted += 1;
            } else {
                i += 1;
            }
        }
        aborted
    }

    fn find_key(&self, root: RegRoot, path: &str) -> Option<usize> {
        let path = key_path(path);
        self.keys
            .iter()
            .position(|k| k.root == root && k.path == path)
    }
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// The simulated kernel. Clones share the same state.
#[derive(Clone)]
pub struct Sim {
    shared: Arc<Shared>,
}

impl Default for Sim {
    fn default() -> Sim {
        Sim::new()
    }
}

impl Sim {
    /// A kernel with no devices.
    pub fn new() -> Sim {
        Sim {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_handle: 0x100,
                    next_event: 0,
                    handles: HashMap::new(),
                    events: HashMap::new(),
                    devices: HashMap::new(),
                    keys: Vec::new(),
                    pending: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.shared.cond.notify_all();
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.shared
            .cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, State>,
        timeout: Duration,
    ) -> MutexGuard<'a, State> {
        self.shared
            .cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }

    /// Plugs in a device and publishes it under [`SERIALCOMM_KEY`].
    pub fn add_device(&self, name: &str) -> SimDevice {
        let name = device_name(name);
        let index = {
            let mut state = self.lock();
            state.devices.insert(name.clone(), DeviceState::new());
            state.devices.len() - 1
        };
        let mut data = name.clone().into_bytes();
        data.push(0);
        self.add_registry_value(
            RegRoot::LocalMachine,
            SERIALCOMM_KEY,
            &format!(r"\Device\Serial{}", index),
            REG_SZ,
            &data,
        );
        SimDevice {
            sim: self.clone(),
            name,
        }
    }

    /// A previously added device.
    pub fn device(&self, name: &str) -> Option<SimDevice> {
        let name = device_name(name);
        if self.lock().devices.contains_key(&name) {
            Some(SimDevice {
                sim: self.clone(),
                name,
            })
        } else {
            None
        }
    }

    /// Creates the key if needed and appends a value to it.
    pub fn add_registry_value(&self, root: RegRoot, path: &str, name: &str, kind: u32, data: &[u8]) {
        let mut state = self.lock();
        let idx = match state.find_key(root, path) {
            Some(idx) => idx,
            None => {
                state.keys.push(RegKey {
                    root,
                    path: key_path(path),
                    values: Vec::new(),
                });
                state.keys.len() - 1
            }
        };
        state.keys[idx]
            .values
            .push((name.to_string(), kind, data.to_vec()));
    }

    /// Number of live handles of every kind.
    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }

    /// Number of overlapped operations not yet completed.
    pub fn pending_operations(&self) -> usize {
        self.lock().pending.len()
    }
}

impl Os for Sim {
    fn create_file(
        &self,
        path: &str,
        access: u32,
        share_mode: u32,
        disposition: u32,
        flags: u32,
    ) -> Captured<RawHandle> {
        let h = {
            let mut state = self.lock();
            let name = device_name(path);
            if !state.devices.contains_key(&name) {
                fail(ErrorCode::FILE_NOT_FOUND, RawHandle::INVALID)
            } else if disposition != OPEN_EXISTING && disposition != OPEN_ALWAYS {
                fail(ErrorCode::INVALID_PARAMETER, RawHandle::INVALID)
            } else if access & (GENERIC_READ | GENERIC_WRITE) == 0 && access != 0 {
                fail(ErrorCode::INVALID_PARAMETER, RawHandle::INVALID)
            } else {
                let conflict = state.handles.values().any(|e| match e {
                    Entry::Device(open) => {
                        open.name == name && (open.share_mode == 0 || share_mode == 0)
                    }
                    _ => false,
                });
                if conflict {
                    fail(ErrorCode::ACCESS_DENIED, RawHandle::INVALID)
                } else {
                    let h = state.insert(Entry::Device(OpenDevice {
                        name,
                        access,
                        share_mode,
                        overlapped: flags & super::FILE_FLAG_OVERLAPPED != 0,
                    }));
                    succeed(h)
                }
            }
        };
        captured(h)
    }

    fn close_handle(&self, h: RawHandle) -> Captured<bool> {
        let ok = {
            let mut state = self.lock();
            match state.handles.remove(&h.as_raw()) {
                Some(Entry::Device(_)) => {
                    if state.abort(h.as_raw(), ptr::null_mut()) > 0 {
                        self.notify();
                    }
                    succeed(true)
                }
                Some(Entry::Event(id)) => {
                    let gone = match state.events.get_mut(&id) {
                        Some(ev) => {
                            ev.refs -= 1;
                            ev.refs == 0
                        }
                        None => false,
                    };
                    if gone {
                        state.events.remove(&id);
                        // Waiters on a closed event fail.
                        self.notify();
                    }
                    succeed(true)
                }
                Some(Entry::Key(idx)) => {
                    // Registry keys are released with `RegCloseKey`.
                    state.handles.insert(h.as_raw(), Entry::Key(idx));
                    fail(ErrorCode::INVALID_HANDLE, false)
                }
                None => fail(ErrorCode::INVALID_HANDLE, false),
            }
        };
        captured(ok)
    }

    fn create_event(
        &self,
        manual_reset: bool,
        initial_state: bool,
        name: Option<&str>,
    ) -> Captured<RawHandle> {
        let h = {
            let mut state = self.lock();
            let existing = name.and_then(|name| {
                state
                    .events
                    .iter()
                    .find(|(_, ev)| ev.name.as_ref().map(String::as_str) == Some(name))
                    .map(|(id, _)| *id)
            });
            match existing {
                Some(id) => {
                    if let Some(ev) = state.events.get_mut(&id) {
                        ev.refs += 1;
                    }
                    let h = state.insert(Entry::Event(id));
                    fail(ErrorCode::ALREADY_EXISTS, h)
                }
                None => {
                    state.next_event += 1;
                    let id = state.next_event;
                    state.events.insert(
                        id,
                        EventState {
                            manual_reset,
                            signaled: initial_state,
                            name: name.map(str::to_string),
                            refs: 1,
                        },
                    );
                    let h = state.insert(Entry::Event(id));
                    succeed(h)
                }
            }
        };
        captured(h)
    }

    fn set_event(&self, event: RawHandle) -> Captured<bool> {
        let ok = {
            let mut state = self.lock();
            if state.event_id(event).is_some() {
                state.set_signaled(event.as_raw(), true);
                self.notify();
                succeed(true)
            } else {
                fail(ErrorCode::INVALID_HANDLE, false)
            }
        };
        captured(ok)
    }

    fn reset_event(&self, event: RawHandle) -> Captured<bool> {
        let ok = {
            let mut state = self.lock();
            if state.event_id(event).is_some() {
                state.set_signaled(event.as_raw(), false);
                succeed(true)
            } else {
                fail(ErrorCode::INVALID_HANDLE, false)
            }
        };
        captured(ok)
    }

    fn wait_for_single_object(&self, h: RawHandle, millis: u32) -> Captured<u32> {
        let ret = {
            let mut state = self.lock();
            match state.event_id(h) {
                None => fail(ErrorCode::INVALID_HANDLE, WAIT_FAILED),
                Some(id) => {
                    if millis != 0 && state.settle_on_wait() > 0 {
                        self.notify();
                    }
                    let deadline = if millis == INFINITE {
                        None
                    } else {
                        Some(Instant::now() + Duration::from_millis(u64::from(millis)))
                    };
                    loop {
                        match state.events.get_mut(&id) {
                            None => break fail(ErrorCode::INVALID_HANDLE, WAIT_FAILED),
                            Some(ev) if ev.signaled => {
                                if !ev.manual_reset {
                                    ev.signaled = false;
                                }
                                break succeed(WAIT_OBJECT_0);
                            }
                            Some(_) => {}
                        }
                        state = match deadline {
                            None => self.wait(state),
                            Some(deadline) => {
                                let now = Instant::now();
                                if now >= deadline {
                                    break succeed(WAIT_TIMEOUT);
                                }
                                self.wait_timeout(state, deadline - now)
                            }
                        };
                    }
                }
            }
        };
        captured(ret)
    }

    fn get_comm_state(&self, h: RawHandle, dcb: &mut NativeDcb) -> Captured<bool> {
        let ok = {
            let state = self.lock();
            match state
                .open_device(h)
                .and_then(|open| state.devices.get(&open.name))
            {
                Some(dev) => {
                    *dcb = dev.dcb;
                    succeed(true)
                }
                None => fail(ErrorCode::INVALID_HANDLE, false),
            }
        };
        captured(ok)
    }

    fn set_comm_state(&self, h: RawHandle, dcb: &NativeDcb) -> Captured<bool> {
        let ok = {
            let mut state = self.lock();
            let name = state.open_device(h).map(|open| open.name);
            match name.and_then(|name| state.devices.get_mut(&name)) {
                None => fail(ErrorCode::INVALID_HANDLE, false),
                Some(dev) => {
                    if valid_dcb(dcb) {
                        dev.dcb = *dcb;
                        succeed(true)
                    } else {
                        fail(ErrorCode::INVALID_PARAMETER, false)
                    }
                }
            }
        };
        captured(ok)
    }

    unsafe fn write_file(
        &self,
        h: RawHandle,
        buf: *const u8,
        len: u32,
        ov: *mut RawOverlapped,
    ) -> Captured<RawTransfer> {
        let transfer = self.submit(h, ov, PendingOp::Write { buf, len });
        captured(transfer)
    }

    unsafe fn read_file(
        &self,
        h: RawHandle,
        buf: *mut u8,
        len: u32,
        ov: *mut RawOverlapped,
    ) -> Captured<RawTransfer> {
        let transfer = self.submit(h, ov, PendingOp::Read { buf, len });
        captured(transfer)
    }

    unsafe fn get_overlapped_result(
        &self,
        h: RawHandle,
        ov: *mut RawOverlapped,
        wait: bool,
    ) -> Captured<RawTransfer> {
        let transfer = {
            let mut state = self.lock();
            if state.open_device(h).is_none() {
                fail(ErrorCode::INVALID_HANDLE, RawTransfer::default())
            } else {
                if wait && state.settle_on_wait() > 0 {
                    self.notify();
                }
                loop {
                    let status = (*ov).internal;
                    if status != STATUS_PENDING {
                        let bytes = (*ov).internal_high as u32;
                        break if status == 0 {
                            succeed(RawTransfer { ok: true, bytes })
                        } else {
                            fail(ErrorCode(status as u32), RawTransfer { ok: false, bytes })
                        };
                    }
                    if !wait {
                        break fail(ErrorCode::IO_INCOMPLETE, RawTransfer::default());
                    }
                    state = self.wait(state);
                }
            }
        };
        captured(transfer)
    }

    unsafe fn cancel_io(&self, h: RawHandle, ov: *mut RawOverlapped) -> Captured<bool> {
        let ok = {
            let mut state = self.lock();
            if state.open_device(h).is_none() {
                fail(ErrorCode::INVALID_HANDLE, false)
            } else if state.abort(h.as_raw(), ov) > 0 {
                self.notify();
                succeed(true)
            } else {
                fail(ErrorCode::NOT_FOUND, false)
            }
        };
        captured(ok)
    }

    fn set_comm_mask(&self, h: RawHandle, mask: u32) -> Captured<bool> {
        let ok = {
            let mut state = self.lock();
            let name = state.open_device(h).map(|open| open.name);
            match name.and_then(|name| state.devices.get_mut(&name).map(|dev| (name, dev))) {
                None => fail(ErrorCode::INVALID_HANDLE, false),
                Some((name, dev)) => {
                    dev.comm_mask = mask;
                    // A pending WaitCommEvent returns with an empty mask.
                    let mut i = 0;
                    let mut woke = false;
                    while i < state.pending.len() {
                        let hit = match state.pending[i].op {
                            PendingOp::CommEvent { .. } => state.pending[i].device == name,
                            _ => false,
                        };
                        if hit {
                            let io = state.pending.remove(i);
                            if let PendingOp::CommEvent { mask } = io.op {
                                unsafe { *mask = 0 };
                            }
                            state.finish(io, ErrorCode::SUCCESS, 0);
                            woke = true;
                        } else {
                            i += 1;
                        }
                    }
                    if woke {
                        self.notify();
                    }
                    succeed(true)
                }
            }
        };
        captured(ok)
    }

    unsafe fn wait_comm_event(
        &self,
        h: RawHandle,
        mask: *mut u32,
        ov: *mut RawOverlapped,
    ) -> Captured<bool> {
        let ok = {
            let state = self.lock();
            let comm_mask = state
                .open_device(h)
                .and_then(|open| state.devices.get(&open.name))
                .map(|dev| dev.comm_mask);
            drop(state);
            match comm_mask {
                None => fail(ErrorCode::INVALID_HANDLE, false),
                Some(0) => fail(ErrorCode::INVALID_PARAMETER, false),
                Some(_) => {
                    *mask = 0;
                    self.submit(h, ov, PendingOp::CommEvent { mask }).ok
                }
            }
        };
        captured(ok)
    }

    fn clear_comm_error(&self, h: RawHandle) -> Captured<Option<CommStatus>> {
        let status = {
            let state = self.lock();
            match state
                .open_device(h)
                .and_then(|open| state.devices.get(&open.name))
            {
                Some(dev) => succeed(Some(CommStatus {
                    errors: 0,
                    flags: 0,
                    in_queue: dev.rx.len() as u32,
                    out_queue: 0,
                })),
                None => fail(ErrorCode::INVALID_HANDLE, None),
            }
        };
        captured(status)
    }

    fn reg_open_key(&self, root: RegRoot, subkey: &str, _access: u32) -> Captured<RawHandle> {
        let mut state = self.lock();
        match state.find_key(root, subkey) {
            Some(idx) => Captured::new(state.insert(Entry::Key(idx)), ErrorCode::SUCCESS),
            None => Captured::new(RawHandle::NULL, ErrorCode::FILE_NOT_FOUND),
        }
    }

    fn reg_close_key(&self, key: RawHandle) -> Captured<bool> {
        let mut state = self.lock();
        match state.handles.get(&key.as_raw()) {
            Some(Entry::Key(_)) => {
                state.handles.remove(&key.as_raw());
                Captured::new(true, ErrorCode::SUCCESS)
            }
            _ => Captured::new(false, ErrorCode::INVALID_HANDLE),
        }
    }

    fn reg_enum_value(
        &self,
        key: RawHandle,
        index: u32,
        name: &mut [u8],
        data: &mut [u8],
    ) -> Captured<RawRegValue> {
        let state = self.lock();
        let idx = match state.handles.get(&key.as_raw()) {
            Some(Entry::Key(idx)) => *idx,
            _ => return Captured::new(RawRegValue::default(), ErrorCode::INVALID_HANDLE),
        };
        let (value_name, kind, value) = match state.keys[idx].values.get(index as usize) {
            Some(v) => v,
            None => return Captured::new(RawRegValue::default(), ErrorCode::NO_MORE_ITEMS),
        };
        let value_name = value_name.as_bytes();
        if value_name.len() + 1 > name.len() || value.len() > data.len() {
            let out = RawRegValue {
                name_len: name.len() as u32,
                kind: *kind,
                data_len: value.len() as u32,
            };
            return Captured::new(out, ErrorCode::MORE_DATA);
        }
        name[..value_name.len()].copy_from_slice(value_name);
        name[value_name.len()] = 0;
        data[..value.len()].copy_from_slice(value);
        let out = RawRegValue {
            name_len: value_name.len() as u32,
            kind: *kind,
            data_len: value.len() as u32,
        };
        Captured::new(out, ErrorCode::SUCCESS)
    }

    fn format_message(&self, code: ErrorCode) -> Option<String> {
        let msg = match code {
            ErrorCode::SUCCESS => "The operation completed successfully.",
            ErrorCode::FILE_NOT_FOUND => "The system cannot find the file specified.",
            ErrorCode::ACCESS_DENIED => "Access is denied.",
            ErrorCode::INVALID_HANDLE => "The handle is invalid.",
            ErrorCode::INVALID_PARAMETER => "The parameter is incorrect.",
            ErrorCode::OPERATION_ABORTED => {
                "The I/O operation has been aborted because of either a thread exit or an application request."
            }
            ErrorCode::IO_INCOMPLETE => "Overlapped I/O event is not in a signaled state.",
            ErrorCode::IO_PENDING => "Overlapped I/O operation is in progress.",
            _ => return None,
        };
        Some(msg.to_string())
    }
}

impl Sim {
    /// Shared submission path of reads, writes and comm-event waits.
    unsafe fn submit(&self, h: RawHandle, ov: *mut RawOverlapped, op: PendingOp) -> RawTransfer {
        let mut state = self.lock();
        let open = match state.open_device(h) {
            Some(open) => open,
            None => return fail(ErrorCode::INVALID_HANDLE, RawTransfer::default()),
        };
        let needs = match op {
            PendingOp::Write { .. } => GENERIC_WRITE,
            PendingOp::Read { .. } => GENERIC_READ,
            PendingOp::CommEvent { .. } => 0,
        };
        if open.access & needs != needs {
            return fail(ErrorCode::ACCESS_DENIED, RawTransfer::default());
        }

        if !open.overlapped {
            let dev = match state.devices.get_mut(&open.name) {
                Some(dev) => dev,
                None => return fail(ErrorCode::GEN_FAILURE, RawTransfer::default()),
            };
            let bytes = match op {
                PendingOp::Write { buf, len } => {
                    dev.accept(std::slice::from_raw_parts(buf, len as usize));
                    len
                }
                PendingOp::Read { buf, len } => {
                    let n = cmp::min(len as usize, dev.rx.len());
                    for (i, byte) in dev.rx.drain(..n).enumerate() {
                        *buf.add(i) = byte;
                    }
                    n as u32
                }
                PendingOp::CommEvent { mask } => {
                    if dev.comm_mask & EV_RXCHAR != 0 && !dev.rx.is_empty() {
                        *mask = EV_RXCHAR;
                    }
                    0
                }
            };
            if state.settle_input(&open.name) > 0 {
                self.notify();
            }
            return succeed(RawTransfer { ok: true, bytes });
        }

        if ov.is_null() {
            return fail(ErrorCode::INVALID_PARAMETER, RawTransfer::default());
        }
        (*ov).internal = STATUS_PENDING;
        (*ov).internal_high = 0;
        let event = (*ov).event;
        state.set_signaled(event, false);

        let io = PendingIo {
            handle: h.as_raw(),
            device: open.name.clone(),
            overlapped: ov,
            event,
            op,
        };
        let immediate = match state.devices.get_mut(&open.name) {
            Some(dev) if dev.completion == Completion::Immediate => dev.try_complete(&io),
            _ => None,
        };
        match immediate {
            Some((status, bytes)) => {
                state.finish(io, status, bytes);
                if state.settle_input(&open.name) > 0 {
                    self.notify();
                }
                self.notify();
                if status == ErrorCode::SUCCESS {
                    succeed(RawTransfer { ok: true, bytes })
                } else {
                    fail(status, RawTransfer::default())
                }
            }
            None => {
                state.pending.push(io);
                fail(ErrorCode::IO_PENDING, RawTransfer::default())
            }
        }
    }
}

fn valid_dcb(dcb: &NativeDcb) -> bool {
    let dtr_control = (dcb.bits >> 4) & 0b11;
    dcb.dcb_length == NativeDcb::SIZE
        && dcb.baud_rate != 0
        && (4..=8).contains(&dcb.byte_size)
        && dcb.parity <= 4
        && dcb.stop_bits <= 2
        && dtr_control != 3
        && !(dcb.byte_size == 5 && dcb.stop_bits == 2)
        && !(dcb.byte_size >= 6 && dcb.stop_bits == 1)
}

/// Test-side control of one simulated device.
#[derive(Clone)]
pub struct SimDevice {
    sim: Sim,
    name: String,
}

impl SimDevice {
    /// Normalized device name, e.g. `COM3`.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn with<T, F: FnOnce(&mut DeviceState) -> T>(&self, f: F) -> T {
        let mut state = self.sim.lock();
        let dev = state
            .devices
            .entry(self.name.clone())
            .or_insert_with(DeviceState::new);
        f(dev)
    }

    /// Queues bytes as if they arrived on the line.
    pub fn inject(&self, data: &[u8]) {
        let mut state = self.sim.lock();
        if let Some(dev) = state.devices.get_mut(&self.name) {
            dev.rx.extend(data.iter().cloned());
        }
        state.settle_input(&self.name);
        self.sim.notify();
    }

    /// Drains everything written to the device so far.
    pub fn take_written(&self) -> Vec<u8> {
        self.with(|dev| std::mem::replace(&mut dev.tx, Vec::new()))
    }

    /// Bytes received but not yet read.
    pub fn queued_input(&self) -> usize {
        self.with(|dev| dev.rx.len())
    }

    /// Selects when overlapped operations finish.
    pub fn set_completion(&self, completion: Completion) {
        self.with(|dev| dev.completion = completion)
    }

    /// Routes written bytes back into the receive queue.
    pub fn set_loopback(&self, loopback: bool) {
        self.with(|dev| dev.loopback = loopback)
    }

    /// Finishes every pending operation that can finish now, regardless of
    /// the completion mode. Returns how many completed.
    pub fn complete_pending(&self) -> usize {
        let name = self.name.clone();
        let mut state = self.sim.lock();
        let n = state.settle(|io, _| io.device == name);
        self.sim.notify();
        n
    }

    /// Overlapped operations on this device not yet completed.
    pub fn pending(&self) -> usize {
        let state = self.sim.lock();
        state
            .pending
            .iter()
            .filter(|io| io.device == self.name)
            .count()
    }

    /// Handles currently open on this device.
    pub fn open_count(&self) -> usize {
        let state = self.sim.lock();
        state
            .handles
            .values()
            .filter(|e| match e {
                Entry::Device(open) => open.name == self.name,
                _ => false,
            })
            .count()
    }

    /// The stored configuration block.
    pub fn config_block(&self) -> NativeDcb {
        self.with(|dev| dev.dcb)
    }

    /// Replaces the stored configuration block without validation.
    pub fn set_config_block(&self, dcb: NativeDcb) {
        self.with(|dev| dev.dcb = dcb)
    }

    /// The mask last set with `SetCommMask`.
    pub fn comm_mask(&self) -> u32 {
        self.with(|dev| dev.comm_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::{FILE_FLAG_OVERLAPPED, WAIT_OBJECT_0};

    fn open(sim: &Sim, path: &str, flags: u32) -> Captured<RawHandle> {
        sim.create_file(path, GENERIC_READ | GENERIC_WRITE, 0, OPEN_EXISTING, flags)
    }

    #[test]
    fn last_error_is_captured_per_call() {
        let sim = Sim::new();
        sim.add_device("COM1");

        let missing = open(&sim, r"\\.\COM7", 0);
        assert!(missing.value.is_invalid());
        assert_eq!(missing.last_error, ErrorCode::FILE_NOT_FOUND);

        // The next call overwrites the thread's code, the captured one stays.
        let ok = open(&sim, r"\\.\COM1", 0);
        assert!(!ok.value.is_invalid());
        assert_eq!(ok.last_error, ErrorCode::SUCCESS);
        assert_eq!(missing.last_error, ErrorCode::FILE_NOT_FOUND);
    }

    #[test]
    fn device_names_are_normalized() {
        assert_eq!(device_name(r"\\.\com3"), "COM3");
        assert_eq!(device_name("COM10"), "COM10");
    }

    #[test]
    fn named_events_are_shared() {
        let sim = Sim::new();
        let a = sim.create_event(true, false, Some("ready"));
        let b = sim.create_event(true, false, Some("ready"));
        assert_eq!(b.last_error, ErrorCode::ALREADY_EXISTS);
        assert!(sim.set_event(a.value).value);
        assert_eq!(sim.wait_for_single_object(b.value, 0).value, WAIT_OBJECT_0);
    }

    #[test]
    fn immediate_write_completes_in_call() {
        let sim = Sim::new();
        let dev = sim.add_device("COM2");
        dev.set_completion(Completion::Immediate);
        let h = open(&sim, "COM2", FILE_FLAG_OVERLAPPED).value;
        let ev = sim.create_event(true, false, None).value;

        let mut ov = RawOverlapped {
            event: ev.as_raw(),
            ..RawOverlapped::default()
        };
        let data = b"ping";
        let r = unsafe { sim.write_file(h, data.as_ptr(), 4, &mut ov) };
        assert!(r.value.ok);
        assert_eq!(r.value.bytes, 4);
        assert_eq!(ov.internal_high, 4);
        assert_eq!(dev.take_written(), b"ping");
    }

    #[test]
    fn rejects_invalid_blocks() {
        let mut dcb = default_dcb();
        assert!(valid_dcb(&dcb));
        dcb.byte_size = 9;
        assert!(!valid_dcb(&dcb));
        dcb.byte_size = 5;
        dcb.stop_bits = 2;
        assert!(!valid_dcb(&dcb));
        dcb.stop_bits = 1;
        assert!(valid_dcb(&dcb));
    }

    #[test]
    fn registry_reports_more_data() {
        let sim = Sim::new();
        sim.add_device("COM4");
        let key = sim.reg_open_key(RegRoot::LocalMachine, SERIALCOMM_KEY, 0).value;
        let mut name = [0u8; 4];
        let mut data = [0u8; 64];
        let r = sim.reg_enum_value(key, 0, &mut name, &mut data);
        assert_eq!(r.last_error, ErrorCode::MORE_DATA);
    }
}

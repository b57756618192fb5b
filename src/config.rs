//! Line configuration and its native block codec.
//!
//! [`LineConfig`] is the typed form of the `DCB` block. Every native field maps
//! to exactly one `LineConfig` field, and the bits the OS reserves are carried
//! in [`Reserved`] so that a read, modify, write cycle hands them back
//! unchanged.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sys::NativeDcb;

const F_BINARY: u32 = 1 << 0;
const F_PARITY: u32 = 1 << 1;
const F_OUTX_CTS_FLOW: u32 = 1 << 2;
const F_OUTX_DSR_FLOW: u32 = 1 << 3;
const DTR_SHIFT: u32 = 4;
const F_DSR_SENSITIVITY: u32 = 1 << 6;
const F_TX_CONTINUE_ON_XOFF: u32 = 1 << 7;
const F_OUTX: u32 = 1 << 8;
const F_INX: u32 = 1 << 9;
const F_ERROR_CHAR: u32 = 1 << 10;
const F_NULL: u32 = 1 << 11;
const RTS_SHIFT: u32 = 12;
const F_ABORT_ON_ERROR: u32 = 1 << 14;
const DUMMY2_SHIFT: u32 = 15;
const DUMMY2_MASK: u32 = 0x1_FFFF;

/// Size in bytes of the native configuration block.
pub fn size_of_config_block() -> usize {
    NativeDcb::SIZE as usize
}

/// Parity scheme.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
    /// Parity bit always set
    Mark,
    /// Parity bit always clear
    Space,
}

impl Parity {
    fn to_native(self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Odd => 1,
            Parity::Even => 2,
            Parity::Mark => 3,
            Parity::Space => 4,
        }
    }

    fn from_native(v: u8) -> Result<Parity> {
        Ok(match v {
            0 => Parity::None,
            1 => Parity::Odd,
            2 => Parity::Even,
            3 => Parity::Mark,
            4 => Parity::Space,
            _ => return Err(decode_error("Parity", v)),
        })
    }
}

/// Stop bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    /// One stop bit
    One,
    /// One and a half stop bits
    OnePointFive,
    /// Two stop bits
    Two,
}

impl StopBits {
    fn to_native(self) -> u8 {
        match self {
            StopBits::One => 0,
            StopBits::OnePointFive => 1,
            StopBits::Two => 2,
        }
    }

    fn from_native(v: u8) -> Result<StopBits> {
        Ok(match v {
            0 => StopBits::One,
            1 => StopBits::OnePointFive,
            2 => StopBits::Two,
            _ => return Err(decode_error("StopBits", v)),
        })
    }
}

/// Behavior of the DTR line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtrControl {
    /// Held low
    Disable,
    /// Held high
    Enable,
    /// Used for handshaking
    Handshake,
}

/// Behavior of the RTS line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtsControl {
    /// Held low
    Disable,
    /// Held high
    Enable,
    /// Used for handshaking
    Handshake,
    /// High while bytes are queued for transmission
    Toggle,
}

/// Boolean switches of the line.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct LineFlags {
    /// Binary mode; the OS supports nothing else
    pub binary: bool,
    /// Check parity on received bytes
    pub parity_check: bool,
    /// Suspend output while CTS is low
    pub cts_out_flow: bool,
    /// Suspend output while DSR is low
    pub dsr_out_flow: bool,
    /// Ignore received bytes while DSR is low
    pub dsr_sensitivity: bool,
    /// Keep transmitting after sending XOFF
    pub tx_continue_on_xoff: bool,
    /// Honor XON/XOFF on output
    pub xon_xoff_out: bool,
    /// Send XON/XOFF on input
    pub xon_xoff_in: bool,
    /// Replace bytes with parity errors by the error character
    pub error_char_replace: bool,
    /// Discard received NUL bytes
    pub null_strip: bool,
    /// Abort transfers when an error occurs
    pub abort_on_error: bool,
}

/// Special characters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlChars {
    /// XON character
    pub xon: u8,
    /// XOFF character
    pub xoff: u8,
    /// Replacement for bytes received with a parity error
    pub error: u8,
    /// End of input
    pub eof: u8,
    /// Character signaling an event
    pub event: u8,
}

/// Native bits without a typed meaning, passed through untouched.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Reserved {
    /// The 17 bits above the flag fields
    pub dummy2: u32,
    /// The `wReserved` word
    pub w_reserved: u16,
    /// The `wReserved1` word
    pub w_reserved1: u16,
}

/// Line parameters of a serial device.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits per byte, 4 to 8
    pub byte_size: u8,
    /// Parity scheme
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Boolean switches
    #[serde(default)]
    pub flags: LineFlags,
    /// DTR line behavior
    pub dtr_control: DtrControl,
    /// RTS line behavior
    pub rts_control: RtsControl,
    /// Special characters
    #[serde(default)]
    pub chars: ControlChars,
    /// Free bytes in the input buffer below which XON is sent
    pub xon_limit: u16,
    /// Used bytes in the input buffer above which XOFF is sent
    pub xoff_limit: u16,
    /// Bits reserved by the OS
    #[serde(default)]
    pub reserved: Reserved,
}

impl Default for LineConfig {
    fn default() -> LineConfig {
        LineConfig {
            baud_rate: 9600,
            byte_size: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flags: LineFlags {
                binary: true,
                ..LineFlags::default()
            },
            dtr_control: DtrControl::Enable,
            rts_control: RtsControl::Enable,
            chars: ControlChars {
                xon: 0x11,
                xoff: 0x13,
                ..ControlChars::default()
            },
            xon_limit: 2048,
            xoff_limit: 512,
            reserved: Reserved::default(),
        }
    }
}

fn decode_error<T: Into<u32>>(field: &'static str, value: T) -> Error {
    Error::Decode {
        field,
        value: value.into(),
    }
}

fn bit(bits: u32, flag: u32) -> bool {
    bits & flag != 0
}

impl LineConfig {
    /// Reads a native block.
    ///
    /// Fails with [`Error::Decode`] when a field holds a value the OS does not
    /// define.
    pub fn decode(dcb: &NativeDcb) -> Result<LineConfig> {
        let bits = dcb.bits;
        if !(4..=8).contains(&dcb.byte_size) {
            return Err(decode_error("ByteSize", dcb.byte_size));
        }
        let dtr_control = match (bits >> DTR_SHIFT) & 0b11 {
            0 => DtrControl::Disable,
            1 => DtrControl::Enable,
            2 => DtrControl::Handshake,
            v => return Err(decode_error("fDtrControl", v)),
        };
        let rts_control = match (bits >> RTS_SHIFT) & 0b11 {
            0 => RtsControl::Disable,
            1 => RtsControl::Enable,
            2 => RtsControl::Handshake,
            _ => RtsControl::Toggle,
        };
        Ok(LineConfig {
            baud_rate: dcb.baud_rate,
            byte_size: dcb.byte_size,
            parity: Parity::from_native(dcb.parity)?,
            stop_bits: StopBits::from_native(dcb.stop_bits)?,
            flags: LineFlags {
                binary: bit(bits, F_BINARY),
                parity_check: bit(bits, F_PARITY),
                cts_out_flow: bit(bits, F_OUTX_CTS_FLOW),
                dsr_out_flow: bit(bits, F_OUTX_DSR_FLOW),
                dsr_sensitivity: bit(bits, F_DSR_SENSITIVITY),
                tx_continue_on_xoff: bit(bits, F_TX_CONTINUE_ON_XOFF),
                xon_xoff_out: bit(bits, F_OUTX),
                xon_xoff_in: bit(bits, F_INX),
                error_char_replace: bit(bits, F_ERROR_CHAR),
                null_strip: bit(bits, F_NULL),
                abort_on_error: bit(bits, F_ABORT_ON_ERROR),
            },
            dtr_control,
            rts_control,
            chars: ControlChars {
                xon: dcb.xon_char,
                xoff: dcb.xoff_char,
                error: dcb.error_char,
                eof: dcb.eof_char,
                event: dcb.evt_char,
            },
            xon_limit: dcb.xon_lim,
            xoff_limit: dcb.xoff_lim,
            reserved: Reserved {
                dummy2: (bits >> DUMMY2_SHIFT) & DUMMY2_MASK,
                w_reserved: dcb.w_reserved,
                w_reserved1: dcb.w_reserved1,
            },
        })
    }

    /// Builds the native block.
    ///
    /// Fails with [`Error::InvalidConfig`] for values the block cannot carry.
    pub fn encode(&self) -> Result<NativeDcb> {
        if !(4..=8).contains(&self.byte_size) {
            return Err(Error::InvalidConfig(format!(
                "byte size {} outside 4..=8",
                self.byte_size
            )));
        }
        if self.reserved.dummy2 & !DUMMY2_MASK != 0 {
            return Err(Error::InvalidConfig(format!(
                "reserved bits {:#x} exceed 17 bits",
                self.reserved.dummy2
            )));
        }

        let f = &self.flags;
        let mut bits = 0;
        let switches = [
            (f.binary, F_BINARY),
            (f.parity_check, F_PARITY),
            (f.cts_out_flow, F_OUTX_CTS_FLOW),
            (f.dsr_out_flow, F_OUTX_DSR_FLOW),
            (f.dsr_sensitivity, F_DSR_SENSITIVITY),
            (f.tx_continue_on_xoff, F_TX_CONTINUE_ON_XOFF),
            (f.xon_xoff_out, F_OUTX),
            (f.xon_xoff_in, F_INX),
            (f.error_char_replace, F_ERROR_CHAR),
            (f.null_strip, F_NULL),
            (f.abort_on_error, F_ABORT_ON_ERROR),
        ];
        for &(on, flag) in switches.iter() {
            if on {
                bits |= flag;
            }
        }
        let dtr = match self.dtr_control {
            DtrControl::Disable => 0,
            DtrControl::Enable => 1,
            DtrControl::Handshake => 2,
        };
        let rts = match self.rts_control {
            RtsControl::Disable => 0,
            RtsControl::Enable => 1,
            RtsControl::Handshake => 2,
            RtsControl::Toggle => 3,
        };
        bits |= dtr << DTR_SHIFT;
        bits |= rts << RTS_SHIFT;
        bits |= self.reserved.dummy2 << DUMMY2_SHIFT;

        Ok(NativeDcb {
            dcb_length: NativeDcb::SIZE,
            baud_rate: self.baud_rate,
            bits,
            w_reserved: self.reserved.w_reserved,
            xon_lim: self.xon_limit,
            xoff_lim: self.xoff_limit,
            byte_size: self.byte_size,
            parity: self.parity.to_native(),
            stop_bits: self.stop_bits.to_native(),
            xon_char: self.chars.xon,
            xoff_char: self.chars.xoff,
            error_char: self.chars.error,
            eof_char: self.chars.eof,
            evt_char: self.chars.event,
            w_reserved1: self.reserved.w_reserved1,
        })
    }
}

//! High level port settings and the configuration file format.

use std::convert::TryFrom;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{DtrControl, LineConfig, Parity, RtsControl, StopBits};
use crate::error::{Error, Result};

/// Data bits per character.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataBits {
    /// 5 bits
    #[serde(rename = "5")]
    Five,
    /// 6 bits
    #[serde(rename = "6")]
    Six,
    /// 7 bits
    #[serde(rename = "7")]
    Seven,
    /// 8 bits
    #[serde(rename = "8")]
    Eight,
}

impl DataBits {
    /// Number of bits.
    pub fn bits(self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

/// Flow control scheme.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    /// No flow control
    None,
    /// RTS/CTS on input
    RtsCtsIn,
    /// RTS/CTS on output
    RtsCtsOut,
    /// RTS/CTS on input and output
    RtsCtsInOut,
    /// XON/XOFF on input
    XonXoffIn,
    /// XON/XOFF on output
    XonXoffOut,
    /// XON/XOFF on input and output
    XonXoffInOut,
}

/// Settings a port is opened with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: DataBits,
    /// Parity
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Flow control
    pub flow_control: FlowControl,
    /// RTS level when RTS is not used for flow control
    pub rts: bool,
    /// DTR level
    pub dtr: bool,
}

impl Default for PortSettings {
    fn default() -> PortSettings {
        PortSettings {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            rts: true,
            dtr: true,
        }
    }
}

impl PortSettings {
    /// Settings with the given baud rate and defaults otherwise.
    pub fn new(baud_rate: u32) -> PortSettings {
        PortSettings {
            baud_rate,
            ..PortSettings::default()
        }
    }

    /// Rejects combinations serial hardware cannot produce.
    pub fn validate(&self) -> Result<()> {
        match (self.data_bits, self.stop_bits) {
            (DataBits::Five, StopBits::Two) => Err(Error::InvalidConfig(
                "2 stop bits cannot be used with 5 data bits".into(),
            )),
            (DataBits::Five, _) => Ok(()),
            (_, StopBits::OnePointFive) => Err(Error::InvalidConfig(
                "1.5 stop bits require 5 data bits".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Writes these settings into `config`, leaving fields without a
    /// setting, including the reserved bits, as they are.
    pub fn apply(&self, config: &mut LineConfig) -> Result<()> {
        self.validate()?;

        config.baud_rate = self.baud_rate;
        config.byte_size = self.data_bits.bits();
        config.stop_bits = self.stop_bits;
        config.parity = self.parity;

        config.dtr_control = if self.dtr {
            DtrControl::Enable
        } else {
            DtrControl::Disable
        };
        config.rts_control = if self.rts {
            RtsControl::Enable
        } else {
            RtsControl::Disable
        };

        let flags = &mut config.flags;
        flags.cts_out_flow = false;
        flags.xon_xoff_out = false;
        flags.xon_xoff_in = false;
        match self.flow_control {
            FlowControl::None => {}
            FlowControl::RtsCtsIn => config.rts_control = RtsControl::Handshake,
            FlowControl::RtsCtsOut => flags.cts_out_flow = true,
            FlowControl::RtsCtsInOut => {
                config.rts_control = RtsControl::Handshake;
                flags.cts_out_flow = true;
            }
            FlowControl::XonXoffIn => flags.xon_xoff_in = true,
            FlowControl::XonXoffOut => flags.xon_xoff_out = true,
            FlowControl::XonXoffInOut => {
                flags.xon_xoff_in = true;
                flags.xon_xoff_out = true;
            }
        }

        flags.dsr_out_flow = false;
        flags.dsr_sensitivity = false;
        flags.tx_continue_on_xoff = true;
        flags.error_char_replace = false;
        flags.null_strip = false;
        flags.abort_on_error = false;
        config.xon_limit = 2048;
        config.xoff_limit = 512;
        config.chars.xon = 0x11;
        config.chars.xoff = 0x13;
        Ok(())
    }
}

impl From<serialport::DataBits> for DataBits {
    fn from(bits: serialport::DataBits) -> DataBits {
        match bits {
            serialport::DataBits::Five => DataBits::Five,
            serialport::DataBits::Six => DataBits::Six,
            serialport::DataBits::Seven => DataBits::Seven,
            serialport::DataBits::Eight => DataBits::Eight,
        }
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> serialport::DataBits {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

impl From<serialport::Parity> for Parity {
    fn from(parity: serialport::Parity) -> Parity {
        match parity {
            serialport::Parity::None => Parity::None,
            serialport::Parity::Odd => Parity::Odd,
            serialport::Parity::Even => Parity::Even,
        }
    }
}

impl TryFrom<Parity> for serialport::Parity {
    type Error = Error;

    fn try_from(parity: Parity) -> Result<serialport::Parity> {
        match parity {
            Parity::None => Ok(serialport::Parity::None),
            Parity::Odd => Ok(serialport::Parity::Odd),
            Parity::Even => Ok(serialport::Parity::Even),
            other => Err(Error::InvalidConfig(format!(
                "{:?} parity has no serialport equivalent",
                other
            ))),
        }
    }
}

impl From<serialport::StopBits> for StopBits {
    fn from(bits: serialport::StopBits) -> StopBits {
        match bits {
            serialport::StopBits::One => StopBits::One,
            serialport::StopBits::Two => StopBits::Two,
        }
    }
}

impl TryFrom<StopBits> for serialport::StopBits {
    type Error = Error;

    fn try_from(bits: StopBits) -> Result<serialport::StopBits> {
        match bits {
            StopBits::One => Ok(serialport::StopBits::One),
            StopBits::Two => Ok(serialport::StopBits::Two),
            StopBits::OnePointFive => Err(Error::InvalidConfig(
                "1.5 stop bits have no serialport equivalent".into(),
            )),
        }
    }
}

impl From<serialport::FlowControl> for FlowControl {
    fn from(flow: serialport::FlowControl) -> FlowControl {
        match flow {
            serialport::FlowControl::None => FlowControl::None,
            serialport::FlowControl::Software => FlowControl::XonXoffInOut,
            serialport::FlowControl::Hardware => FlowControl::RtsCtsInOut,
        }
    }
}

impl TryFrom<FlowControl> for serialport::FlowControl {
    type Error = Error;

    fn try_from(flow: FlowControl) -> Result<serialport::FlowControl> {
        match flow {
            FlowControl::None => Ok(serialport::FlowControl::None),
            FlowControl::XonXoffInOut => Ok(serialport::FlowControl::Software),
            FlowControl::RtsCtsInOut => Ok(serialport::FlowControl::Hardware),
            other => Err(Error::InvalidConfig(format!(
                "one-directional flow control {:?} has no serialport equivalent",
                other
            ))),
        }
    }
}

/// Timeouts of the [`SerialPort`](crate::SerialPort) facade.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// How long one wait for incoming data lasts before it is repeated
    pub read_ms: u32,
    /// How long a write may take
    pub write_ms: u32,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            read_ms: 100,
            write_ms: 2000,
        }
    }
}

impl Timeouts {
    /// Read timeout as a duration.
    pub fn read(&self) -> Duration {
        Duration::from_millis(u64::from(self.read_ms))
    }

    /// Write timeout as a duration.
    pub fn write(&self) -> Duration {
        Duration::from_millis(u64::from(self.write_ms))
    }
}

/// A port to open and how, as stored in a TOML file.
///
/// ```toml
/// port = "COM3"
///
/// [settings]
/// baud_rate = 115200
/// flow_control = "rts_cts_in_out"
///
/// [timeouts]
/// write_ms = 500
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Port name such as `COM3`
    pub port: String,
    /// Line settings
    #[serde(default)]
    pub settings: PortSettings,
    /// Facade timeouts
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl PortConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<PortConfig> {
        let config: PortConfig = toml::from_str(s)?;
        config.settings.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<PortConfig> {
        let text = fs::read_to_string(path)?;
        PortConfig::from_toml_str(&text)
    }
}

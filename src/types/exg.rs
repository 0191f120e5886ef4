//! ExG (ECG/EMG) front-end configuration registers.
//!
//! Each of the two analog front-end chips exposes a ten-byte register block.
//! This module decodes the fields the host cares about: data rate, per
//! channel gain and multiplexer, powerdown bits and the right-leg-drive
//! configuration.

use crate::error::{DriverError, Result};
use crate::types::channel::ChannelType;

/// Length of one register block on the wire.
pub const EXG_REGISTER_LEN: usize = 10;

/// Input multiplexer setting of one ExG channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExgMux {
    Normal,
    Shorted,
    RldMeasure,
    Mvdd,
    TempSensor,
    TestSignal,
    RldDrp,
    RldDrm,
    RldDrpm,
    Input3,
    Reserved,
}

impl ExgMux {
    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0x00 => Ok(ExgMux::Normal),
            0x01 => Ok(ExgMux::Shorted),
            0x02 => Ok(ExgMux::RldMeasure),
            0x03 => Ok(ExgMux::Mvdd),
            0x04 => Ok(ExgMux::TempSensor),
            0x05 => Ok(ExgMux::TestSignal),
            0x06 => Ok(ExgMux::RldDrp),
            0x07 => Ok(ExgMux::RldDrm),
            0x08 => Ok(ExgMux::RldDrpm),
            0x09 => Ok(ExgMux::Input3),
            0x0A => Ok(ExgMux::Reserved),
            other => Err(DriverError::protocol(format!("invalid ExG mux bits {other:#04x}"))),
        }
    }
}

/// Right-leg-drive input leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExgRldLead {
    Rld1P,
    Rld1N,
    Rld2P,
    Rld2N,
}

impl ExgRldLead {
    const fn mask(self) -> u8 {
        match self {
            ExgRldLead::Rld1P => 0x01,
            ExgRldLead::Rld1N => 0x02,
            ExgRldLead::Rld2P => 0x04,
            ExgRldLead::Rld2N => 0x08,
        }
    }
}

/// Right-leg-drive reference source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RldRef {
    External,
    Internal,
}

/// A decoded ten-byte ExG register block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExgRegister {
    raw: [u8; EXG_REGISTER_LEN],
}

const PD_BIT: u8 = 0x80;
const RLD_PD_BIT: u8 = 0x20;

impl ExgRegister {
    pub fn new(raw: [u8; EXG_REGISTER_LEN]) -> Self {
        Self { raw }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; EXG_REGISTER_LEN] = bytes.try_into().map_err(|_| {
            DriverError::protocol(format!(
                "ExG register block must be {EXG_REGISTER_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(raw))
    }

    pub fn as_bytes(&self) -> &[u8; EXG_REGISTER_LEN] {
        &self.raw
    }

    fn ch_byte(&self, ch: usize) -> Result<u8> {
        if ch > 1 {
            return Err(DriverError::protocol(format!("ExG channel index {ch} out of range")));
        }
        Ok(self.raw[3 + ch])
    }

    /// Conversion rate in samples per second, `None` for the reserved
    /// register value.
    pub fn data_rate(&self) -> Option<u32> {
        match self.raw[0] & 0x07 {
            0 => Some(125),
            1 => Some(250),
            2 => Some(500),
            3 => Some(1000),
            4 => Some(2000),
            5 => Some(4000),
            6 => Some(8000),
            _ => None,
        }
    }

    /// Programmable gain of channel `ch` (0 or 1).
    pub fn gain(&self, ch: usize) -> Result<u8> {
        let bits = (self.ch_byte(ch)? & 0x70) >> 4;
        let gain = match bits {
            0 => 6,
            1 => 1,
            2 => 2,
            3 => 3,
            4 => 4,
            5 => 8,
            6 => 12,
            other => {
                return Err(DriverError::protocol(format!("invalid ExG gain bits {other:#04x}")));
            }
        };
        Ok(gain)
    }

    /// Input multiplexer of channel `ch` (0 or 1).
    pub fn mux(&self, ch: usize) -> Result<ExgMux> {
        ExgMux::from_bits(self.ch_byte(ch)? & 0x0F)
    }

    /// Whether channel `ch` (0 or 1) is powered down.
    pub fn is_powerdown(&self, ch: usize) -> Result<bool> {
        Ok(self.ch_byte(ch)? & PD_BIT != 0)
    }

    /// Whether the right-leg-drive buffer is powered down.
    pub fn rld_powerdown(&self) -> bool {
        self.raw[5] & RLD_PD_BIT == 0
    }

    /// Leads currently routed into the right-leg-drive amplifier.
    pub fn rld_leads(&self) -> Vec<ExgRldLead> {
        [ExgRldLead::Rld1P, ExgRldLead::Rld1N, ExgRldLead::Rld2P, ExgRldLead::Rld2N]
            .into_iter()
            .filter(|lead| self.raw[5] & lead.mask() != 0)
            .collect()
    }

    /// Right-leg-drive reference source.
    pub fn rld_ref(&self) -> RldRef {
        if (self.raw[9] >> 1) & 0x01 != 0 { RldRef::Internal } else { RldRef::External }
    }
}

/// Chip index (0 or 1) and channel index (0 or 1) that produced an ExG data
/// channel.
pub fn exg_chip_and_channel(ch: ChannelType) -> Option<(usize, usize)> {
    match ch {
        ChannelType::Exg1Ch1Hi | ChannelType::Exg1Ch1Lo => Some((0, 0)),
        ChannelType::Exg1Ch2Hi | ChannelType::Exg1Ch2Lo => Some((0, 1)),
        ChannelType::Exg2Ch1Hi | ChannelType::Exg2Ch1Lo => Some((1, 0)),
        ChannelType::Exg2Ch2Hi | ChannelType::Exg2Ch2Lo => Some((1, 1)),
        _ => None,
    }
}

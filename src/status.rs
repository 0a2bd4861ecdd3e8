//! Decoding of the composite `ps_status` word into semantic states.

use modular_bitfield::prelude::*;
use strum_macros::{EnumIter, IntoStaticStr};

/// Layout of the `ps_status` variable.
///
/// ```text
/// bits 0-3   operating state, see [`OpState`]
/// bit  4     open loop
/// bits 5-6   command interface
/// bit  7     active
/// bits 8-12  model id
/// bit  13    unlocked
/// bits 14-15 reserved
/// ```
#[bitfield(bits = 16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsStatus {
    pub state: B4,
    pub open_loop: bool,
    pub interface: B2,
    pub active: bool,
    pub model: B5,
    pub unlocked: bool,
    pub reserved: B2,
}

impl From<u16> for PsStatus {
    fn from(value: u16) -> Self {
        PsStatus::from_bytes(value.to_le_bytes())
    }
}

impl From<PsStatus> for u16 {
    fn from(value: PsStatus) -> Self {
        u16::from_le_bytes(value.into_bytes())
    }
}

/// "Operating state" field of the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, IntoStaticStr)]
#[repr(u8)]
pub enum OpState {
    Off = 0,
    Interlock = 1,
    Initializing = 2,
    SlowRef = 3,
    SlowRefSync = 4,
    Cycle = 5,
    RmpWfm = 6,
    MigWfm = 7,
    FastRef = 8,
}

impl OpState {
    pub const MAX_VALUE: u8 = Self::FastRef as u8;

    /// Modes a client may select with `OpMode-Sel`.
    pub fn selectable(&self) -> bool {
        !matches!(self, OpState::Off | OpState::Interlock | OpState::Initializing)
    }
}

impl TryFrom<u8> for OpState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use OpState as S;
        match value {
            0 => Ok(S::Off),
            1 => Ok(S::Interlock),
            2 => Ok(S::Initializing),
            3 => Ok(S::SlowRef),
            4 => Ok(S::SlowRefSync),
            5 => Ok(S::Cycle),
            6 => Ok(S::RmpWfm),
            7 => Ok(S::MigWfm),
            8 => Ok(S::FastRef),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum PowerState {
    Off,
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum CtrlLoop {
    Closed,
    Open,
}

/// Fully decoded status of one device.
///
/// Built in one step from the status word and the interlock registers of the
/// same scan, and replaced as a whole, so readers never see a partial decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub raw: u16,
    pub power: PowerState,
    /// `None` when the device reports a state outside the known range.
    pub op_mode: Option<OpState>,
    pub interlock_active: bool,
    pub ctrl_loop: CtrlLoop,
    pub interface: u8,
    pub active: bool,
    pub model_id: u8,
    pub unlocked: bool,
    pub soft_interlocks: u32,
    pub hard_interlocks: u32,
}

impl StatusSnapshot {
    pub fn decode(raw: u16, soft_interlocks: u32, hard_interlocks: u32) -> Self {
        let bits = PsStatus::from(raw);
        let op_mode = OpState::try_from(bits.state()).ok();
        let power = match op_mode {
            Some(OpState::Off) | Some(OpState::Interlock) => PowerState::Off,
            _ => PowerState::On,
        };
        Self {
            raw,
            power,
            op_mode,
            interlock_active: op_mode == Some(OpState::Interlock)
                || soft_interlocks != 0
                || hard_interlocks != 0,
            ctrl_loop: if bits.open_loop() {
                CtrlLoop::Open
            } else {
                CtrlLoop::Closed
            },
            interface: bits.interface(),
            active: bits.active(),
            model_id: bits.model(),
            unlocked: bits.unlocked(),
            soft_interlocks,
            hard_interlocks,
        }
    }
}

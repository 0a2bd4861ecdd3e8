//! Control-system properties and their mapping onto protocol entities.
//!
//! Each [`DeviceModel`] binds a subset of [`Property`] to variables, status
//! fields, functions or curves. Bindings are resolved by `match`, so adding a
//! model means adding arms here and nothing else.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::catalog::{DeviceModel, curve, func, var};
use crate::curve::{CurveBuildError, CurveUpload, CurveUploadBuilder, TriggerSpec};
use crate::error::WriteError;
use crate::mirror::{DeviceState, Value};
use crate::scaling::Scaling;
use crate::status::{OpState, StatusSnapshot};

/// Every property a device may expose.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr,
)]
pub enum Property {
    #[strum(serialize = "Current-Mon")]
    CurrentMon,
    #[strum(serialize = "Current-RB")]
    CurrentRb,
    #[strum(serialize = "CurrentRef-Mon")]
    CurrentRefMon,
    #[strum(serialize = "Current-SP")]
    CurrentSp,
    #[strum(serialize = "Status")]
    Status,
    #[strum(serialize = "PwrState-Sts")]
    PwrStateSts,
    #[strum(serialize = "PwrState-Sel")]
    PwrStateSel,
    #[strum(serialize = "OpMode-Sts")]
    OpModeSts,
    #[strum(serialize = "OpMode-Sel")]
    OpModeSel,
    #[strum(serialize = "CtrlLoop-Sts")]
    CtrlLoopSts,
    #[strum(serialize = "CtrlLoop-Sel")]
    CtrlLoopSel,
    #[strum(serialize = "Interlock-Mon")]
    InterlockMon,
    #[strum(serialize = "IntlkSoft-Mon")]
    IntlkSoftMon,
    #[strum(serialize = "IntlkHard-Mon")]
    IntlkHardMon,
    #[strum(serialize = "Reset-Cmd")]
    ResetCmd,
    #[strum(serialize = "LoadVoltage-Mon")]
    LoadVoltageMon,
    #[strum(serialize = "DCLinkVoltage-Mon")]
    DcLinkVoltageMon,
    #[strum(serialize = "SwitchesTemp-Mon")]
    SwitchesTempMon,
    #[strum(serialize = "WfmIndex-Mon")]
    WfmIndexMon,
    #[strum(serialize = "Version-Cte")]
    VersionCte,
    #[strum(serialize = "CycleAmpl-SP")]
    CycleAmplSp,
    #[strum(serialize = "CycleAmpl-RB")]
    CycleAmplRb,
    #[strum(serialize = "CycleFreq-SP")]
    CycleFreqSp,
    #[strum(serialize = "CycleFreq-RB")]
    CycleFreqRb,
    #[strum(serialize = "Wfm-SP")]
    WfmSp,
    #[strum(serialize = "Wfm-RB")]
    WfmRb,
    #[strum(serialize = "CapBankVoltage-Mon")]
    CapBankVoltageMon,
    #[strum(serialize = "DutyCycle-Mon")]
    DutyCycleMon,
}

impl Property {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Derived field of the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusField {
    Power,
    OpMode,
    CtrlLoop,
    Interlock,
}

/// How a readable property is obtained from the mirror.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadBinding {
    /// Numeric variable converted to engineering units.
    Variable { id: u8, scaling: Scaling },
    /// Integer variable reported as-is.
    Integer(u8),
    /// Byte variable reported as trimmed ASCII text.
    Text(u8),
    Status(StatusField),
    Curve(u8),
}

/// Highest cycle frequency accepted for the signal generator, in Hz.
pub const MAX_SIGGEN_FREQUENCY: f64 = 10_000.0;

/// Accepted engineering-unit range of a variable write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRange {
    /// `0` up to the largest magnitude the device's current limits allow.
    CurrentAmplitude,
    Fixed { low: f64, high: f64 },
}

impl ValueRange {
    fn bounds(self, limits: (f64, f64)) -> (f64, f64) {
        match self {
            ValueRange::CurrentAmplitude => (0.0, limits.0.abs().max(limits.1.abs())),
            ValueRange::Fixed { low, high } => (low, high),
        }
    }
}

/// How a writable property reaches the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteBinding {
    /// Float variable write.
    Variable {
        id: u8,
        scaling: Scaling,
        range: ValueRange,
    },
    /// Current setpoint, checked against the device's hard limits.
    Setpoint { function: u8 },
    /// Two-state selector mapped to a pair of functions.
    Toggle { off: u8, on: u8 },
    OpMode,
    /// Argument-less command.
    Command(u8),
    Curve(u8),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Binding {
    Read(ReadBinding),
    Write(WriteBinding),
}

impl Binding {
    /// Resolve `property` for `model`. `None` if the model lacks it.
    pub fn resolve(model: DeviceModel, property: Property) -> Option<Binding> {
        use Binding::{Read, Write};
        use Property as P;

        let float = |id| Read(ReadBinding::Variable { id, scaling: Scaling::IDENTITY });
        let binding = match property {
            P::CurrentMon => float(var::I_LOAD),
            P::CurrentRb => float(var::PS_SETPOINT),
            P::CurrentRefMon => float(var::PS_REFERENCE),
            P::CurrentSp => Write(WriteBinding::Setpoint {
                function: func::SET_SLOWREF,
            }),
            P::Status => Read(ReadBinding::Integer(var::PS_STATUS)),
            P::PwrStateSts => Read(ReadBinding::Status(StatusField::Power)),
            P::PwrStateSel => Write(WriteBinding::Toggle {
                off: func::TURN_OFF,
                on: func::TURN_ON,
            }),
            P::OpModeSts => Read(ReadBinding::Status(StatusField::OpMode)),
            P::OpModeSel => Write(WriteBinding::OpMode),
            P::CtrlLoopSts => Read(ReadBinding::Status(StatusField::CtrlLoop)),
            P::CtrlLoopSel => Write(WriteBinding::Toggle {
                off: func::CLOSED_LOOP,
                on: func::OPEN_LOOP,
            }),
            P::InterlockMon => Read(ReadBinding::Status(StatusField::Interlock)),
            P::IntlkSoftMon => Read(ReadBinding::Integer(var::INTLK_SOFT)),
            P::IntlkHardMon => Read(ReadBinding::Integer(var::INTLK_HARD)),
            P::ResetCmd => Write(WriteBinding::Command(func::RESET_INTERLOCKS)),
            P::LoadVoltageMon => float(var::V_LOAD),
            P::DcLinkVoltageMon => float(var::V_DCLINK),
            P::SwitchesTempMon => Read(ReadBinding::Variable {
                id: var::TEMP_SWITCHES,
                scaling: Scaling::CENTI,
            }),
            P::WfmIndexMon => Read(ReadBinding::Integer(var::WFMREF_INDEX)),
            P::VersionCte => Read(ReadBinding::Text(var::FIRMWARE_VERSION)),
            P::CycleAmplSp => Write(WriteBinding::Variable {
                id: var::SIGGEN_AMPLITUDE,
                scaling: Scaling::IDENTITY,
                range: ValueRange::CurrentAmplitude,
            }),
            P::CycleAmplRb => float(var::SIGGEN_AMPLITUDE),
            P::CycleFreqSp => Write(WriteBinding::Variable {
                id: var::SIGGEN_FREQUENCY,
                scaling: Scaling::IDENTITY,
                range: ValueRange::Fixed {
                    low: 0.0,
                    high: MAX_SIGGEN_FREQUENCY,
                },
            }),
            P::CycleFreqRb => float(var::SIGGEN_FREQUENCY),
            P::WfmSp => Write(WriteBinding::Curve(curve::WFM_REF)),
            P::WfmRb => Read(ReadBinding::Curve(curve::WFM_REF)),
            P::CapBankVoltageMon if model == DeviceModel::FacDcdc => float(var::V_CAPBANK),
            P::DutyCycleMon if model == DeviceModel::FacDcdc => float(var::DUTY_CYCLE),
            P::CapBankVoltageMon | P::DutyCycleMon => return None,
        };
        Some(binding)
    }
}

/// Value exchanged with the control system.
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    Float(f64),
    Int(i64),
    Enum { index: u16, label: &'static str },
    Text(String),
    Waveform(Vec<f32>),
}

impl PvValue {
    /// Numeric view, used for setpoints and selector indices.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Float(v) => Some(*v),
            PvValue::Int(v) => Some(*v as f64),
            PvValue::Enum { index, .. } => Some(f64::from(*index)),
            PvValue::Text(_) | PvValue::Waveform(_) => None,
        }
    }

    fn as_index(&self) -> Option<u16> {
        match self {
            PvValue::Enum { index, .. } => Some(*index),
            PvValue::Int(v) => u16::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl From<f64> for PvValue {
    fn from(value: f64) -> Self {
        PvValue::Float(value)
    }
}

impl From<i64> for PvValue {
    fn from(value: i64) -> Self {
        PvValue::Int(value)
    }
}

impl From<Vec<f32>> for PvValue {
    fn from(value: Vec<f32>) -> Self {
        PvValue::Waveform(value)
    }
}

/// A property value taken from the mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: PvValue,
    /// When the underlying sample was received.
    pub timestamp: Instant,
    /// The device is not connected; the value is the last one received.
    pub stale: bool,
}

/// Translate a read binding against one consistent mirror view.
///
/// Returns `None` when the mirror holds no value for the binding yet.
pub fn translate_read(binding: ReadBinding, state: &DeviceState) -> Option<Reading> {
    let (value, timestamp) = match binding {
        ReadBinding::Variable { id, scaling } => {
            let sample = state.value(id)?;
            let raw = sample.value.as_f64()?;
            (PvValue::Float(scaling.raw_to_eng(raw)), sample.updated)
        }
        ReadBinding::Integer(id) => {
            let sample = state.value(id)?;
            let raw = match sample.value {
                Value::U8(v) => i64::from(v),
                Value::U16(v) => i64::from(v),
                Value::U32(v) => i64::from(v),
                _ => return None,
            };
            (PvValue::Int(raw), sample.updated)
        }
        ReadBinding::Text(id) => {
            let sample = state.value(id)?;
            let Value::Bytes(bytes) = &sample.value else {
                return None;
            };
            let text = String::from_utf8_lossy(bytes)
                .trim_end_matches(['\0', ' '])
                .to_string();
            (PvValue::Text(text), sample.updated)
        }
        ReadBinding::Status(field) => {
            let status = state.status?;
            let timestamp = state.value(var::PS_STATUS)?.updated;
            (status_value(field, &status), timestamp)
        }
        ReadBinding::Curve(id) => {
            let data = state.curves.get(&id)?;
            (PvValue::Waveform(data.points.clone()), data.updated)
        }
    };
    Some(Reading {
        value,
        timestamp,
        stale: false,
    })
}

fn status_value(field: StatusField, status: &StatusSnapshot) -> PvValue {
    match field {
        StatusField::Power => PvValue::Enum {
            index: status.power as u16,
            label: status.power.into(),
        },
        StatusField::OpMode => match status.op_mode {
            Some(mode) => PvValue::Enum {
                index: mode as u16,
                label: mode.into(),
            },
            None => PvValue::Enum {
                index: status.raw & 0x000F,
                label: "Unknown",
            },
        },
        StatusField::CtrlLoop => PvValue::Enum {
            index: status.ctrl_loop as u16,
            label: status.ctrl_loop.into(),
        },
        StatusField::Interlock => PvValue::Int(i64::from(status.interlock_active)),
    }
}

/// What the scan loop must do on the bus for a write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteAction {
    Variable { id: u8, value: Vec<u8> },
    Function { id: u8, args: Vec<u8> },
    Curve(CurveUpload),
}

/// Validate `value` for `binding` and build the bus action.
///
/// Nothing is enqueued when this fails.
pub fn translate_write(
    model: DeviceModel,
    limits: (f64, f64),
    property: Property,
    binding: WriteBinding,
    value: &PvValue,
) -> Result<WriteAction, WriteError> {
    let name = property.name();
    let invalid = |reason| WriteError::InvalidValue {
        property: name,
        reason,
    };
    let number = || {
        value
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or(invalid("expected a finite number"))
    };

    let action = match binding {
        WriteBinding::Variable { id, scaling, range } => {
            let eng = number()?;
            let (low, high) = range.bounds(limits);
            if eng < low || eng > high {
                return Err(WriteError::LimitExceeded {
                    property: name,
                    value: eng,
                    low,
                    high,
                });
            }
            let raw = scaling.eng_to_raw(eng) as f32;
            if !raw.is_finite() {
                return Err(invalid("value does not fit a 32-bit float"));
            }
            WriteAction::Variable {
                id,
                value: raw.to_le_bytes().to_vec(),
            }
        }
        WriteBinding::Setpoint { function } => {
            let setpoint = number()?;
            let (low, high) = limits;
            if setpoint < low || setpoint > high {
                return Err(WriteError::LimitExceeded {
                    property: name,
                    value: setpoint,
                    low,
                    high,
                });
            }
            WriteAction::Function {
                id: function,
                args: (setpoint as f32).to_le_bytes().to_vec(),
            }
        }
        WriteBinding::Toggle { off, on } => {
            let id = match value.as_index() {
                Some(0) => off,
                Some(1) => on,
                _ => return Err(invalid("expected 0 or 1")),
            };
            WriteAction::Function { id, args: Vec::new() }
        }
        WriteBinding::OpMode => {
            let mode = value
                .as_index()
                .and_then(|i| u8::try_from(i).ok())
                .and_then(|i| OpState::try_from(i).ok())
                .filter(OpState::selectable)
                .ok_or(invalid("not a selectable operating mode"))?;
            WriteAction::Function {
                id: func::SELECT_OP_MODE,
                args: (mode as u16).to_le_bytes().to_vec(),
            }
        }
        WriteBinding::Command(id) => WriteAction::Function { id, args: Vec::new() },
        WriteBinding::Curve(id) => {
            let PvValue::Waveform(points) = value else {
                return Err(invalid("expected a waveform"));
            };
            let curve = model
                .catalog()
                .curve(id)
                .ok_or(WriteError::UnknownProperty(name.to_string()))?;
            let (low, high) = limits;
            let upload = CurveUploadBuilder::new(curve, points.clone())
                .with_trigger(TriggerSpec::default())
                .with_limits(low, high)
                .build()
                .map_err(|err| match err {
                    CurveBuildError::OutOfLimits { value, .. } => WriteError::LimitExceeded {
                        property: name,
                        value,
                        low,
                        high,
                    },
                    CurveBuildError::ReadOnly => WriteError::ReadOnly(name),
                    CurveBuildError::Empty => invalid("waveform is empty"),
                    CurveBuildError::TooLong { .. } => invalid("waveform exceeds curve capacity"),
                    CurveBuildError::NotFinite { .. } => invalid("waveform has non-finite points"),
                    CurveBuildError::InvalidTrigger => invalid("invalid trigger"),
                })?;
            WriteAction::Curve(upload)
        }
    };
    Ok(action)
}

/// A validated write waiting for the drain phase.
#[derive(Debug)]
pub struct PendingWrite {
    /// Bus address of the target device.
    pub address: u8,
    pub property: Property,
    pub action: WriteAction,
    pub(crate) reply: Option<mpsc::Sender<Result<(), WriteError>>>,
}

impl PendingWrite {
    pub fn new(address: u8, property: Property, action: WriteAction) -> Self {
        Self {
            address,
            property,
            action,
            reply: None,
        }
    }

    /// Attach a ticket the caller can wait on.
    pub fn with_ticket(mut self) -> (Self, WriteTicket) {
        let (reply, ticket) = WriteTicket::channel();
        self.reply = Some(reply);
        (self, ticket)
    }

    /// Report the outcome to the caller, if it is waiting.
    pub(crate) fn finish(self, outcome: Result<(), WriteError>) {
        if let Some(reply) = self.reply {
            // The caller may have dropped its ticket.
            let _ = reply.send(outcome);
        }
    }
}

/// Handle to the outcome of an enqueued write.
#[derive(Debug)]
pub struct WriteTicket {
    outcome: mpsc::Receiver<Result<(), WriteError>>,
}

impl WriteTicket {
    pub(crate) fn channel() -> (mpsc::Sender<Result<(), WriteError>>, Self) {
        let (tx, outcome) = mpsc::channel();
        (tx, Self { outcome })
    }

    /// Block until the scan loop has executed (or rejected) the write.
    pub fn wait(self) -> Result<(), WriteError> {
        self.outcome.recv().unwrap_or(Err(WriteError::QueueClosed))
    }

    /// Like [`Self::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), WriteError>> {
        match self.outcome.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(WriteError::QueueClosed)),
        }
    }
}

//! Local cache of the last-known state of one device.
//!
//! Only the channel's scan loop updates a mirror (the mutators are
//! crate-private). Every update, including a whole group response and the
//! status snapshot derived from it, is applied under a single write lock, so
//! readers observe either the previous scan or the next one, never a mix.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use std::time::Instant;

use strum_macros::{Display, IntoStaticStr};

use crate::catalog::{DeviceModel, VarKind, var};
use crate::error::DecodeError;
use crate::status::StatusSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, IntoStaticStr)]
pub enum ConnectionState {
    /// Not yet heard from since start-up.
    #[default]
    Disconnected,
    Connected,
    /// Missed too many scans, or its channel faulted. Values are stale.
    TimedOut,
}

/// A decoded variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f32),
    U8(u8),
    U16(u16),
    U32(u32),
    Bytes(Vec<u8>),
    FloatArray(Vec<f32>),
}

impl Value {
    /// Decode `bytes` as `kind`. `None` if the length does not match.
    pub fn decode(kind: VarKind, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != kind.size() {
            return None;
        }
        let value = match kind {
            VarKind::Float => Value::Float(f32::from_le_bytes(bytes.try_into().ok()?)),
            VarKind::U8 => Value::U8(bytes[0]),
            VarKind::U16 | VarKind::Bitfield16 => Value::U16(u16::from_le_bytes(bytes.try_into().ok()?)),
            VarKind::U32 => Value::U32(u32::from_le_bytes(bytes.try_into().ok()?)),
            VarKind::Bytes(_) => Value::Bytes(bytes.to_vec()),
            VarKind::FloatArray(_) => Value::FloatArray(crate::curve::points_from_bytes(bytes)),
        };
        Some(value)
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::Float(v) => v.to_le_bytes().to_vec(),
            Value::U8(v) => vec![*v],
            Value::U16(v) => v.to_le_bytes().to_vec(),
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::Bytes(v) => v.clone(),
            Value::FloatArray(v) => v.iter().flat_map(|p| p.to_le_bytes()).collect(),
        }
    }

    /// Numeric view of scalar values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::U8(v) => Some(f64::from(*v)),
            Value::U16(v) => Some(f64::from(*v)),
            Value::U32(v) => Some(f64::from(*v)),
            Value::Bytes(_) | Value::FloatArray(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub value: Value,
    pub updated: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurveData {
    pub points: Vec<f32>,
    /// Index of the last block read back with data, `None` if every block was empty.
    pub last_block: Option<u16>,
    pub updated: Instant,
}

/// Everything known about one device at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    pub connection: ConnectionState,
    pub values: BTreeMap<u8, Sample>,
    pub status: Option<StatusSnapshot>,
    pub curves: BTreeMap<u8, CurveData>,
    /// Consecutive failed scans.
    pub missed_scans: u32,
    pub last_scan: Option<Instant>,
}

impl DeviceState {
    pub fn value(&self, id: u8) -> Option<&Sample> {
        self.values.get(&id)
    }

    fn u32_value(&self, id: u8) -> u32 {
        match self.values.get(&id).map(|s| &s.value) {
            Some(Value::U32(v)) => *v,
            _ => 0,
        }
    }
}

/// A connection state change caused by a mirror update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug)]
pub struct Mirror {
    model: DeviceModel,
    state: RwLock<DeviceState>,
}

impl Mirror {
    pub fn new(model: DeviceModel) -> Self {
        Self {
            model,
            state: RwLock::new(DeviceState::default()),
        }
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, DeviceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, DeviceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against a consistent view of the device.
    pub fn read<R>(&self, f: impl FnOnce(&DeviceState) -> R) -> R {
        f(&self.read_lock())
    }

    pub fn snapshot(&self) -> DeviceState {
        self.read_lock().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.read_lock().connection
    }

    pub fn status(&self) -> Option<StatusSnapshot> {
        self.read_lock().status
    }

    /// Store a group read response and mark the device connected.
    ///
    /// The payload is fully decoded before the lock is taken; a payload that
    /// does not match the group layout leaves the mirror untouched.
    pub(crate) fn apply_group(
        &self,
        group_id: u8,
        payload: &[u8],
    ) -> Result<Option<Transition>, DecodeError> {
        let variables = self
            .model
            .catalog()
            .group_variables(group_id)
            .ok_or(DecodeError::Malformed("unknown group"))?;
        let expected: usize = variables.iter().map(|v| v.kind.size()).sum();
        if payload.len() != expected {
            return Err(DecodeError::Malformed("group payload size"));
        }

        let now = Instant::now();
        let mut offset = 0;
        let mut decoded = Vec::with_capacity(variables.len());
        for variable in variables {
            let size = variable.kind.size();
            let value = Value::decode(variable.kind, &payload[offset..offset + size])
                .ok_or(DecodeError::Malformed("variable size"))?;
            decoded.push((variable.id, value));
            offset += size;
        }

        let mut state = self.write_lock();
        for (id, value) in decoded {
            state.values.insert(id, Sample { value, updated: now });
        }
        let raw_status = match state.values.get(&var::PS_STATUS).map(|s| &s.value) {
            Some(Value::U16(raw)) => Some(*raw),
            _ => None,
        };
        if let Some(raw) = raw_status {
            let soft = state.u32_value(var::INTLK_SOFT);
            let hard = state.u32_value(var::INTLK_HARD);
            state.status = Some(StatusSnapshot::decode(raw, soft, hard));
        }
        state.missed_scans = 0;
        state.last_scan = Some(now);
        Ok(set_connection(&mut state, ConnectionState::Connected))
    }

    /// Store a single variable read.
    pub(crate) fn apply_variable(&self, id: u8, payload: &[u8]) -> Result<(), DecodeError> {
        let variable = self
            .model
            .catalog()
            .variable(id)
            .ok_or(DecodeError::Malformed("unknown variable"))?;
        let value = Value::decode(variable.kind, payload)
            .ok_or(DecodeError::Malformed("variable size"))?;
        self.write_lock().values.insert(
            id,
            Sample {
                value,
                updated: Instant::now(),
            },
        );
        Ok(())
    }

    /// Count a failed scan. After `max_missed` in a row the device times out.
    pub(crate) fn record_miss(&self, max_missed: u32) -> Option<Transition> {
        let mut state = self.write_lock();
        state.missed_scans = state.missed_scans.saturating_add(1);
        if state.missed_scans >= max_missed {
            set_connection(&mut state, ConnectionState::TimedOut)
        } else {
            None
        }
    }

    /// Time out immediately, keeping the last values.
    pub(crate) fn mark_timed_out(&self) -> Option<Transition> {
        set_connection(&mut self.write_lock(), ConnectionState::TimedOut)
    }

    pub(crate) fn set_curve(&self, curve_id: u8, points: Vec<f32>, last_block: Option<u16>) {
        self.write_lock().curves.insert(
            curve_id,
            CurveData {
                points,
                last_block,
                updated: Instant::now(),
            },
        );
    }
}

fn set_connection(state: &mut DeviceState, to: ConnectionState) -> Option<Transition> {
    let from = state.connection;
    state.connection = to;
    (from != to).then_some(Transition { from, to })
}

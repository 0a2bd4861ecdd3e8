//! This module defines the addressable entities of each power supply model.
//!
//! Catalogs are static tables resolved once per device at start-up and shared
//! read-only between every scan thread.

use serde::Deserialize;
use strum_macros::{Display, EnumIter, EnumString};

/// Wire representation of a variable (or function argument).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// IEEE-754 single precision.
    Float,
    U8,
    U16,
    U32,
    /// Status word decoded by [`crate::status`].
    Bitfield16,
    /// Fixed-size byte block (e.g. firmware text).
    Bytes(usize),
    /// Fixed-size array of floats.
    FloatArray(usize),
}

impl VarKind {
    /// Size on the wire in bytes.
    pub const fn size(&self) -> usize {
        match *self {
            VarKind::U8 => 1,
            VarKind::U16 | VarKind::Bitfield16 => 2,
            VarKind::Float | VarKind::U32 => 4,
            VarKind::Bytes(len) => len,
            VarKind::FloatArray(len) => len * 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variable {
    pub id: u8,
    pub name: &'static str,
    pub kind: VarKind,
    pub access: Access,
}

impl Variable {
    const fn ro(id: u8, name: &'static str, kind: VarKind) -> Self {
        Self {
            id,
            name,
            kind,
            access: Access::ReadOnly,
        }
    }

    const fn rw(id: u8, name: &'static str, kind: VarKind) -> Self {
        Self {
            id,
            name,
            kind,
            access: Access::ReadWrite,
        }
    }

    pub fn writable(&self) -> bool {
        self.access == Access::ReadWrite
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Function {
    pub id: u8,
    pub name: &'static str,
    pub input: Option<VarKind>,
    pub output: Option<VarKind>,
}

impl Function {
    const fn new(id: u8, name: &'static str, input: Option<VarKind>) -> Self {
        Self {
            id,
            name,
            input,
            output: None,
        }
    }
}

/// Element type of a curve buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Float,
}

impl ElementKind {
    pub const fn size(&self) -> usize {
        match self {
            ElementKind::Float => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Curve {
    pub id: u8,
    pub name: &'static str,
    pub element: ElementKind,
    /// Bytes per block transfer.
    pub block_size: usize,
    pub blocks: u16,
    pub writable: bool,
}

impl Curve {
    /// Elements carried by one full block.
    pub const fn points_per_block(&self) -> usize {
        self.block_size / self.element.size()
    }

    /// Total elements the curve can hold.
    pub const fn capacity(&self) -> usize {
        self.points_per_block() * self.blocks as usize
    }
}

/// Ordered set of variables fetched by a single group read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Group {
    pub id: u8,
    pub variables: &'static [u8],
}

/// Reference to any catalog entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Variable(&'static Variable),
    Function(&'static Function),
    Curve(&'static Curve),
    Group(&'static Group),
}

/// Always-polled group. Every model defines it.
pub const FAST_GROUP: u8 = 0;
/// Full monitoring group, read every few cycles.
pub const FULL_GROUP: u8 = 1;
/// Function that arms triggered curve playback. Its argument is an encoded
/// [`crate::curve::TriggerSpec`].
pub const SYNC_PLAYBACK_FUNCTION: u8 = 10;

/// Variables every model exposes, by id.
pub mod var {
    /// __R__ - Firmware version, 16 ASCII bytes.
    pub const FIRMWARE_VERSION: u8 = 0;
    /// __R__ - Load current in amperes.
    pub const I_LOAD: u8 = 1;
    /// __R__ - Status word, see [`crate::status::PsStatus`].
    pub const PS_STATUS: u8 = 2;
    /// __R__ - Last accepted current setpoint.
    pub const PS_SETPOINT: u8 = 3;
    /// __R__ - Reference the control loop is tracking.
    pub const PS_REFERENCE: u8 = 4;
    /// __R__ - Soft interlock bit mask.
    pub const INTLK_SOFT: u8 = 5;
    /// __R__ - Hard interlock bit mask.
    pub const INTLK_HARD: u8 = 6;
    /// __R__ - Load voltage.
    pub const V_LOAD: u8 = 7;
    /// __R__ - DC link voltage.
    pub const V_DCLINK: u8 = 8;
    /// __R__ - Switch module temperature in centi-degrees Celsius.
    pub const TEMP_SWITCHES: u8 = 9;
    /// __R__ - Number of accepted slow reference updates.
    pub const COUNTER_SET_SLOWREF: u8 = 10;
    /// __R__ - Number of received sync pulses.
    pub const COUNTER_SYNC_PULSE: u8 = 11;
    /// __R__ - Current position inside the reference waveform.
    pub const WFMREF_INDEX: u8 = 12;
    /// __R/W__ - Signal generator amplitude in amperes.
    pub const SIGGEN_AMPLITUDE: u8 = 13;
    /// __R/W__ - Signal generator frequency in hertz.
    pub const SIGGEN_FREQUENCY: u8 = 14;
    /// __R__ - Capacitor bank voltage (DC/DC models only).
    pub const V_CAPBANK: u8 = 15;
    /// __R__ - PWM duty cycle in percent (DC/DC models only).
    pub const DUTY_CYCLE: u8 = 16;
}

/// Functions every model exposes, by id.
pub mod func {
    pub const TURN_ON: u8 = 0;
    pub const TURN_OFF: u8 = 1;
    pub const OPEN_LOOP: u8 = 2;
    pub const CLOSED_LOOP: u8 = 3;
    /// Argument: operating mode index as `u16`.
    pub const SELECT_OP_MODE: u8 = 4;
    pub const RESET_INTERLOCKS: u8 = 5;
    /// Argument: current setpoint as `f32`.
    pub const SET_SLOWREF: u8 = 6;
    pub const SYNC_PULSE: u8 = 7;
    pub const ENABLE_SIGGEN: u8 = 8;
    pub const DISABLE_SIGGEN: u8 = 9;
}

/// Curves every model exposes, by id.
pub mod curve {
    /// __R/W__ - Reference waveform played back on external triggers.
    pub const WFM_REF: u8 = 0;
}

use VarKind as K;

static COMMON_FUNCTIONS: [Function; 11] = [
    Function::new(func::TURN_ON, "turn_on", None),
    Function::new(func::TURN_OFF, "turn_off", None),
    Function::new(func::OPEN_LOOP, "open_loop", None),
    Function::new(func::CLOSED_LOOP, "closed_loop", None),
    Function::new(func::SELECT_OP_MODE, "select_op_mode", Some(K::U16)),
    Function::new(func::RESET_INTERLOCKS, "reset_interlocks", None),
    Function::new(func::SET_SLOWREF, "set_slowref", Some(K::Float)),
    Function::new(func::SYNC_PULSE, "sync_pulse", None),
    Function::new(func::ENABLE_SIGGEN, "enable_siggen", None),
    Function::new(func::DISABLE_SIGGEN, "disable_siggen", None),
    Function::new(
        SYNC_PLAYBACK_FUNCTION,
        "arm_sync_playback",
        Some(K::Bytes(crate::curve::TriggerSpec::WIRE_LEN)),
    ),
];

static FBP_VARIABLES: [Variable; 15] = [
    Variable::ro(var::FIRMWARE_VERSION, "firmware_version", K::Bytes(16)),
    Variable::ro(var::I_LOAD, "i_load", K::Float),
    Variable::ro(var::PS_STATUS, "ps_status", K::Bitfield16),
    Variable::ro(var::PS_SETPOINT, "ps_setpoint", K::Float),
    Variable::ro(var::PS_REFERENCE, "ps_reference", K::Float),
    Variable::ro(var::INTLK_SOFT, "intlk_soft", K::U32),
    Variable::ro(var::INTLK_HARD, "intlk_hard", K::U32),
    Variable::ro(var::V_LOAD, "v_load", K::Float),
    Variable::ro(var::V_DCLINK, "v_dclink", K::Float),
    Variable::ro(var::TEMP_SWITCHES, "temp_switches", K::U16),
    Variable::ro(var::COUNTER_SET_SLOWREF, "counter_set_slowref", K::U32),
    Variable::ro(var::COUNTER_SYNC_PULSE, "counter_sync_pulse", K::U32),
    Variable::ro(var::WFMREF_INDEX, "wfmref_index", K::U16),
    Variable::rw(var::SIGGEN_AMPLITUDE, "siggen_amplitude", K::Float),
    Variable::rw(var::SIGGEN_FREQUENCY, "siggen_frequency", K::Float),
];

static FBP_GROUPS: [Group; 2] = [
    Group {
        id: FAST_GROUP,
        variables: &[var::I_LOAD, var::PS_STATUS],
    },
    Group {
        id: FULL_GROUP,
        variables: &[
            var::I_LOAD,
            var::PS_STATUS,
            var::PS_SETPOINT,
            var::PS_REFERENCE,
            var::INTLK_SOFT,
            var::INTLK_HARD,
            var::V_LOAD,
            var::V_DCLINK,
            var::TEMP_SWITCHES,
            var::COUNTER_SET_SLOWREF,
            var::COUNTER_SYNC_PULSE,
            var::WFMREF_INDEX,
            var::SIGGEN_AMPLITUDE,
            var::SIGGEN_FREQUENCY,
        ],
    },
];

static FBP_CURVES: [Curve; 1] = [Curve {
    id: curve::WFM_REF,
    name: "wfm_ref",
    element: ElementKind::Float,
    block_size: 1024,
    blocks: 4,
    writable: true,
}];

static FAC_DCDC_VARIABLES: [Variable; 17] = [
    Variable::ro(var::FIRMWARE_VERSION, "firmware_version", K::Bytes(16)),
    Variable::ro(var::I_LOAD, "i_load", K::Float),
    Variable::ro(var::PS_STATUS, "ps_status", K::Bitfield16),
    Variable::ro(var::PS_SETPOINT, "ps_setpoint", K::Float),
    Variable::ro(var::PS_REFERENCE, "ps_reference", K::Float),
    Variable::ro(var::INTLK_SOFT, "intlk_soft", K::U32),
    Variable::ro(var::INTLK_HARD, "intlk_hard", K::U32),
    Variable::ro(var::V_LOAD, "v_load", K::Float),
    Variable::ro(var::V_DCLINK, "v_dclink", K::Float),
    Variable::ro(var::TEMP_SWITCHES, "temp_switches", K::U16),
    Variable::ro(var::COUNTER_SET_SLOWREF, "counter_set_slowref", K::U32),
    Variable::ro(var::COUNTER_SYNC_PULSE, "counter_sync_pulse", K::U32),
    Variable::ro(var::WFMREF_INDEX, "wfmref_index", K::U16),
    Variable::rw(var::SIGGEN_AMPLITUDE, "siggen_amplitude", K::Float),
    Variable::rw(var::SIGGEN_FREQUENCY, "siggen_frequency", K::Float),
    Variable::ro(var::V_CAPBANK, "v_capbank", K::Float),
    Variable::ro(var::DUTY_CYCLE, "duty_cycle", K::Float),
];

static FAC_DCDC_GROUPS: [Group; 2] = [
    Group {
        id: FAST_GROUP,
        variables: &[var::I_LOAD, var::PS_STATUS],
    },
    Group {
        id: FULL_GROUP,
        variables: &[
            var::I_LOAD,
            var::PS_STATUS,
            var::PS_SETPOINT,
            var::PS_REFERENCE,
            var::INTLK_SOFT,
            var::INTLK_HARD,
            var::V_LOAD,
            var::V_DCLINK,
            var::TEMP_SWITCHES,
            var::WFMREF_INDEX,
            var::SIGGEN_AMPLITUDE,
            var::SIGGEN_FREQUENCY,
            var::V_CAPBANK,
            var::DUTY_CYCLE,
        ],
    },
];

static FAC_DCDC_CURVES: [Curve; 1] = [Curve {
    id: curve::WFM_REF,
    name: "wfm_ref",
    element: ElementKind::Float,
    block_size: 1024,
    blocks: 16,
    writable: true,
}];

/// Entity description of one device model.
#[derive(Debug)]
pub struct Catalog {
    pub variables: &'static [Variable],
    pub functions: &'static [Function],
    pub curves: &'static [Curve],
    pub groups: &'static [Group],
}

static FBP: Catalog = Catalog {
    variables: &FBP_VARIABLES,
    functions: &COMMON_FUNCTIONS,
    curves: &FBP_CURVES,
    groups: &FBP_GROUPS,
};

static FAC_DCDC: Catalog = Catalog {
    variables: &FAC_DCDC_VARIABLES,
    functions: &COMMON_FUNCTIONS,
    curves: &FAC_DCDC_CURVES,
    groups: &FAC_DCDC_GROUPS,
};

impl Catalog {
    pub fn variable(&self, id: u8) -> Option<&'static Variable> {
        self.variables.iter().find(|v| v.id == id)
    }

    pub fn function(&self, id: u8) -> Option<&'static Function> {
        self.functions.iter().find(|f| f.id == id)
    }

    pub fn curve(&self, id: u8) -> Option<&'static Curve> {
        self.curves.iter().find(|c| c.id == id)
    }

    pub fn group(&self, id: u8) -> Option<&'static Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Variables of a group in wire order. Unknown ids are skipped.
    pub fn group_variables(&self, id: u8) -> Option<Vec<&'static Variable>> {
        let group = self.group(id)?;
        Some(
            group
                .variables
                .iter()
                .filter_map(|var_id| self.variable(*var_id))
                .collect(),
        )
    }

    /// Expected payload size of a group read response.
    pub fn group_size(&self, id: u8) -> Option<usize> {
        self.group_variables(id)
            .map(|vars| vars.iter().map(|v| v.kind.size()).sum())
    }
}

/// Every supported device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceModel {
    /// Low power four-quadrant supply used for correctors and trims.
    Fbp,
    /// High power DC/DC stage feeding dipoles and quadrupole families.
    FacDcdc,
}

impl DeviceModel {
    pub fn catalog(&self) -> &'static Catalog {
        match self {
            DeviceModel::Fbp => &FBP,
            DeviceModel::FacDcdc => &FAC_DCDC,
        }
    }

    /// Hard current limits in amperes, `(low, high)`.
    pub const fn current_limits(&self) -> (f64, f64) {
        match self {
            DeviceModel::Fbp => (-10.0, 10.0),
            DeviceModel::FacDcdc => (0.0, 1050.0),
        }
    }

    /// Look up an entity by kind and id.
    pub fn entity(&self, entity: EntityKind, id: u8) -> Option<Entity> {
        let catalog = self.catalog();
        match entity {
            EntityKind::Variable => catalog.variable(id).map(Entity::Variable),
            EntityKind::Function => catalog.function(id).map(Entity::Function),
            EntityKind::Curve => catalog.curve(id).map(Entity::Curve),
            EntityKind::Group => catalog.group(id).map(Entity::Group),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Variable,
    Function,
    Curve,
    Group,
}

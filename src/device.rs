//! One addressed power supply on a channel.

use std::sync::Arc;

use crate::catalog::DeviceModel;
use crate::error::{ReadError, WriteError};
use crate::mirror::{ConnectionState, Mirror};
use crate::property::{
    Binding, Property, PvValue, Reading, WriteAction, translate_read, translate_write,
};

/// A device as seen from the control system.
///
/// Reads are served from the [`Mirror`] only and never touch the bus. Writes
/// are validated here and handed to the channel's scan loop as a
/// [`WriteAction`].
#[derive(Debug)]
pub struct Device {
    pub name: String,
    /// Bus address. Default range is 1-254.
    pub address: u8,
    pub model: DeviceModel,
    /// Current limits `(low, high)` in amperes.
    pub limits: (f64, f64),
    mirror: Arc<Mirror>,
}

impl Device {
    /// Create a device using the model's default current limits.
    pub fn new(name: impl Into<String>, address: u8, model: DeviceModel) -> Self {
        Self {
            name: name.into(),
            address,
            model,
            limits: model.current_limits(),
            mirror: Arc::new(Mirror::new(model)),
        }
    }

    /// Override the current limits.
    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limits = (low, high);
        self
    }

    pub fn mirror(&self) -> &Arc<Mirror> {
        &self.mirror
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.mirror.connection_state()
    }

    /// Return the current value of `property`.
    ///
    /// When the device is not connected this fails with
    /// [`ReadError::Unavailable`], carrying the last known value marked stale.
    pub fn read(&self, property: Property) -> Result<Reading, ReadError> {
        let binding = match Binding::resolve(self.model, property) {
            Some(Binding::Read(binding)) => binding,
            Some(Binding::Write(_)) => return Err(ReadError::WriteOnly(property.name())),
            None => return Err(ReadError::UnknownProperty(property.name().to_string())),
        };
        self.mirror.read(|state| {
            let reading = translate_read(binding, state);
            match (state.connection, reading) {
                (ConnectionState::Connected, Some(reading)) => Ok(reading),
                (ConnectionState::Connected, None) => Err(ReadError::Unavailable { last: None }),
                (_, last) => Err(ReadError::Unavailable {
                    last: last.map(|reading| Reading {
                        stale: true,
                        ..reading
                    }),
                }),
            }
        })
    }

    /// Validate a write to `property` and build the bus action for it.
    ///
    /// Fails without side effects if the value is invalid or the device is
    /// not connected.
    pub fn prepare_write(
        &self,
        property: Property,
        value: &PvValue,
    ) -> Result<WriteAction, WriteError> {
        let binding = match Binding::resolve(self.model, property) {
            Some(Binding::Write(binding)) => binding,
            Some(Binding::Read(_)) => return Err(WriteError::ReadOnly(property.name())),
            None => return Err(WriteError::UnknownProperty(property.name().to_string())),
        };
        let action = translate_write(self.model, self.limits, property, binding, value)?;
        if self.connection_state() != ConnectionState::Connected {
            return Err(WriteError::DeviceUnavailable(self.name.clone()));
        }
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FAST_GROUP;
    use crate::status::StatusSnapshot;

    fn connected(current: f32, status: u16) -> Device {
        let device = Device::new("SI-01M1:PS-CH", 1, DeviceModel::Fbp).with_limits(-500.0, 500.0);
        let mut payload = current.to_le_bytes().to_vec();
        payload.extend_from_slice(&status.to_le_bytes());
        device.mirror().apply_group(FAST_GROUP, &payload).unwrap();
        device
    }

    #[test]
    fn reads_group_values() {
        let device = connected(1.234, 0x0001);

        let current = device.read(Property::CurrentMon).unwrap();
        assert_eq!(current.value, PvValue::Float(f64::from(1.234f32)));
        assert!(!current.stale);

        let status = device.read(Property::Status).unwrap();
        let PvValue::Int(raw) = status.value else {
            panic!("status is an integer");
        };
        assert!(StatusSnapshot::decode(raw as u16, 0, 0).interlock_active);
        assert_eq!(device.read(Property::InterlockMon).unwrap().value, PvValue::Int(1));
    }

    #[test]
    fn unscanned_value_is_unavailable() {
        let device = connected(0.0, 0);
        assert_eq!(
            device.read(Property::LoadVoltageMon),
            Err(ReadError::Unavailable { last: None })
        );
    }

    #[test]
    fn timed_out_device_returns_stale_value() {
        let device = connected(3.5, 0);
        device.mirror().mark_timed_out();

        let Err(ReadError::Unavailable { last: Some(last) }) = device.read(Property::CurrentMon)
        else {
            panic!("expected a stale reading");
        };
        assert!(last.stale);
        assert_eq!(last.value, PvValue::Float(3.5));
    }

    #[test]
    fn property_direction_is_checked() {
        let device = connected(0.0, 0);
        assert_eq!(
            device.read(Property::CurrentSp),
            Err(ReadError::WriteOnly("Current-SP"))
        );
        assert_eq!(
            device.prepare_write(Property::CurrentMon, &PvValue::Float(1.0)),
            Err(WriteError::ReadOnly("Current-Mon"))
        );
        assert!(matches!(
            device.read(Property::DutyCycleMon),
            Err(ReadError::UnknownProperty(_))
        ));
    }

    #[test]
    fn writes_need_a_connected_device() {
        let device = Device::new("ps", 2, DeviceModel::Fbp);
        assert_eq!(
            device.prepare_write(Property::CurrentSp, &PvValue::Float(1.0)),
            Err(WriteError::DeviceUnavailable("ps".into()))
        );
        // Limits are checked first.
        assert!(matches!(
            device.prepare_write(Property::CurrentSp, &PvValue::Float(99.0)),
            Err(WriteError::LimitExceeded { .. })
        ));
        assert_eq!(device.mirror().connection_state(), ConnectionState::Disconnected);
    }
}

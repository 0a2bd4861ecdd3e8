//! Process-wide entry point.
//!
//! A [`Facility`] owns one scan thread per configured channel and serves the
//! upward API. None of its methods wait on bus I/O: reads come from the
//! mirrors and writes are queued for the owning channel's drain phase.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::config::{ChannelConfig, Config};
use crate::device::Device;
use crate::error::{Error, ReadError, Result, WriteError};
use crate::mirror::ConnectionState;
use crate::property::{PendingWrite, Property, PvValue, Reading, WriteTicket};
use crate::scan::{LoopStats, ScanController};
use crate::status::StatusSnapshot;
use crate::transport::{BusTransport, Connect};
use crate::udc::Udc;

struct ChannelHandle {
    name: String,
    writes: mpsc::Sender<PendingWrite>,
    thread: Option<JoinHandle<LoopStats>>,
}

struct DeviceEntry {
    device: Arc<Device>,
    channel: usize,
}

pub struct Facility {
    channels: Vec<ChannelHandle>,
    devices: HashMap<String, DeviceEntry>,
    running: Arc<AtomicBool>,
}

impl Facility {
    /// Open every configured channel and start its scan loop.
    ///
    /// `connect` is called once per channel and yields the connector used to
    /// open the channel now and to reopen it after faults. If any channel
    /// fails to open, the loops already started are stopped again.
    pub fn start<F, C>(config: &Config, mut connect: F) -> Result<Self>
    where
        F: FnMut(&ChannelConfig) -> C,
        C: Connect + 'static,
    {
        config.validate()?;
        let mut facility = Facility {
            channels: Vec::with_capacity(config.channels.len()),
            devices: HashMap::new(),
            running: Arc::new(AtomicBool::new(true)),
        };
        for channel in &config.channels {
            if let Err(err) = facility.spawn_channel(config, channel, connect(channel)) {
                let _ = facility.stop();
                return Err(err);
            }
        }
        info!(
            "Facility started: {} channels, {} devices",
            facility.channels.len(),
            facility.devices.len()
        );
        Ok(facility)
    }

    fn spawn_channel<C: Connect + 'static>(
        &mut self,
        config: &Config,
        channel: &ChannelConfig,
        connector: C,
    ) -> Result<()> {
        let transport = BusTransport::open(connector).map_err(|source| Error::Connect {
            channel: channel.name.clone(),
            source,
        })?;
        let udc = Udc::new(
            channel.name.clone(),
            transport,
            config.scan.timeout(),
            config.scan.retries,
        );
        let devices: Vec<Arc<Device>> = channel
            .devices
            .iter()
            .map(|d| Arc::new(d.build()))
            .collect();
        let (writes, queue) = mpsc::channel();
        let mut scan = ScanController::new(
            udc,
            devices.clone(),
            queue,
            config.scan.clone(),
            Arc::clone(&self.running),
        );
        let thread = thread::Builder::new()
            .name(format!("scan-{}", channel.name))
            .spawn(move || scan.run())?;

        let index = self.channels.len();
        self.channels.push(ChannelHandle {
            name: channel.name.clone(),
            writes,
            thread: Some(thread),
        });
        for device in devices {
            self.devices.insert(
                device.name.clone(),
                DeviceEntry {
                    device,
                    channel: index,
                },
            );
        }
        Ok(())
    }

    pub fn device(&self, name: &str) -> Option<&Arc<Device>> {
        self.devices.get(name).map(|entry| &entry.device)
    }

    /// Names of every configured device, sorted.
    pub fn device_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.devices.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn read(&self, device: &str, property: &str) -> Result<Reading, ReadError> {
        let device = self
            .device(device)
            .ok_or_else(|| ReadError::UnknownDevice(device.to_string()))?;
        let property = property
            .parse::<Property>()
            .map_err(|_| ReadError::UnknownProperty(property.to_string()))?;
        device.read(property)
    }

    /// Validate and queue a write. Returns once the write is queued.
    pub fn write(&self, device: &str, property: &str, value: PvValue) -> Result<(), WriteError> {
        let (entry, write) = self.prepare(device, property, &value)?;
        self.enqueue(entry, write)
    }

    /// Like [`Self::write`], with a ticket for the drain-phase outcome.
    pub fn write_with_ticket(
        &self,
        device: &str,
        property: &str,
        value: PvValue,
    ) -> Result<WriteTicket, WriteError> {
        let (entry, write) = self.prepare(device, property, &value)?;
        let (write, ticket) = write.with_ticket();
        self.enqueue(entry, write)?;
        Ok(ticket)
    }

    fn prepare(
        &self,
        device: &str,
        property: &str,
        value: &PvValue,
    ) -> Result<(&DeviceEntry, PendingWrite), WriteError> {
        let entry = self
            .devices
            .get(device)
            .ok_or_else(|| WriteError::UnknownDevice(device.to_string()))?;
        let property = property
            .parse::<Property>()
            .map_err(|_| WriteError::UnknownProperty(property.to_string()))?;
        let action = entry.device.prepare_write(property, value)?;
        Ok((entry, PendingWrite::new(entry.device.address, property, action)))
    }

    fn enqueue(&self, entry: &DeviceEntry, write: PendingWrite) -> Result<(), WriteError> {
        self.channels[entry.channel]
            .writes
            .send(write)
            .map_err(|_| WriteError::QueueClosed)
    }

    pub fn connection_state(&self, device: &str) -> Result<ConnectionState, ReadError> {
        self.device(device)
            .map(|d| d.connection_state())
            .ok_or_else(|| ReadError::UnknownDevice(device.to_string()))
    }

    /// Decoded status of `device`, `None` until its status word was scanned.
    pub fn status(&self, device: &str) -> Result<Option<StatusSnapshot>, ReadError> {
        self.device(device)
            .map(|d| d.mirror().status())
            .ok_or_else(|| ReadError::UnknownDevice(device.to_string()))
    }

    /// Stop and join every scan loop.
    pub fn shutdown(mut self) -> Result<Vec<(String, LoopStats)>> {
        self.stop()
    }

    fn stop(&mut self) -> Result<Vec<(String, LoopStats)>> {
        self.running.store(false, Ordering::SeqCst);
        let mut stats = Vec::new();
        let mut panicked = None;
        for channel in &mut self.channels {
            let Some(thread) = channel.thread.take() else {
                continue;
            };
            match thread.join() {
                Ok(loop_stats) => stats.push((channel.name.clone(), loop_stats)),
                Err(_) => {
                    error!("Scan thread for '{}' panicked", channel.name);
                    panicked.get_or_insert_with(|| channel.name.clone());
                }
            }
        }
        match panicked {
            Some(name) => Err(Error::Panicked(name)),
            None => Ok(stats),
        }
    }
}

impl Drop for Facility {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use embedded_io::ErrorKind;

    use crate::catalog::{DeviceModel, func, var};
    use crate::codec::Command;
    use crate::error::TransportError;
    use crate::mock_bus::{MockBus, SimulatedPs};
    use crate::mirror::Value;

    const CONFIG: &str = r#"
[scan]
period_ms = 10
timeout_ms = 2
retries = 0
reinit_interval_ms = 20

[[channel]]
name = "SI1"
port = "mock"

[[channel.device]]
name = "ps-1"
address = 1
model = "fbp"
current_limits = { low = -5.0, high = 5.0 }

[[channel.device]]
name = "ps-2"
address = 2
model = "fbp"

[[channel]]
name = "SI2"
port = "mock"

[[channel.device]]
name = "dcdc"
address = 1
model = "fac_dcdc"
"#;

    struct Plant {
        si1: MockBus,
        si2: MockBus,
    }

    impl Plant {
        fn new() -> Self {
            let si1 = MockBus::new();
            si1.attach(SimulatedPs::new(1, DeviceModel::Fbp));
            si1.attach(SimulatedPs::new(2, DeviceModel::Fbp));
            let si2 = MockBus::new();
            si2.attach(SimulatedPs::new(1, DeviceModel::FacDcdc));
            Self { si1, si2 }
        }

        fn start(&self, config: &str) -> Facility {
            let config = Config::from_toml(config).unwrap();
            Facility::start(&config, |channel| {
                let bus = match channel.name.as_str() {
                    "SI1" => self.si1.clone(),
                    _ => self.si2.clone(),
                };
                move || Ok::<_, TransportError>(bus.clone())
            })
            .unwrap()
        }
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn connected(facility: &Facility) {
        for name in facility.device_names() {
            wait_until(name, || {
                facility.connection_state(name) == Ok(ConnectionState::Connected)
            });
        }
    }

    #[test]
    fn reads_and_writes_through_the_scan_loops() {
        let plant = Plant::new();
        plant.si1.with_device(1, |ps| ps.set_float(var::I_LOAD, 1.5));
        plant.si2.with_device(1, |ps| ps.set_float(var::V_CAPBANK, 400.0));
        let facility = plant.start(CONFIG);
        connected(&facility);

        assert_eq!(facility.device_names(), vec!["dcdc", "ps-1", "ps-2"]);
        assert_eq!(
            facility.read("ps-1", "Current-Mon").unwrap().value,
            PvValue::Float(1.5)
        );
        wait_until("full scan", || facility.read("dcdc", "CapBankVoltage-Mon").is_ok());
        assert_eq!(
            facility.read("dcdc", "CapBankVoltage-Mon").unwrap().value,
            PvValue::Float(400.0)
        );

        let ticket = facility
            .write_with_ticket("ps-1", "PwrState-Sel", PvValue::Int(1))
            .unwrap();
        assert_eq!(ticket.wait(), Ok(()));
        facility.write("ps-1", "Current-SP", PvValue::Float(2.5)).unwrap();
        wait_until("setpoint readback", || {
            facility.read("ps-1", "Current-Mon").map(|r| r.value) == Ok(PvValue::Float(2.5))
        });
        let status = facility.status("ps-1").unwrap().unwrap();
        assert_eq!(status.power, crate::status::PowerState::On);

        // Each channel is scanned on its own bus.
        assert!(plant.si2.requests_to(2).is_empty());
        facility.shutdown().unwrap();
    }

    #[test]
    fn unknown_names() {
        let plant = Plant::new();
        let facility = plant.start(CONFIG);
        assert_eq!(
            facility.read("nope", "Current-Mon"),
            Err(ReadError::UnknownDevice("nope".into()))
        );
        assert_eq!(
            facility.read("ps-1", "Current-XX"),
            Err(ReadError::UnknownProperty("Current-XX".into()))
        );
        assert!(matches!(
            facility.read("ps-1", "DutyCycle-Mon"),
            Err(ReadError::UnknownProperty(_))
        ));
        assert_eq!(
            facility.write("nope", "Current-SP", PvValue::Float(1.0)),
            Err(WriteError::UnknownDevice("nope".into()))
        );
        assert!(facility.connection_state("nope").is_err());
    }

    #[test]
    fn limit_violation_never_reaches_the_bus() {
        let plant = Plant::new();
        let facility = plant.start(CONFIG);
        connected(&facility);

        assert_eq!(
            facility.write("ps-1", "Current-SP", PvValue::Float(999.0)),
            Err(WriteError::LimitExceeded {
                property: "Current-SP",
                value: 999.0,
                low: -5.0,
                high: 5.0
            })
        );
        thread::sleep(Duration::from_millis(30));
        assert!(
            plant
                .si1
                .requests_to(1)
                .iter()
                .all(|frame| frame.command != Command::ExecuteFunction)
        );
    }

    #[test]
    fn concurrent_writers_share_the_channel() {
        let plant = Plant::new();
        let facility = Arc::new(plant.start(CONFIG));
        connected(&facility);

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let facility = Arc::clone(&facility);
                thread::spawn(move || {
                    let device = if writer % 2 == 0 { "ps-1" } else { "ps-2" };
                    let tickets: Vec<_> = (0..10)
                        .map(|i| {
                            let value = PvValue::Float(f64::from(i) * 0.25);
                            facility.write_with_ticket(device, "Current-SP", value).unwrap()
                        })
                        .collect();
                    tickets.into_iter().all(|t| t.wait().is_ok())
                })
            })
            .collect();
        for writer in writers {
            assert!(writer.join().unwrap());
        }

        for address in [1, 2] {
            let executed = plant.si1.with_device(address, |ps| ps.executed.clone());
            assert_eq!(executed.len(), 20);
            assert!(executed.iter().all(|(id, _)| *id == func::SET_SLOWREF));
        }
        assert_eq!(plant.si1.overlaps(), 0);
    }

    #[test]
    fn group_values_are_never_torn() {
        let plant = Plant::new();
        plant.si1.with_device(1, |ps| ps.ramp = true);
        let config = CONFIG.replace("period_ms = 10", "period_ms = 5\nfull_scan_every = 1");
        let facility = Arc::new(plant.start(&config));
        connected(&facility);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let facility = Arc::clone(&facility);
                thread::spawn(move || {
                    let device = facility.device("ps-1").unwrap();
                    let mut distinct = std::collections::BTreeSet::new();
                    let deadline = Instant::now() + Duration::from_millis(150);
                    while Instant::now() < deadline {
                        let values = device.mirror().read(|state| {
                            [var::I_LOAD, var::PS_SETPOINT, var::PS_REFERENCE]
                                .map(|id| state.value(id).map(|s| s.value.clone()))
                        });
                        let [Some(Value::Float(a)), Some(Value::Float(b)), Some(Value::Float(c))] =
                            values
                        else {
                            continue;
                        };
                        assert!(a == b && b == c, "torn read: {a} {b} {c}");
                        assert_eq!(a.fract(), 0.0);
                        distinct.insert(a as u32);
                    }
                    distinct.len()
                })
            })
            .collect();
        for reader in readers {
            assert!(reader.join().unwrap() > 1);
        }
    }

    #[test]
    fn channel_fault_degrades_to_stale_values() {
        let plant = Plant::new();
        plant.si1.with_device(2, |ps| ps.set_float(var::I_LOAD, -3.0));
        let facility = plant.start(CONFIG);
        connected(&facility);

        plant.si1.set_fault(Some(ErrorKind::BrokenPipe));
        for name in ["ps-1", "ps-2"] {
            wait_until(name, || {
                facility.connection_state(name) == Ok(ConnectionState::TimedOut)
            });
        }
        let Err(ReadError::Unavailable { last: Some(last) }) = facility.read("ps-2", "Current-Mon")
        else {
            panic!("expected a stale reading");
        };
        assert!(last.stale);
        assert_eq!(last.value, PvValue::Float(-3.0));
        assert_eq!(
            facility.write("ps-2", "Reset-Cmd", PvValue::Int(1)),
            Err(WriteError::DeviceUnavailable("ps-2".into()))
        );
        // The other channel keeps running.
        assert_eq!(facility.connection_state("dcdc"), Ok(ConnectionState::Connected));

        plant.si1.set_fault(None);
        connected(&facility);
        facility.shutdown().unwrap();
    }

    #[test]
    fn failing_channel_aborts_start() {
        let config = Config::from_toml(CONFIG).unwrap();
        let bus = MockBus::new();
        let err = Facility::start(&config, |channel| {
            let fail = channel.name == "SI2";
            let bus = bus.clone();
            move || match fail {
                true => Err(TransportError::Fault(ErrorKind::NotFound)),
                false => Ok(bus.clone()),
            }
        });
        assert!(matches!(
            err,
            Err(Error::Connect { ref channel, source: TransportError::Fault(ErrorKind::NotFound) })
                if channel == "SI2"
        ));
    }

    #[test]
    fn shutdown_reports_loop_stats() {
        let plant = Plant::new();
        let facility = plant.start(CONFIG);
        connected(&facility);
        let stats = facility.shutdown().unwrap();
        let names: Vec<&str> = stats.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["SI1", "SI2"]);
        assert!(stats.iter().all(|(_, s)| s.cycle_count > 0));
    }
}

//! Per-channel scan loop.
//!
//! Each cycle runs three phases in order and then sleeps for the rest of the
//! period:
//!
//! 1. Scanning: one group read per device, in address order.
//! 2. Draining: every write queued since the previous drain, FIFO.
//! 3. Curves: at most one waveform upload, only while no triggered playback
//!    is running on the channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Instant;

use embedded_io::ErrorKind;
use strum_macros::IntoStaticStr;
use tracing::{debug, error, info, warn};

use crate::catalog::{FAST_GROUP, FULL_GROUP, var};
use crate::codec::{Command, Frame};
use crate::config::ScanConfig;
use crate::device::Device;
use crate::error::{ChannelError, WriteError};
use crate::mirror::{ConnectionState, Transition};
use crate::property::{PendingWrite, WriteAction};
use crate::transport::Connect;
use crate::udc::Udc;

/// Writes executed per drain at most; the rest wait for the next cycle.
const MAX_WRITES_PER_DRAIN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum Phase {
    Idle,
    Scanning,
    Draining,
    Curves,
}

/// Timing statistics of a scan loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycle_count: u64,
    pub total_cycle_time_us: u64,
    pub max_cycle_time_us: u64,
    pub timing_violations: u64,
}

impl LoopStats {
    pub fn average_cycle_time_us(&self) -> u64 {
        self.total_cycle_time_us
            .checked_div(self.cycle_count)
            .unwrap_or(0)
    }

    fn record(&mut self, cycle_time_us: u64, period_us: u64) -> bool {
        self.cycle_count += 1;
        self.total_cycle_time_us += cycle_time_us;
        self.max_cycle_time_us = self.max_cycle_time_us.max(cycle_time_us);
        let violated = cycle_time_us > period_us;
        if violated {
            self.timing_violations += 1;
        }
        violated
    }
}

pub struct ScanController<C: Connect> {
    udc: Udc<C>,
    /// Sorted by address.
    devices: Vec<Arc<Device>>,
    writes: mpsc::Receiver<PendingWrite>,
    uploads: VecDeque<PendingWrite>,
    settings: ScanConfig,
    running: Arc<AtomicBool>,
    phase: Phase,
    cycle: u64,
    last_reinit: Option<Instant>,
    stats: LoopStats,
}

impl<C: Connect> ScanController<C> {
    pub fn new(
        udc: Udc<C>,
        mut devices: Vec<Arc<Device>>,
        writes: mpsc::Receiver<PendingWrite>,
        settings: ScanConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        devices.sort_by_key(|d| d.address);
        Self {
            udc,
            devices,
            writes,
            uploads: VecDeque::new(),
            settings,
            running,
            phase: Phase::Idle,
            cycle: 0,
            last_reinit: None,
            stats: LoopStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    fn device(&self, address: u8) -> Option<Arc<Device>> {
        self.devices
            .binary_search_by_key(&address, |d| d.address)
            .ok()
            .map(|index| Arc::clone(&self.devices[index]))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run cycles until the running flag is cleared.
    pub fn run(&mut self) -> LoopStats {
        let period = self.settings.period();
        let period_us = period.as_micros() as u64;
        info!(
            "{}: scan loop started ({} devices, period={}ms)",
            self.udc.name(),
            self.devices.len(),
            self.settings.period_ms
        );

        while self.is_running() {
            let cycle_start = Instant::now();
            self.run_cycle();

            let cycle_time_us = cycle_start.elapsed().as_micros() as u64;
            if self.stats.record(cycle_time_us, period_us) {
                let violations = self.stats.timing_violations;
                if violations <= 10 || violations % 1000 == 0 {
                    warn!(
                        "{}: timing violation #{}: cycle took {}us (target {}us)",
                        self.udc.name(),
                        violations,
                        cycle_time_us,
                        period_us
                    );
                }
            }

            if self.stats.cycle_count % 1000 == 0 {
                debug!(
                    "{}: {} cycles, avg={}us, max={}us, violations={}",
                    self.udc.name(),
                    self.stats.cycle_count,
                    self.stats.average_cycle_time_us(),
                    self.stats.max_cycle_time_us,
                    self.stats.timing_violations
                );
            }

            let elapsed = cycle_start.elapsed();
            if elapsed < period && self.is_running() {
                std::thread::sleep(period - elapsed);
            }
        }

        self.close_queue();
        info!(
            "{}: scan loop stopped after {} cycles (violations: {})",
            self.udc.name(),
            self.stats.cycle_count,
            self.stats.timing_violations
        );
        self.stats
    }

    /// One full scan, drain and curve pass.
    pub fn run_cycle(&mut self) {
        self.phase = Phase::Scanning;
        if !self.udc.is_open() {
            self.try_reinitialize();
        }
        if self.udc.is_open() {
            if let Err(kind) = self.scan() {
                self.channel_fault(kind);
            }
        }

        self.phase = Phase::Draining;
        self.drain();

        if self.is_running()
            && !self.uploads.is_empty()
            && self.udc.is_open()
            && !self.udc.playback_active()
        {
            self.phase = Phase::Curves;
            self.transfer_curve();
        }

        self.cycle += 1;
        self.phase = Phase::Idle;
    }

    /// Group read for the current cycle.
    fn scan_group(&self) -> u8 {
        let every = u64::from(self.settings.full_scan_every.max(1));
        if (self.cycle + 1) % every == 0 {
            FULL_GROUP
        } else {
            FAST_GROUP
        }
    }

    fn scan(&self) -> Result<(), ErrorKind> {
        let group = self.scan_group();
        for device in &self.devices {
            if !self.is_running() {
                break;
            }
            let outcome = Frame::read_group(device.address, group)
                .map_err(|_| ChannelError::Unresponsive(device.address))
                .and_then(|request| self.udc.execute(&request));
            match outcome {
                Ok(reply) if reply.command == Command::GroupValues => {
                    match device.mirror().apply_group(group, &reply.payload) {
                        Ok(transition) => {
                            log_transition(device, transition);
                            if transition.is_some_and(|t| t.to == ConnectionState::Connected) {
                                self.read_constants(device)?;
                            }
                        }
                        Err(err) => {
                            warn!("{}: discarding group {} reply: {}", device.name, group, err);
                            self.missed(device);
                        }
                    }
                }
                Ok(reply) => {
                    warn!("{}: unexpected {:?} to a group read", device.name, reply.command);
                    self.missed(device);
                }
                Err(ChannelError::Unresponsive(_)) => self.missed(device),
                Err(ChannelError::Rejected { code, .. }) => {
                    debug!("{}: group {} read rejected with {:?}", device.name, group, code);
                }
                Err(ChannelError::ChannelFault(kind)) => return Err(kind),
                Err(ChannelError::Cancelled) => break,
            }
        }
        Ok(())
    }

    /// Variables outside every scan group, read once per connection.
    fn read_constants(&self, device: &Device) -> Result<(), ErrorKind> {
        let id = var::FIRMWARE_VERSION;
        let outcome = Frame::read_variable(device.address, id)
            .map_err(|_| ChannelError::Unresponsive(device.address))
            .and_then(|request| self.udc.execute(&request));
        match outcome {
            Ok(reply) if reply.command == Command::VariableValue => {
                if let Err(err) = device.mirror().apply_variable(id, &reply.payload) {
                    warn!("{}: discarding firmware version: {}", device.name, err);
                }
                Ok(())
            }
            Err(ChannelError::ChannelFault(kind)) => Err(kind),
            Ok(_) | Err(_) => {
                debug!("{}: firmware version not available", device.name);
                Ok(())
            }
        }
    }

    fn missed(&self, device: &Device) {
        let transition = device.mirror().record_miss(self.settings.max_missed_scans);
        log_transition(device, transition);
    }

    fn channel_fault(&mut self, kind: ErrorKind) {
        error!("{}: channel fault ({:?}), all devices timed out", self.udc.name(), kind);
        for device in &self.devices {
            log_transition(device, device.mirror().mark_timed_out());
        }
        self.last_reinit = Some(Instant::now());
    }

    fn try_reinitialize(&mut self) {
        let due = self
            .last_reinit
            .is_none_or(|at| at.elapsed() >= self.settings.reinit_interval());
        if !due {
            return;
        }
        self.last_reinit = Some(Instant::now());
        if let Err(err) = self.udc.reinitialize() {
            warn!("{}: reopening channel failed: {}", self.udc.name(), err);
        }
    }

    fn drain(&mut self) {
        let mut queued = Vec::new();
        while queued.len() < MAX_WRITES_PER_DRAIN {
            match self.writes.try_recv() {
                Ok(write) => queued.push(write),
                Err(_) => break,
            }
        }

        for write in queued {
            if !self.is_running() {
                write.finish(Err(WriteError::QueueClosed));
                continue;
            }
            let Some(device) = self.device(write.address) else {
                let name = format!("0x{:02X}", write.address);
                write.finish(Err(WriteError::UnknownDevice(name)));
                continue;
            };
            if !self.udc.is_open() || device.connection_state() != ConnectionState::Connected {
                debug!("{}: rejecting {} while unavailable", device.name, write.property);
                write.finish(Err(WriteError::DeviceUnavailable(device.name.clone())));
                continue;
            }
            if matches!(write.action, WriteAction::Curve(_)) {
                self.uploads.push_back(write);
                continue;
            }
            let outcome = self.execute_write(&device, &write);
            write.finish(outcome);
        }
    }

    fn execute_write(&mut self, device: &Device, write: &PendingWrite) -> Result<(), WriteError> {
        let request = match &write.action {
            WriteAction::Variable { id, value } => Frame::write_variable(device.address, *id, value),
            WriteAction::Function { id, args } => Frame::execute_function(device.address, *id, args),
            WriteAction::Curve(_) => return Ok(()),
        }
        .map_err(|_| WriteError::InvalidValue {
            property: write.property.name(),
            reason: "value does not fit in a frame",
        })?;

        match self.udc.execute(&request) {
            Ok(_) => {
                debug!("{}: {} written", device.name, write.property);
                Ok(())
            }
            Err(err) => Err(self.write_failed(device, write, err)),
        }
    }

    fn write_failed(&mut self, device: &Device, write: &PendingWrite, err: ChannelError) -> WriteError {
        warn!("{}: {} failed: {}", device.name, write.property, err);
        match err {
            ChannelError::Rejected { .. } => WriteError::Rejected(device.name.clone()),
            ChannelError::Unresponsive(_) => WriteError::DeviceUnavailable(device.name.clone()),
            ChannelError::ChannelFault(kind) => {
                self.channel_fault(kind);
                WriteError::DeviceUnavailable(device.name.clone())
            }
            ChannelError::Cancelled => WriteError::QueueClosed,
        }
    }

    fn transfer_curve(&mut self) {
        let Some(write) = self.uploads.pop_front() else {
            return;
        };
        let Some(device) = self.device(write.address) else {
            let name = format!("0x{:02X}", write.address);
            write.finish(Err(WriteError::UnknownDevice(name)));
            return;
        };
        let WriteAction::Curve(upload) = &write.action else {
            let property = write.property.name();
            write.finish(Err(WriteError::InvalidValue {
                property,
                reason: "expected a waveform",
            }));
            return;
        };
        if device.connection_state() != ConnectionState::Connected {
            write.finish(Err(WriteError::DeviceUnavailable(device.name.clone())));
            return;
        }

        let running = Arc::clone(&self.running);
        let keep_going = move || running.load(Ordering::SeqCst);
        let outcome = match self.udc.upload_curve(device.address, upload, &keep_going) {
            Ok(()) => {
                let curve = upload.curve;
                match self
                    .udc
                    .download_curve(device.address, curve.id, curve.blocks, &keep_going)
                {
                    Ok((points, last_block)) => {
                        device.mirror().set_curve(curve.id, points, last_block)
                    }
                    Err(err) => warn!("{}: reading back {} failed: {}", device.name, curve.name, err),
                }
                Ok(())
            }
            Err(err) => Err(self.write_failed(&device, &write, err)),
        };
        write.finish(outcome);
    }

    /// Reject everything still queued.
    fn close_queue(&mut self) {
        for write in self.uploads.drain(..) {
            write.finish(Err(WriteError::QueueClosed));
        }
        while let Ok(write) = self.writes.try_recv() {
            write.finish(Err(WriteError::QueueClosed));
        }
    }
}

fn log_transition(device: &Device, transition: Option<Transition>) {
    let Some(transition) = transition else {
        return;
    };
    match transition.to {
        ConnectionState::Connected => {
            info!("{} (0x{:02X}) connected", device.name, device.address)
        }
        ConnectionState::TimedOut => warn!(
            "{} (0x{:02X}) timed out, was {}",
            device.name, device.address, transition.from
        ),
        ConnectionState::Disconnected => {}
    }
}

//! We use this mocking module in unit tests to emulate a shared serial bus
//! with simulated power supplies attached.
//!
//! Cloned handles share one bus, so a test can keep a handle for inspection
//! and fault injection while the transport owns another.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use embedded_io::ErrorKind;
use thiserror::Error;

use crate::catalog::{DeviceModel, SYNC_PLAYBACK_FUNCTION, VarKind, func, var};
use crate::codec::{self, Command, Frame};
use crate::status::{OpState, PsStatus};

/// One power supply answering on the bus.
#[derive(Debug, Clone)]
pub struct SimulatedPs {
    pub address: u8,
    pub model: DeviceModel,
    values: BTreeMap<u8, Vec<u8>>,
    curve_blocks: BTreeMap<(u8, u16), Vec<u8>>,
    /// Every executed function with its arguments, in order.
    pub executed: Vec<(u8, Vec<u8>)>,
    /// Every variable write with its value bytes, in order.
    pub written: Vec<(u8, Vec<u8>)>,
    /// Never answer.
    pub silent: bool,
    /// Answer only after the bus master has moved on: the reply shows up
    /// ahead of the reply to the next request.
    pub late: bool,
    /// Corrupt this many upcoming replies.
    pub corrupt_replies: usize,
    /// Answer the next request with this error command.
    pub reject_next: Option<Command>,
    /// Before each group read, set current, setpoint and reference to an
    /// increasing counter.
    pub ramp: bool,
    ramp_counter: u32,
}

impl SimulatedPs {
    pub fn new(address: u8, model: DeviceModel) -> Self {
        let values = model
            .catalog()
            .variables
            .iter()
            .map(|v| (v.id, vec![0u8; v.kind.size()]))
            .collect::<BTreeMap<_, _>>();
        let mut ps = Self {
            address,
            model,
            values,
            curve_blocks: BTreeMap::new(),
            executed: Vec::new(),
            written: Vec::new(),
            silent: false,
            late: false,
            corrupt_replies: 0,
            reject_next: None,
            ramp: false,
            ramp_counter: 0,
        };
        ps.set_bytes(var::FIRMWARE_VERSION, b"0.45.01 sim     ");
        ps
    }

    pub fn set_bytes(&mut self, id: u8, bytes: &[u8]) {
        if let Some(slot) = self.values.get_mut(&id) {
            slot.copy_from_slice(bytes);
        }
    }

    pub fn set_float(&mut self, id: u8, value: f32) {
        self.set_bytes(id, &value.to_le_bytes());
    }

    pub fn set_u16(&mut self, id: u8, value: u16) {
        self.set_bytes(id, &value.to_le_bytes());
    }

    pub fn set_u32(&mut self, id: u8, value: u32) {
        self.set_bytes(id, &value.to_le_bytes());
    }

    pub fn float(&self, id: u8) -> f32 {
        let b = &self.values[&id];
        f32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn status(&self) -> PsStatus {
        let b = &self.values[&var::PS_STATUS];
        PsStatus::from(u16::from_le_bytes([b[0], b[1]]))
    }

    fn set_state(&mut self, state: OpState) {
        let status = self.status().with_state(state as u8);
        self.set_u16(var::PS_STATUS, status.into());
    }

    pub fn curve_block(&self, curve: u8, block: u16) -> Option<&Vec<u8>> {
        self.curve_blocks.get(&(curve, block))
    }

    /// Produce the reply for one well-formed request.
    fn respond(&mut self, request: &Frame) -> Frame {
        if let Some(code) = self.reject_next.take() {
            return self.reply(code, &[]);
        }
        let catalog = self.model.catalog();
        let payload = request.payload.as_slice();
        match request.command {
            Command::ReadVariable => match payload.first().and_then(|id| self.values.get(id)) {
                Some(value) => self.reply(Command::VariableValue, &value.clone()),
                None => self.reply(Command::ErrInvalidId, &[]),
            },
            Command::ReadGroup => {
                let Some(vars) = payload.first().and_then(|id| catalog.group_variables(*id))
                else {
                    return self.reply(Command::ErrInvalidId, &[]);
                };
                if self.ramp {
                    self.ramp_counter += 1;
                    let value = self.ramp_counter as f32;
                    self.set_float(var::I_LOAD, value);
                    self.set_float(var::PS_SETPOINT, value);
                    self.set_float(var::PS_REFERENCE, value);
                }
                let body: Vec<u8> = vars
                    .iter()
                    .flat_map(|v| self.values[&v.id].iter().copied())
                    .collect();
                self.reply(Command::GroupValues, &body)
            }
            Command::WriteVariable => {
                let Some((id, value)) = payload.split_first() else {
                    return self.reply(Command::ErrMalformedMessage, &[]);
                };
                match catalog.variable(*id) {
                    None => self.reply(Command::ErrInvalidId, &[]),
                    Some(v) if !v.writable() => self.reply(Command::ErrReadOnly, &[]),
                    Some(v) if v.kind.size() != value.len() => {
                        self.reply(Command::ErrInvalidPayloadSize, &[])
                    }
                    Some(_) => {
                        self.written.push((*id, value.to_vec()));
                        self.set_bytes(*id, value);
                        self.reply(Command::Ok, &[])
                    }
                }
            }
            Command::ExecuteFunction => {
                let Some((id, args)) = payload.split_first() else {
                    return self.reply(Command::ErrMalformedMessage, &[]);
                };
                let Some(function) = catalog.function(*id) else {
                    return self.reply(Command::ErrInvalidId, &[]);
                };
                if function.input.map_or(0, |k: VarKind| k.size()) != args.len() {
                    return self.reply(Command::ErrInvalidPayloadSize, &[]);
                }
                self.executed.push((*id, args.to_vec()));
                self.apply_function(*id, args);
                self.reply(Command::FunctionReturn, &[])
            }
            Command::CurveBlockWrite => match request.curve_block() {
                Ok((curve, block, data)) if catalog.curve(curve).is_some() => {
                    self.curve_blocks.insert((curve, block), data.to_vec());
                    self.reply(Command::Ok, &[])
                }
                _ => self.reply(Command::ErrInvalidId, &[]),
            },
            Command::CurveBlockRead => match request.curve_block() {
                Ok((curve, block, _)) => {
                    let data = self
                        .curve_blocks
                        .get(&(curve, block))
                        .cloned()
                        .unwrap_or_default();
                    let [hi, lo] = block.to_be_bytes();
                    let mut body = vec![curve, hi, lo];
                    body.extend_from_slice(&data);
                    self.reply(Command::CurveBlockWrite, &body)
                }
                Err(_) => self.reply(Command::ErrMalformedMessage, &[]),
            },
            _ => self.reply(Command::ErrOperationNotSupported, &[]),
        }
    }

    fn apply_function(&mut self, id: u8, args: &[u8]) {
        match id {
            func::TURN_ON => self.set_state(OpState::SlowRef),
            func::TURN_OFF => self.set_state(OpState::Off),
            func::OPEN_LOOP | func::CLOSED_LOOP => {
                let status = self.status().with_open_loop(id == func::OPEN_LOOP);
                self.set_u16(var::PS_STATUS, status.into());
            }
            func::SELECT_OP_MODE => {
                let mode = u16::from_le_bytes([args[0], args[1]]);
                let status = self.status().with_state(mode as u8);
                self.set_u16(var::PS_STATUS, status.into());
            }
            func::RESET_INTERLOCKS => {
                self.set_u32(var::INTLK_SOFT, 0);
                self.set_u32(var::INTLK_HARD, 0);
                if self.status().state() == OpState::Interlock as u8 {
                    self.set_state(OpState::Off);
                }
            }
            func::SET_SLOWREF => {
                let value = f32::from_le_bytes([args[0], args[1], args[2], args[3]]);
                self.set_float(var::PS_SETPOINT, value);
                self.set_float(var::PS_REFERENCE, value);
                self.set_float(var::I_LOAD, value);
            }
            SYNC_PLAYBACK_FUNCTION => self.set_state(OpState::RmpWfm),
            _ => {}
        }
    }

    fn reply(&self, command: Command, payload: &[u8]) -> Frame {
        Frame {
            address: self.address,
            command,
            payload: codec::Payload::from_slice(payload).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    devices: BTreeMap<u8, SimulatedPs>,
    /// Bytes of the request currently being written.
    incoming: Vec<u8>,
    /// Reply bytes not yet read.
    pending: VecDeque<u8>,
    /// Every complete request frame.
    requests: Vec<Vec<u8>>,
    /// Read calls since the last complete request.
    reads_since_request: usize,
    /// Requests written while a previous exchange was still open.
    overlaps: usize,
    /// Fail every read and write with this kind.
    fault: Option<ErrorKind>,
    /// Largest number of bytes handed out per read.
    read_chunk: Option<usize>,
    /// Reply to the next request with the wrong address.
    misaddress_next: bool,
    /// A late reply waiting for the next request.
    held: Vec<u8>,
}

impl BusState {
    fn complete_request(&mut self) {
        let bytes = std::mem::take(&mut self.incoming);
        if !self.requests.is_empty() && (self.reads_since_request == 0 || !self.pending.is_empty())
        {
            self.overlaps += 1;
        }
        self.requests.push(bytes.clone());
        self.reads_since_request = 0;
        let held = std::mem::take(&mut self.held);
        self.pending.extend(held);

        let Ok(request) = codec::decode(&bytes) else {
            return;
        };
        let Some(device) = self.devices.get_mut(&request.address) else {
            return;
        };
        if device.silent {
            return;
        }
        let mut reply = device.respond(&request);
        if std::mem::take(&mut self.misaddress_next) {
            reply.address = reply.address.wrapping_add(1);
        }
        let mut bytes = codec::encode(&reply);
        if device.corrupt_replies > 0 {
            device.corrupt_replies -= 1;
            let last = bytes.len() - 1;
            bytes[last] ^= 0x5A;
        }
        if device.late {
            self.held = bytes.to_vec();
            return;
        }
        self.pending.extend(bytes.iter().copied());
    }
}

#[derive(Error, Debug)]
pub enum MockBusError {
    /// Would block - no data available
    #[error("Would block")]
    WouldBlock,
    /// Injected driver failure
    #[error("Injected fault: {0:?}")]
    Fault(ErrorKind),
}

impl embedded_io::Error for MockBusError {
    fn kind(&self) -> ErrorKind {
        match self {
            MockBusError::WouldBlock => ErrorKind::Other,
            MockBusError::Fault(kind) => *kind,
        }
    }
}

/// Handle to a simulated bus.
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn attach(&self, device: SimulatedPs) {
        self.state().devices.insert(device.address, device);
    }

    /// Inspect or modify one attached device.
    pub fn with_device<R>(&self, address: u8, f: impl FnOnce(&mut SimulatedPs) -> R) -> R {
        let mut state = self.state();
        let device = state
            .devices
            .get_mut(&address)
            .expect("no simulated device at this address");
        f(device)
    }

    pub fn set_fault(&self, fault: Option<ErrorKind>) {
        self.state().fault = fault;
    }

    pub fn set_read_chunk(&self, chunk: usize) {
        self.state().read_chunk = Some(chunk);
    }

    pub fn misaddress_next_reply(&self) {
        self.state().misaddress_next = true;
    }

    /// Put `bytes` on the line as if some device had sent them unasked.
    pub fn inject_input(&self, bytes: &[u8]) {
        self.state().pending.extend(bytes.iter().copied());
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state().requests.clone()
    }

    /// Decoded requests sent to `address`.
    pub fn requests_to(&self, address: u8) -> Vec<Frame> {
        self.state()
            .requests
            .iter()
            .filter_map(|bytes| codec::decode(bytes).ok())
            .filter(|frame| frame.address == address)
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.state().requests.len()
    }

    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    /// Requests written before the previous exchange finished.
    pub fn overlaps(&self) -> usize {
        self.state().overlaps
    }
}

impl embedded_io::ErrorType for MockBus {
    type Error = MockBusError;
}

impl embedded_io::Write for MockBus {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut state = self.state();
        if let Some(kind) = state.fault {
            return Err(MockBusError::Fault(kind));
        }
        state.incoming.extend_from_slice(buf);
        if let Some(total) = codec::expected_len(&state.incoming) {
            if state.incoming.len() >= total {
                state.complete_request();
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        match self.state().fault {
            Some(kind) => Err(MockBusError::Fault(kind)),
            None => Ok(()),
        }
    }
}

impl embedded_io::Read for MockBus {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut state = self.state();
        if let Some(kind) = state.fault {
            return Err(MockBusError::Fault(kind));
        }
        state.reads_since_request += 1;
        if state.pending.is_empty() {
            return Err(MockBusError::WouldBlock);
        }
        let limit = state.read_chunk.unwrap_or(usize::MAX).min(buf.len());
        let mut count = 0;
        while count < limit {
            let Some(byte) = state.pending.pop_front() else {
                break;
            };
            buf[count] = byte;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error, Read, Write};

    fn exchange(bus: &mut MockBus, frame: &Frame) -> Option<Frame> {
        bus.write_all(&codec::encode(frame)).unwrap();
        let mut buf = [0u8; 64];
        let mut out = Vec::new();
        while let Ok(n) = bus.read(&mut buf) {
            out.extend_from_slice(&buf[..n]);
        }
        (!out.is_empty()).then(|| codec::decode(&out).unwrap())
    }

    #[test]
    fn answers_group_reads() {
        let mut bus = MockBus::new();
        let mut ps = SimulatedPs::new(1, DeviceModel::Fbp);
        ps.set_float(var::I_LOAD, 1.5);
        bus.attach(ps);

        let reply = exchange(&mut bus, &Frame::read_group(1, 0).unwrap()).unwrap();
        assert_eq!(reply.command, Command::GroupValues);
        assert_eq!(&reply.payload[..4], &1.5f32.to_le_bytes());
    }

    #[test]
    fn functions_change_state() {
        let mut bus = MockBus::new();
        bus.attach(SimulatedPs::new(1, DeviceModel::Fbp));

        let frame = Frame::execute_function(1, func::TURN_ON, &[]).unwrap();
        let reply = exchange(&mut bus, &frame).unwrap();
        assert_eq!(reply.command, Command::FunctionReturn);
        bus.with_device(1, |ps| {
            assert_eq!(ps.status().state(), OpState::SlowRef as u8);
            assert_eq!(ps.executed, vec![(func::TURN_ON, vec![])]);
        });
    }

    #[test]
    fn read_only_write_is_rejected() {
        let mut bus = MockBus::new();
        bus.attach(SimulatedPs::new(1, DeviceModel::Fbp));

        let frame = Frame::write_variable(1, var::I_LOAD, &1.0f32.to_le_bytes()).unwrap();
        let reply = exchange(&mut bus, &frame).unwrap();
        assert_eq!(reply.command, Command::ErrReadOnly);
    }

    #[test]
    fn silent_and_missing_devices() {
        let mut bus = MockBus::new();
        let mut ps = SimulatedPs::new(1, DeviceModel::Fbp);
        ps.silent = true;
        bus.attach(ps);

        assert!(exchange(&mut bus, &Frame::read_group(1, 0).unwrap()).is_none());
        assert!(exchange(&mut bus, &Frame::read_group(2, 0).unwrap()).is_none());
        assert_eq!(bus.request_count(), 2);
        assert_eq!(bus.overlaps(), 0);
    }

    #[test]
    fn overlapping_requests_are_counted() {
        let mut bus = MockBus::new();
        bus.attach(SimulatedPs::new(1, DeviceModel::Fbp));

        let bytes = codec::encode(&Frame::read_group(1, 0).unwrap());
        bus.write_all(&bytes).unwrap();
        bus.write_all(&bytes).unwrap();
        assert_eq!(bus.overlaps(), 1);
    }

    #[test]
    fn late_reply_arrives_with_the_next_one() {
        let mut bus = MockBus::new();
        let mut late = SimulatedPs::new(1, DeviceModel::Fbp);
        late.late = true;
        bus.attach(late);
        bus.attach(SimulatedPs::new(2, DeviceModel::Fbp));

        assert!(exchange(&mut bus, &Frame::read_group(1, 0).unwrap()).is_none());

        bus.write_all(&codec::encode(&Frame::read_group(2, 0).unwrap()))
            .unwrap();
        let mut buf = [0u8; 64];
        let mut out = Vec::new();
        while let Ok(n) = bus.read(&mut buf) {
            out.extend_from_slice(&buf[..n]);
        }
        let first_len = codec::expected_len(&out).unwrap();
        assert_eq!(codec::decode(&out[..first_len]).unwrap().address, 1);
        assert_eq!(codec::decode(&out[first_len..]).unwrap().address, 2);
    }

    #[test]
    fn errors_display() {
        assert_eq!(MockBusError::WouldBlock.to_string(), "Would block");
        let err = MockBusError::Fault(ErrorKind::BrokenPipe);
        assert!(err.to_string().contains("BrokenPipe"));
        let _: &dyn core::error::Error = &err;
    }

    #[test]
    fn injected_fault() {
        let mut bus = MockBus::new();
        bus.set_fault(Some(ErrorKind::BrokenPipe));
        let err = bus.write(&[0x01]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
        assert_eq!(bus.read(&mut [0u8; 4]).unwrap_err().kind(), ErrorKind::BrokenPipe);
    }
}

//! Frame codec for the BSMP-style serial protocol.
//!
//! Wire layout:
//!
//! ```text
//! [address:u8][command:u8][size:u16 BE][payload: size bytes][checksum:u8]
//! ```
//!
//! The checksum is the two's complement of the byte sum, so a valid frame sums
//! to zero modulo 256. It is checked before any other field, which means any
//! single corrupted byte is reported as [`DecodeError::Checksum`].
//!
//! Values inside payloads are little-endian. Curve block payloads start with
//! `[curve_id][block:u16 BE]`.

use strum_macros::EnumIter;

use crate::error::DecodeError;

/// Largest payload a frame may carry.
pub const MAX_PAYLOAD: usize = 2048;
/// Address, command and the two size bytes.
pub const HEADER_LEN: usize = 4;
/// Smallest possible frame: header plus checksum.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1;
/// Largest possible frame.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD + 1;
/// `[curve_id][block_hi][block_lo]`
pub const CURVE_HEADER_LEN: usize = 3;

pub type Payload = heapless::Vec<u8, MAX_PAYLOAD>;
pub type FrameBuffer = heapless::Vec<u8, MAX_FRAME_LEN>;

/// Command byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
#[repr(u8)]
pub enum Command {
    /// Request: `[var_id]`.
    ReadVariable = 0x10,
    /// Response: raw value bytes.
    VariableValue = 0x11,
    /// Request: `[group_id]`.
    ReadGroup = 0x12,
    /// Response: the group's variable values concatenated in group order.
    GroupValues = 0x13,
    /// Request: `[var_id][value...]`. Answered with [`Command::Ok`].
    WriteVariable = 0x20,
    /// Request: `[curve_id][block:u16 BE]`.
    CurveBlockRead = 0x40,
    /// Request `[curve_id][block:u16 BE][data...]`, answered with [`Command::Ok`].
    ///
    /// Devices also use this code to answer [`Command::CurveBlockRead`].
    CurveBlockWrite = 0x41,
    /// Request: `[func_id][args...]`.
    ExecuteFunction = 0x50,
    /// Response: function return bytes.
    FunctionReturn = 0x51,
    /// Response: `[error_code]` raised by the function itself.
    FunctionError = 0x53,
    Ok = 0xE0,
    ErrMalformedMessage = 0xE1,
    ErrOperationNotSupported = 0xE2,
    ErrInvalidId = 0xE3,
    ErrInvalidValue = 0xE4,
    ErrInvalidPayloadSize = 0xE5,
    ErrReadOnly = 0xE6,
    ErrInsufficientMemory = 0xE7,
    ErrResourceBusy = 0xE8,
}

impl Command {
    /// Whether this is one of the protocol error responses.
    pub fn is_error(self) -> bool {
        matches!(self, Command::FunctionError) || (self as u8) >= Command::ErrMalformedMessage as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Command as C;
        let command = match value {
            0x10 => C::ReadVariable,
            0x11 => C::VariableValue,
            0x12 => C::ReadGroup,
            0x13 => C::GroupValues,
            0x20 => C::WriteVariable,
            0x40 => C::CurveBlockRead,
            0x41 => C::CurveBlockWrite,
            0x50 => C::ExecuteFunction,
            0x51 => C::FunctionReturn,
            0x53 => C::FunctionError,
            0xE0 => C::Ok,
            0xE1 => C::ErrMalformedMessage,
            0xE2 => C::ErrOperationNotSupported,
            0xE3 => C::ErrInvalidId,
            0xE4 => C::ErrInvalidValue,
            0xE5 => C::ErrInvalidPayloadSize,
            0xE6 => C::ErrReadOnly,
            0xE7 => C::ErrInsufficientMemory,
            0xE8 => C::ErrResourceBusy,
            other => return Err(DecodeError::UnknownCommand(other)),
        };
        Ok(command)
    }
}

/// One complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub command: Command,
    pub payload: Payload,
}

impl Frame {
    pub fn new(address: u8, command: Command, payload: &[u8]) -> Result<Self, DecodeError> {
        let payload = Payload::from_slice(payload)
            .map_err(|_| DecodeError::Malformed("payload exceeds frame capacity"))?;
        Ok(Self {
            address,
            command,
            payload,
        })
    }

    /// Build a frame from a command and a short header followed by a body.
    fn with_prefix(
        address: u8,
        command: Command,
        prefix: &[u8],
        body: &[u8],
    ) -> Result<Self, DecodeError> {
        let overflow = |_| DecodeError::Malformed("payload exceeds frame capacity");
        let mut payload = Payload::new();
        payload.extend_from_slice(prefix).map_err(overflow)?;
        payload.extend_from_slice(body).map_err(overflow)?;
        Ok(Self {
            address,
            command,
            payload,
        })
    }

    pub fn read_variable(address: u8, var_id: u8) -> Result<Self, DecodeError> {
        Self::new(address, Command::ReadVariable, &[var_id])
    }

    pub fn read_group(address: u8, group_id: u8) -> Result<Self, DecodeError> {
        Self::new(address, Command::ReadGroup, &[group_id])
    }

    pub fn write_variable(address: u8, var_id: u8, value: &[u8]) -> Result<Self, DecodeError> {
        Self::with_prefix(address, Command::WriteVariable, &[var_id], value)
    }

    pub fn execute_function(address: u8, func_id: u8, args: &[u8]) -> Result<Self, DecodeError> {
        Self::with_prefix(address, Command::ExecuteFunction, &[func_id], args)
    }

    pub fn curve_block_write(
        address: u8,
        curve_id: u8,
        block: u16,
        data: &[u8],
    ) -> Result<Self, DecodeError> {
        let [hi, lo] = block.to_be_bytes();
        Self::with_prefix(address, Command::CurveBlockWrite, &[curve_id, hi, lo], data)
    }

    pub fn curve_block_read(address: u8, curve_id: u8, block: u16) -> Result<Self, DecodeError> {
        let [hi, lo] = block.to_be_bytes();
        Self::new(address, Command::CurveBlockRead, &[curve_id, hi, lo])
    }

    /// Split a curve block payload into `(curve_id, block, data)`.
    pub fn curve_block(&self) -> Result<(u8, u16, &[u8]), DecodeError> {
        if self.payload.len() < CURVE_HEADER_LEN {
            return Err(DecodeError::Malformed("curve block shorter than its header"));
        }
        let block = u16::from_be_bytes([self.payload[1], self.payload[2]]);
        Ok((self.payload[0], block, &self.payload[CURVE_HEADER_LEN..]))
    }
}

/// Two's complement of the byte sum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, byte| acc.wrapping_add(*byte))
        .wrapping_neg()
}

/// Serialise a frame for the wire.
pub fn encode(frame: &Frame) -> FrameBuffer {
    let mut out = FrameBuffer::new();
    let size = frame.payload.len() as u16;
    let [size_hi, size_lo] = size.to_be_bytes();
    // Capacity is sized for the largest payload, so these cannot overflow.
    let _ = out.extend_from_slice(&[frame.address, frame.command as u8, size_hi, size_lo]);
    let _ = out.extend_from_slice(&frame.payload);
    let sum = checksum(&out);
    let _ = out.push(sum);
    out
}

/// Parse and validate one complete frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(DecodeError::Malformed("frame shorter than header"));
    }
    if checksum(bytes) != 0 {
        return Err(DecodeError::Checksum);
    }
    let size = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if size > MAX_PAYLOAD {
        return Err(DecodeError::Malformed("payload exceeds frame capacity"));
    }
    if bytes.len() != HEADER_LEN + size + 1 {
        return Err(DecodeError::Malformed("size field disagrees with frame length"));
    }
    let command = Command::try_from(bytes[1])?;
    Frame::new(bytes[0], command, &bytes[HEADER_LEN..HEADER_LEN + size])
}

/// Total frame length announced by a header, once at least [`HEADER_LEN`] bytes are known.
pub fn expected_len(header: &[u8]) -> Option<usize> {
    if header.len() < HEADER_LEN {
        return None;
    }
    let size = u16::from_be_bytes([header[2], header[3]]) as usize;
    Some(HEADER_LEN + size + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn command_conversions() {
        // Every command survives a trip through its wire byte.
        for command in Command::iter() {
            assert_eq!(Command::try_from(command as u8), Ok(command));
        }
        assert_eq!(Command::try_from(0x99), Err(DecodeError::UnknownCommand(0x99)));
    }

    #[test]
    fn error_commands() {
        assert!(Command::ErrResourceBusy.is_error());
        assert!(Command::FunctionError.is_error());
        assert!(!Command::Ok.is_error());
        assert!(!Command::GroupValues.is_error());
    }

    #[test]
    fn read_group_wire_bytes() {
        let frame = Frame::read_group(0x01, 0x00).unwrap();
        let bytes = encode(&frame);
        // 0x01 + 0x12 + 0x00 + 0x01 + 0x00 = 0x14, negated = 0xEC.
        assert_eq!(bytes.as_slice(), &[0x01, 0x12, 0x00, 0x01, 0x00, 0xEC]);
    }

    #[test]
    fn frames_round_trip() {
        let frames = [
            Frame::read_variable(3, 7).unwrap(),
            Frame::new(3, Command::GroupValues, &[0xB6, 0xF3, 0x9D, 0x3F, 0x01, 0x00]).unwrap(),
            Frame::execute_function(31, 6, &1.5f32.to_le_bytes()).unwrap(),
            Frame::curve_block_write(2, 0, 3, &[0xAA; 1024]).unwrap(),
            Frame::new(2, Command::Ok, &[]).unwrap(),
        ];
        for frame in frames {
            assert_eq!(decode(&encode(&frame)), Ok(frame));
        }
    }

    #[test]
    fn any_single_corrupted_byte_fails_checksum() {
        let frame = Frame::write_variable(5, 13, &2.5f32.to_le_bytes()).unwrap();
        let bytes = encode(&frame);
        for position in 0..bytes.len() {
            for mask in [0x01u8, 0x10, 0x80, 0xFF, 0x5A] {
                let mut corrupted = bytes.clone();
                corrupted[position] ^= mask;
                assert_eq!(
                    decode(&corrupted),
                    Err(DecodeError::Checksum),
                    "byte {position} mask {mask:#04X}"
                );
            }
        }
    }

    #[test]
    fn unknown_command_with_valid_checksum() {
        let mut bytes = [0x01, 0x77, 0x00, 0x00, 0x00];
        bytes[4] = checksum(&bytes[..4]);
        assert_eq!(decode(&bytes), Err(DecodeError::UnknownCommand(0x77)));
    }

    #[test]
    fn inconsistent_length_is_malformed() {
        // Size says 2 bytes, only 1 present.
        let mut bytes = [0x01, 0x11, 0x00, 0x02, 0x42, 0x00];
        bytes[5] = checksum(&bytes[..5]);
        assert!(matches!(decode(&bytes), Err(DecodeError::Malformed(_))));

        assert!(matches!(decode(&[0x01, 0x11]), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn oversize_payload_rejected() {
        let data = [0u8; MAX_PAYLOAD];
        assert!(Frame::curve_block_write(1, 0, 0, &data).is_err());
        assert!(Frame::new(1, Command::VariableValue, &data).is_ok());
    }

    #[test]
    fn curve_block_header() {
        let frame = Frame::curve_block_write(1, 2, 0x0102, &[9, 8, 7]).unwrap();
        let (curve, block, data) = frame.curve_block().unwrap();
        assert_eq!((curve, block, data), (2, 0x0102, &[9u8, 8, 7][..]));

        let short = Frame::new(1, Command::CurveBlockWrite, &[2]).unwrap();
        assert!(short.curve_block().is_err());
    }

    #[test]
    fn expected_len_from_header() {
        assert_eq!(expected_len(&[0x01, 0x11]), None);
        assert_eq!(expected_len(&[0x01, 0x11, 0x00, 0x04]), Some(9));
        assert_eq!(expected_len(&[0x01, 0x11, 0x01, 0x00, 0xAA]), Some(261));
    }
}

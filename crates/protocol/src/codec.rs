//! Request encoding and response decoding
//!
//! The sensor sends floats as IEEE-754 single precision bit patterns with the
//! byte order reversed relative to big-endian (bytes 0<->3 and 1<->2 swapped),
//! which is the same as little-endian. Conversion is a pure bit-pattern
//! reinterpretation: NaN payloads and subnormals pass through unchanged.
//!
//! # Frame Format
//!
//! ```text
//! request:  [opcode][param 0: 4 bytes]...[param n: 4 bytes]['!']
//! response: [opcode echo][payload]
//! ```

use crate::{Command, TERMINATOR, error::ProtocolError, error::Result};
use byteorder::{ByteOrder, LittleEndian};

/// Size of one encoded float
pub const FLOAT_LEN: usize = 4;

/// Encode a command, substituting float parameters into its template
///
/// # Example
/// ```
/// use protocol::{Command, encode};
///
/// assert_eq!(encode(Command::ReadVoltage, &[]).unwrap(), b"U!".to_vec());
/// let set = encode(Command::SetCalibration, &[1.0, 0.0]).unwrap();
/// assert_eq!(set.len(), 10);
/// assert_eq!(set[0], 0x84);
/// assert_eq!(*set.last().unwrap(), b'!');
/// ```
pub fn encode(command: Command, params: &[f32]) -> Result<Vec<u8>> {
    let expected = command.param_count();
    if params.len() != expected {
        return Err(ProtocolError::ParamCount {
            command,
            expected,
            actual: params.len(),
        });
    }

    let mut request = Vec::with_capacity(2 + FLOAT_LEN * params.len());
    request.push(command.opcode());
    for param in params {
        request.extend_from_slice(&encode_float_param(*param));
    }
    request.push(TERMINATOR);

    Ok(request)
}

/// Convert a float to the device's byte-reversed wire representation
pub fn encode_float_param(value: f32) -> [u8; FLOAT_LEN] {
    let mut bytes = [0u8; FLOAT_LEN];
    LittleEndian::write_u32(&mut bytes, value.to_bits());
    bytes
}

/// Convert 4 byte-reversed wire bytes back into a float
///
/// # Example
/// ```
/// use protocol::{decode_float, encode_float_param};
///
/// let bytes = encode_float_param(2.5);
/// assert_eq!(decode_float(bytes), 2.5);
/// ```
pub fn decode_float(bytes: [u8; FLOAT_LEN]) -> f32 {
    f32::from_bits(LittleEndian::read_u32(&bytes))
}

/// Check that a response belongs to the command that produced it
///
/// Succeeds iff the response is non-empty and its first byte equals the
/// command opcode.
pub fn validate(command: Command, response: &[u8]) -> Result<()> {
    let Some(&actual) = response.first() else {
        return Err(ProtocolError::EmptyResponse { command });
    };

    let expected = command.opcode();
    if actual != expected {
        return Err(ProtocolError::InvalidPrefix {
            command,
            expected,
            actual,
        });
    }

    Ok(())
}

/// Read one float starting at `offset`
pub fn read_float(command: Command, response: &[u8], offset: usize) -> Result<f32> {
    let needed = offset + FLOAT_LEN;
    let bytes: [u8; FLOAT_LEN] = response
        .get(offset..needed)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(ProtocolError::ShortResponse {
            command,
            needed,
            available: response.len(),
        })?;

    Ok(decode_float(bytes))
}

/// Validate and decode a single-float response (voltage, serial)
pub fn decode_single(command: Command, response: &[u8]) -> Result<f32> {
    validate(command, response)?;
    read_float(command, response, 1)
}

/// Validate and decode a two-float response (multiplier, offset)
pub fn decode_pair(command: Command, response: &[u8]) -> Result<(f32, f32)> {
    validate(command, response)?;
    let first = read_float(command, response, 1)?;
    let second = read_float(command, response, 1 + FLOAT_LEN)?;
    Ok((first, second))
}

/// Validate and decode a one-byte payload (firmware version)
pub fn decode_u8(command: Command, response: &[u8]) -> Result<u8> {
    validate(command, response)?;
    response
        .get(1)
        .copied()
        .ok_or(ProtocolError::ShortResponse {
            command,
            needed: 2,
            available: response.len(),
        })
}

/// Validate and decode an ASCII payload
///
/// The payload runs from byte 1 up to the trailing terminator. Padding NULs
/// after the terminator are dropped as well.
///
/// # Example
/// ```
/// use protocol::{Command, decode_ascii};
///
/// let name = decode_ascii(Command::ReadSensorType, b"\xf6SP-420!").unwrap();
/// assert_eq!(name, "SP-420");
/// ```
pub fn decode_ascii(command: Command, response: &[u8]) -> Result<String> {
    validate(command, response)?;

    let mut payload = &response[1..];
    while let [rest @ .., 0] = payload {
        payload = rest;
    }
    if let [rest @ .., TERMINATOR] = payload {
        payload = rest;
    }

    Ok(String::from_utf8_lossy(payload).into_owned())
}

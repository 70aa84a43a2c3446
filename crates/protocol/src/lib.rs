//! Wire protocol for the SP-420 light sensor
//!
//! This crate defines the command table and the pure encode/decode functions
//! used to talk to the sensor over its USB bulk endpoints. It has no transport
//! dependency and no state.
//!
//! # Example
//!
//! ```
//! use protocol::{Command, decode_single, encode, encode_float_param};
//!
//! // Request
//! let request = encode(Command::ReadVoltage, &[]).unwrap();
//! assert_eq!(request, b"U!");
//!
//! // Response: echoed opcode followed by a byte-reversed float
//! let mut response = vec![b'U'];
//! response.extend_from_slice(&encode_float_param(1.25));
//! assert_eq!(decode_single(Command::ReadVoltage, &response).unwrap(), 1.25);
//! ```

pub mod codec;
pub mod command;
pub mod error;

pub use codec::{
    FLOAT_LEN, decode_ascii, decode_float, decode_pair, decode_single, decode_u8, encode,
    encode_float_param, read_float, validate,
};
pub use command::{Command, CommandSpec, TERMINATOR};
pub use error::{ProtocolError, Result};

/// USB vendor id of the sensor
pub const VENDOR_ID: u16 = 0x1916;

/// USB product id of the SP-420
pub const PRODUCT_ID: u16 = 0x0031;

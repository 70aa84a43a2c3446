//! Byte-level transport to one sensor
//!
//! A transport owns one open USB interface of one physical device. The
//! [`Transport`] trait is the capability set the [`crate::Device`] needs; the
//! hardware variant lives in [`crate::usb`], an in-memory variant in
//! `test_utils`.

use crate::Result;
use std::fmt::Write as _;
use std::time::Duration;

/// Timeout applied to every endpoint operation
pub const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(3);

/// Lifecycle of a transport: closed -> opening -> open -> closed (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    /// Created, never opened
    #[default]
    Idle,
    /// Acquiring USB resources
    Opening,
    /// Endpoints bound, ready for transfers
    Open,
    /// Resources released; cannot be reopened
    Closed,
}

/// Blocking byte transport with bounded timeouts
///
/// Write and read failures (timeouts included) are reported, never retried.
/// `close` is idempotent.
pub trait Transport: Send {
    /// Acquire the device; `debug` enables payload logging
    fn open(&mut self, debug: bool) -> Result<()>;

    /// Whether transfers can be issued
    fn is_open(&self) -> bool;

    /// Whether payload logging is enabled
    fn is_debug(&self) -> bool;

    /// Write a request to the OUT endpoint
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Read a response from the IN endpoint into `buffer`
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Release every USB resource still held
    fn close(&mut self) -> Result<()>;
}

/// Lowercase hex rendering used by debug logging
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(b"U!"), "5521");
        assert_eq!(hex_dump(&[0x00, 0x0f, 0xf6]), "000ff6");
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn test_default_state() {
        assert_eq!(TransportState::default(), TransportState::Idle);
    }
}

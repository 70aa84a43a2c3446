//! SP-420 command table
//!
//! Every operation the sensor understands is a short ASCII/binary string that
//! starts with a one-byte opcode and ends with [`TERMINATOR`]. The device echoes
//! the opcode as the first byte of its response, which is what
//! [`crate::validate`] checks.
//!
//! The table is static: a [`Command`] maps to exactly one [`CommandSpec`].

use std::fmt;

/// Byte that terminates every outgoing command
pub const TERMINATOR: u8 = b'!';

/// Commands understood by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Read the current raw voltage (`U!`)
    ReadVoltage,
    /// Read the user calibration (multiplier, offset)
    ReadCalibration,
    /// Write the user calibration; the device echoes the stored values
    SetCalibration,
    /// Read the serial number (encoded by the device as a float)
    ReadSerial,
    /// Read the firmware version
    ReadFirmwareVersion,
    /// Read the ASCII sensor type
    ReadSensorType,
    /// Read the factory calibration (multiplier, offset)
    ReadPermanentCalibration,
}

/// Static description of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// First byte of the request, echoed as the first byte of the response
    pub opcode: u8,
    /// Number of 4-byte float parameters placed between opcode and terminator
    pub float_params: usize,
    /// Size of the response buffer the device fills
    pub response_len: usize,
}

impl Command {
    /// Every command, in table order
    pub const ALL: [Command; 7] = [
        Command::ReadVoltage,
        Command::ReadCalibration,
        Command::SetCalibration,
        Command::ReadSerial,
        Command::ReadFirmwareVersion,
        Command::ReadSensorType,
        Command::ReadPermanentCalibration,
    ];

    /// Table entry for this command
    pub const fn spec(self) -> CommandSpec {
        match self {
            Command::ReadVoltage => CommandSpec {
                opcode: b'U',
                float_params: 0,
                response_len: 5,
            },
            Command::ReadCalibration => CommandSpec {
                opcode: 0x83,
                float_params: 0,
                response_len: 9,
            },
            Command::SetCalibration => CommandSpec {
                opcode: 0x84,
                float_params: 2,
                response_len: 9,
            },
            Command::ReadSerial => CommandSpec {
                opcode: 0x87,
                float_params: 0,
                response_len: 5,
            },
            Command::ReadFirmwareVersion => CommandSpec {
                opcode: 0xf5,
                float_params: 0,
                response_len: 4,
            },
            Command::ReadSensorType => CommandSpec {
                opcode: 0xf6,
                float_params: 0,
                response_len: 9,
            },
            Command::ReadPermanentCalibration => CommandSpec {
                opcode: 0x85,
                float_params: 0,
                response_len: 9,
            },
        }
    }

    /// Request opcode, also the expected response prefix
    pub const fn opcode(self) -> u8 {
        self.spec().opcode
    }

    /// Expected response length in bytes
    pub const fn response_len(self) -> usize {
        self.spec().response_len
    }

    /// Number of float parameters the request carries
    pub const fn param_count(self) -> usize {
        self.spec().float_params
    }

    /// Look up a command by its opcode
    pub fn from_opcode(opcode: u8) -> Option<Command> {
        Self::ALL.into_iter().find(|c| c.opcode() == opcode)
    }

    /// Short human readable name, used in logs and errors
    pub const fn name(self) -> &'static str {
        match self {
            Command::ReadVoltage => "read-voltage",
            Command::ReadCalibration => "read-calibration",
            Command::SetCalibration => "set-calibration",
            Command::ReadSerial => "read-serial",
            Command::ReadFirmwareVersion => "read-firmware-version",
            Command::ReadSensorType => "read-sensor-type",
            Command::ReadPermanentCalibration => "read-permanent-calibration",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_opcodes_are_unique() {
        let opcodes: HashSet<u8> = Command::ALL.iter().map(|c| c.opcode()).collect();
        assert_eq!(opcodes.len(), Command::ALL.len());
    }

    #[test]
    fn test_response_sizes() {
        assert_eq!(Command::ReadVoltage.response_len(), 5);
        assert_eq!(Command::ReadCalibration.response_len(), 9);
        assert_eq!(Command::SetCalibration.response_len(), 9);
        assert_eq!(Command::ReadSerial.response_len(), 5);
        assert_eq!(Command::ReadFirmwareVersion.response_len(), 4);
        assert_eq!(Command::ReadSensorType.response_len(), 9);
        assert_eq!(Command::ReadPermanentCalibration.response_len(), 9);
    }

    #[test]
    fn test_from_opcode() {
        for command in Command::ALL {
            assert_eq!(Command::from_opcode(command.opcode()), Some(command));
        }
        assert_eq!(Command::from_opcode(0x00), None);
    }

    #[test]
    fn test_only_set_calibration_takes_params() {
        for command in Command::ALL {
            let expected = if command == Command::SetCalibration { 2 } else { 0 };
            assert_eq!(command.param_count(), expected, "{}", command);
        }
    }
}

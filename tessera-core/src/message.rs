//! Packet commands.
//!
//! Uses proper enums with `TryFrom` so unknown values surface as errors.

use std::fmt;

use crate::error::TesseraError;

/// Everything a node sends to another node.
///
/// - `0x0001..0x00FF`: link-level (heartbeat)
/// - `0x0100..0x01FF`: frame data replication
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Keep-alive, empty payload.
    Ping = 0x0001,
    /// One image for a frame data version (`TransmitHeader` + blocks).
    FrameDataTransmit = 0x0101,
    /// A frame data version is complete (`ReadySignal`).
    FrameDataReady = 0x0102,
}

impl TryFrom<u32> for Command {
    type Error = TesseraError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Command::Ping),
            0x0101 => Ok(Command::FrameDataTransmit),
            0x0102 => Ok(Command::FrameDataReady),
            _ => Err(TesseraError::UnknownVariant {
                type_name: "Command",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Command {
    /// Whether packets of this command carry frame data.
    pub fn is_frame_data(&self) -> bool {
        matches!(self, Command::FrameDataTransmit | Command::FrameDataReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrip() {
        for cmd in [Command::Ping, Command::FrameDataTransmit, Command::FrameDataReady] {
            assert_eq!(Command::try_from(cmd as u32).unwrap(), cmd);
        }
    }

    #[test]
    fn command_invalid() {
        assert!(Command::try_from(0xDEAD).is_err());
    }

    #[test]
    fn ping_is_not_frame_data() {
        assert!(!Command::Ping.is_frame_data());
        assert!(Command::FrameDataReady.is_frame_data());
    }
}

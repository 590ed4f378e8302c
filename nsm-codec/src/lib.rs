//! Encoders and decoders for the NVIDIA System Management (NSM) protocol.
//!
//! NSM messages travel over MCTP as PCI vendor-defined messages. Every
//! message starts with a five-byte header carrying the NVIDIA PCI vendor id,
//! the instance id, the message class bits and the NVIDIA message type;
//! the payload layout depends on the command. This crate is pure: every
//! function takes or returns byte buffers and never performs I/O.
//!
//! Decoding distinguishes two failure planes. A malformed buffer (too short,
//! wrong `data_size`, bad vendor id) is a [`CodecError`]. A well-formed
//! response whose completion code is not `SUCCESS` is *not* an error: it
//! decodes to [`Response::Failed`] carrying the completion and reason codes,
//! because the device answered, just not with data.

use thiserror::Error;

pub mod aggregate;
pub mod capability;
pub mod environmental;
pub mod events;
mod header;
pub mod pci;
mod wire;

pub use header::{pack_header, unpack_header, HeaderInfo, HDR_LEN};
pub use wire::Bitmap256;

/// PCI vendor id for NVIDIA, big-endian on the wire.
pub const PCI_VENDOR_ID: u16 = 0x10de;

pub const OCP_TYPE: u8 = 8;
pub const OCP_VERSION: u8 = 9;

/// Instance ids occupy five bits.
pub const INSTANCE_ID_MAX: u8 = 31;
pub(crate) const INSTANCE_ID_MASK: u8 = 0x1f;

/// `command(1) + data_size(1)`
pub const REQUEST_CONVENTION_LEN: usize = 2;
/// `command(1) + completion_code(1) + reserved(2) + data_size(2)`
pub const RESPONSE_CONVENTION_LEN: usize = 6;
/// `command(1) + completion_code(1) + reason_code(2)`
pub const RESPONSE_ERROR_LEN: usize = 4;
/// The shortest valid response is the non-success form.
pub const RESPONSE_MIN_LEN: usize = RESPONSE_ERROR_LEN;

/// NSM message types, carried in the `nvidia_msg_type` header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    DeviceCapabilityDiscovery = 0,
    NetworkPort = 1,
    PciLink = 2,
    PlatformEnvironmental = 3,
    Diagnostic = 4,
    DeviceConfiguration = 5,
    Firmware = 6,
}

impl MessageType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::DeviceCapabilityDiscovery),
            1 => Some(Self::NetworkPort),
            2 => Some(Self::PciLink),
            3 => Some(Self::PlatformEnvironmental),
            4 => Some(Self::Diagnostic),
            5 => Some(Self::DeviceConfiguration),
            6 => Some(Self::Firmware),
            _ => None,
        }
    }
}

/// Message class, derived from the `(request, datagram)` header bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `(1, 0)`
    Request,
    /// `(0, 0)`
    Response,
    /// `(1, 1)`
    Event,
    /// `(0, 1)`
    EventAcknowledgment,
}

/// Per-response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionCode {
    Success,
    Error,
    InvalidData,
    InvalidDataLength,
    NotReady,
    UnsupportedCommandCode,
    UnsupportedMsgType,
    /// Long-running command accepted; completion arrives as an event.
    Accepted,
    Busy,
    BusAccess,
    /// A code this crate does not know about.
    Other(u8),
}

impl CompletionCode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::Success,
            0x01 => Self::Error,
            0x02 => Self::InvalidData,
            0x03 => Self::InvalidDataLength,
            0x04 => Self::NotReady,
            0x05 => Self::UnsupportedCommandCode,
            0x06 => Self::UnsupportedMsgType,
            0x7d => Self::Accepted,
            0x7e => Self::Busy,
            0x7f => Self::BusAccess,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::Error => 0x01,
            Self::InvalidData => 0x02,
            Self::InvalidDataLength => 0x03,
            Self::NotReady => 0x04,
            Self::UnsupportedCommandCode => 0x05,
            Self::UnsupportedMsgType => 0x06,
            Self::Accepted => 0x7d,
            Self::Busy => 0x7e,
            Self::BusAccess => 0x7f,
            Self::Other(other) => other,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl std::fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(raw) => write!(f, "unknown(0x{raw:02x})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Two-byte sub-status attached to non-success responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReasonCode(pub u16);

impl ReasonCode {
    pub const NONE: Self = Self(0x00);
    pub const INVALID_PCI: Self = Self(0x01);
    pub const INVALID_RQD: Self = Self(0x02);
    pub const TIMEOUT: Self = Self(0x03);
    pub const DOWNSTREAM_TIMEOUT: Self = Self(0x04);
    pub const I2C_NACK_FROM_DEV_ADDR: Self = Self(0x05);
    pub const I2C_NACK_FROM_DEV_CMD_DATA: Self = Self(0x06);
    pub const I2C_NACK_FROM_DEV_ADDR_RS: Self = Self(0x07);
    pub const NVLINK_PORT_INVALID: Self = Self(0x08);
    pub const NVLINK_PORT_DISABLED: Self = Self(0x09);
    pub const NOT_SUPPORTED: Self = Self(0x0a);
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::NONE => "none",
            Self::INVALID_PCI => "invalid PCI",
            Self::INVALID_RQD => "invalid RQD",
            Self::TIMEOUT => "timeout",
            Self::DOWNSTREAM_TIMEOUT => "downstream timeout",
            Self::I2C_NACK_FROM_DEV_ADDR => "I2C NACK from device address",
            Self::I2C_NACK_FROM_DEV_CMD_DATA => "I2C NACK from device command data",
            Self::I2C_NACK_FROM_DEV_ADDR_RS => "I2C NACK from device address (RS)",
            Self::NVLINK_PORT_INVALID => "NVLink port invalid",
            Self::NVLINK_PORT_DISABLED => "NVLink port disabled",
            Self::NOT_SUPPORTED => "not supported",
            Self(other) => return write!(f, "0x{other:04x}"),
        };
        f.write_str(name)
    }
}

/// Outcome of decoding a well-formed response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response<T> {
    Success(T),
    /// The device returned a non-success completion code; the payload is the
    /// truncated `(cc, reason)` form and carries no data.
    Failed { cc: CompletionCode, reason: ReasonCode },
}

impl<T> Response<T> {
    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failed { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        match self {
            Self::Success(value) => Response::Success(f(value)),
            Self::Failed { cc, reason } => Response::Failed { cc, reason },
        }
    }
}

/// A buffer that could not be decoded.
///
/// `Length` corresponds to a message shorter than its structural minimum,
/// `Data` to a field whose value contradicts the layout (bad vendor id,
/// `data_size` mismatch, out-of-range instance id, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("message too short: need {need} bytes, have {have}")]
    Length { need: usize, have: usize },
    #[error("malformed message: {0}")]
    Data(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_code_raw_round_trip() {
        for raw in 0u8..=0xff {
            assert_eq!(CompletionCode::from_raw(raw).raw(), raw);
        }
    }

    #[test]
    fn accepted_and_busy_are_not_success() {
        assert!(!CompletionCode::Accepted.is_success());
        assert!(!CompletionCode::Busy.is_success());
        assert!(CompletionCode::from_raw(0).is_success());
    }
}

//! Event, event-acknowledgement and long-running messages.
//!
//! Events are datagrams: the device originates them, nothing correlates them
//! with an instance id. A long-running command completion is a special event
//! whose two-byte `event_state` field carries the `(nvidia_msg_type,
//! command)` pair of the original request and whose data leads with the
//! request's instance id and final completion code.

use crate::wire::{Reader, Writer};
use crate::{
    pack_header, unpack_header, CodecError, CompletionCode, HeaderInfo, MessageKind, ReasonCode,
    Response, HDR_LEN,
};

pub const EVENT_VERSION: u8 = 0;

/// `version/ackr byte + event id + class + state(2) + data size`
pub const EVENT_MIN_LEN: usize = 6;
pub const EVENT_DATA_MAX_LEN: usize = 256;

// Device capability discovery (type 0) event ids.
pub const REDISCOVERY_EVENT: u8 = 0x00;
pub const LONG_RUNNING_EVENT: u8 = 0x02;

// Platform environmental (type 3) event ids.
pub const RESET_REQUIRED_EVENT: u8 = 0x00;
pub const XID_EVENT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    General,
    AssertionDeassertion,
    NvidiaGeneral,
    Other(u8),
}

impl EventClass {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::General,
            0x01 => Self::AssertionDeassertion,
            0x80 => Self::NvidiaGeneral,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::General => 0x00,
            Self::AssertionDeassertion => 0x01,
            Self::NvidiaGeneral => 0x80,
            Self::Other(other) => other,
        }
    }
}

/// A decoded event message, borrowing its payload from the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<'a> {
    pub instance_id: u8,
    pub msg_type: u8,
    pub version: u8,
    /// The device requests an acknowledgement.
    pub ackr: bool,
    pub event_id: u8,
    pub event_class: EventClass,
    pub event_state: u16,
    pub data: &'a [u8],
}

#[allow(clippy::too_many_arguments)]
pub fn encode_event(
    instance_id: u8,
    msg_type: u8,
    ackr: bool,
    version: u8,
    event_id: u8,
    event_class: EventClass,
    event_state: u16,
    data: &[u8],
) -> Result<Vec<u8>, CodecError> {
    if data.len() > EVENT_DATA_MAX_LEN {
        return Err(CodecError::Data("event data too long"));
    }
    let mut writer = Writer::new();
    let info = HeaderInfo { kind: MessageKind::Event, instance_id, msg_type };
    pack_header(&info, writer.buf_mut())?;
    Ok(writer
        .u8(version & 0x0f | (ackr as u8) << 4)
        .u8(event_id)
        .u8(event_class.raw())
        .u16(event_state)
        .u8(data.len() as u8)
        .bytes(data)
        .into_vec())
}

pub fn decode_event(msg: &[u8]) -> Result<Event<'_>, CodecError> {
    let header = unpack_header(msg)?;
    if header.kind != MessageKind::Event {
        return Err(CodecError::Data("not an event"));
    }
    let payload = &msg[HDR_LEN..];
    if payload.len() < EVENT_MIN_LEN {
        return Err(CodecError::Length { need: HDR_LEN + EVENT_MIN_LEN, have: msg.len() });
    }

    let mut reader = Reader::new(payload);
    let first = reader.u8()?;
    let event_id = reader.u8()?;
    let event_class = EventClass::from_raw(reader.u8()?);
    let event_state = reader.u16()?;
    let data_size = usize::from(reader.u8()?);
    let data = reader.bytes(data_size)?;

    Ok(Event {
        instance_id: header.instance_id,
        msg_type: header.msg_type,
        version: first & 0x0f,
        ackr: first >> 4 & 1 != 0,
        event_id,
        event_class,
        event_state,
        data,
    })
}

pub fn encode_event_acknowledgement(
    instance_id: u8,
    msg_type: u8,
    event_id: u8,
) -> Result<Vec<u8>, CodecError> {
    let mut writer = Writer::new();
    let info = HeaderInfo { kind: MessageKind::EventAcknowledgment, instance_id, msg_type };
    pack_header(&info, writer.buf_mut())?;
    Ok(writer.u8(event_id).into_vec())
}

/// Returns `(instance_id, msg_type, event_id)`.
pub fn decode_event_acknowledgement(msg: &[u8]) -> Result<(u8, u8, u8), CodecError> {
    let header = unpack_header(msg)?;
    if header.kind != MessageKind::EventAcknowledgment {
        return Err(CodecError::Data("not an event acknowledgement"));
    }
    if msg.len() < HDR_LEN + 1 {
        return Err(CodecError::Length { need: HDR_LEN + 1, have: msg.len() });
    }
    Ok((header.instance_id, header.msg_type, msg[HDR_LEN]))
}

/// Final outcome of a long-running command, delivered as an event.
#[derive(Debug, Clone, PartialEq)]
pub struct LongRunningResult {
    /// Instance id of the request this event completes.
    pub instance_id: u8,
    /// Terminal completion code with any response data, or the failure pair.
    pub outcome: Response<Vec<u8>>,
}

pub fn encode_long_running_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    msg_type: u8,
    command: u8,
    data: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let event_state = u16::from(msg_type) | u16::from(command) << 8;
    let mut body = Writer::new()
        .u8(instance_id)
        .u8(cc.raw());
    if cc.is_success() {
        body = body.u16(0).bytes(data);
    } else {
        body = body.u16(reason.0);
    }
    let body = body.into_vec();
    encode_event(
        instance_id,
        crate::MessageType::DeviceCapabilityDiscovery as u8,
        false,
        EVENT_VERSION,
        LONG_RUNNING_EVENT,
        EventClass::NvidiaGeneral,
        event_state,
        &body,
    )
}

/// Decode a long-running completion event, checking that its `event_state`
/// names the expected `(msg_type, command)` pair.
pub fn decode_long_running_resp(
    msg: &[u8],
    msg_type: u8,
    command: u8,
) -> Result<LongRunningResult, CodecError> {
    let event = decode_event(msg)?;
    if event.event_id != LONG_RUNNING_EVENT {
        return Err(CodecError::Data("not a long-running event"));
    }
    let state_msg_type = (event.event_state & 0xff) as u8;
    let state_command = (event.event_state >> 8) as u8;
    if state_msg_type != msg_type || state_command != command {
        return Err(CodecError::Data("long-running state mismatch"));
    }

    let mut reader = Reader::new(event.data);
    let instance_id = reader.u8()?;
    let cc = CompletionCode::from_raw(reader.u8()?);
    if cc.is_success() {
        reader.u16()?;
        let data = reader.remaining().to_vec();
        Ok(LongRunningResult { instance_id, outcome: Response::Success(data) })
    } else {
        let reason = ReasonCode(reader.u16()?);
        Ok(LongRunningResult { instance_id, outcome: Response::Failed { cc, reason } })
    }
}

/// Payload of the platform environmental XID event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XidEventPayload {
    pub flag: u8,
    pub reason: u32,
    pub sequence_number: u32,
    /// Microseconds, device monotonic clock.
    pub timestamp: u64,
}

pub fn decode_xid_event_payload(data: &[u8]) -> Result<XidEventPayload, CodecError> {
    let mut reader = Reader::new(data);
    let flag = reader.u8()?;
    reader.bytes(3)?;
    Ok(XidEventPayload {
        flag,
        reason: reader.u32()?,
        sequence_number: reader.u32()?,
        timestamp: reader.u64()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trip() {
        let msg = encode_event(
            0,
            0,
            true,
            EVENT_VERSION,
            REDISCOVERY_EVENT,
            EventClass::General,
            0,
            &[],
        )
        .unwrap();
        let event = decode_event(&msg).unwrap();
        assert_eq!(event.event_id, REDISCOVERY_EVENT);
        assert_eq!(event.event_class, EventClass::General);
        assert!(event.ackr);
        assert!(event.data.is_empty());
    }

    #[test]
    fn event_with_data_round_trip() {
        let msg = encode_event(
            3,
            3,
            false,
            EVENT_VERSION,
            XID_EVENT,
            EventClass::NvidiaGeneral,
            0x1234,
            &[1, 2, 3, 4],
        )
        .unwrap();
        let event = decode_event(&msg).unwrap();
        assert_eq!(event.msg_type, 3);
        assert_eq!(event.event_state, 0x1234);
        assert_eq!(event.data, &[1, 2, 3, 4]);
    }

    #[test]
    fn truncated_event_data_is_rejected() {
        let mut msg = encode_event(
            0,
            3,
            false,
            EVENT_VERSION,
            XID_EVENT,
            EventClass::NvidiaGeneral,
            0,
            &[1, 2, 3, 4],
        )
        .unwrap();
        msg.truncate(msg.len() - 2);
        assert!(decode_event(&msg).is_err());
    }

    #[test]
    fn event_ack_round_trip() {
        let msg = encode_event_acknowledgement(4, 0, REDISCOVERY_EVENT).unwrap();
        assert_eq!(decode_event_acknowledgement(&msg).unwrap(), (4, 0, REDISCOVERY_EVENT));
    }

    #[test]
    fn long_running_success_round_trip() {
        let msg = encode_long_running_resp(
            9,
            CompletionCode::Success,
            ReasonCode::NONE,
            3,
            0x7c,
            &[0xaa],
        )
        .unwrap();
        let result = decode_long_running_resp(&msg, 3, 0x7c).unwrap();
        assert_eq!(result.instance_id, 9);
        assert_eq!(result.outcome, Response::Success(vec![0xaa]));
    }

    #[test]
    fn long_running_failure_round_trip() {
        let msg = encode_long_running_resp(
            2,
            CompletionCode::Error,
            ReasonCode::NOT_SUPPORTED,
            3,
            0x7c,
            &[],
        )
        .unwrap();
        let result = decode_long_running_resp(&msg, 3, 0x7c).unwrap();
        assert_eq!(
            result.outcome,
            Response::Failed { cc: CompletionCode::Error, reason: ReasonCode::NOT_SUPPORTED }
        );
    }

    #[test]
    fn long_running_state_mismatch_is_rejected() {
        let msg = encode_long_running_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            3,
            0x7c,
            &[],
        )
        .unwrap();
        assert!(decode_long_running_resp(&msg, 3, 0x4e).is_err());
    }

    #[test]
    fn xid_payload_decode() {
        let data = [
            0x01, 0, 0, 0, 0x2a, 0, 0, 0, 0x07, 0, 0, 0, 0x10, 0x20, 0, 0, 0, 0, 0, 0,
        ];
        let payload = decode_xid_event_payload(&data).unwrap();
        assert_eq!(payload.flag, 1);
        assert_eq!(payload.reason, 42);
        assert_eq!(payload.sequence_number, 7);
        assert_eq!(payload.timestamp, 0x2010);
    }
}

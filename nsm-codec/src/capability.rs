//! Device capability discovery commands (NSM type 0).

use crate::wire::{self, Bitmap256, Frame, Reader};
use crate::{CodecError, CompletionCode, MessageType, ReasonCode, Response};

const MSG_TYPE: u8 = MessageType::DeviceCapabilityDiscovery as u8;

pub const PING: u8 = 0x00;
pub const SUPPORTED_NVIDIA_MESSAGE_TYPES: u8 = 0x01;
pub const SUPPORTED_COMMAND_CODES: u8 = 0x02;
pub const GET_SUPPORTED_EVENT_SOURCES: u8 = 0x03;
pub const GET_CURRENT_EVENT_SOURCES: u8 = 0x04;
pub const SET_CURRENT_EVENT_SOURCES: u8 = 0x05;
pub const SET_EVENT_SUBSCRIPTION: u8 = 0x06;
pub const GET_EVENT_SUBSCRIPTION: u8 = 0x07;
pub const GET_EVENT_LOG_RECORD: u8 = 0x08;
pub const QUERY_DEVICE_IDENTIFICATION: u8 = 0x09;
pub const CONFIGURE_EVENT_ACKNOWLEDGEMENT: u8 = 0x0a;
pub const GET_HISTOGRAM_FORMAT: u8 = 0x0d;
pub const GET_HISTOGRAM_DATA: u8 = 0x0e;

/// What a device reports itself to be in Query Device Identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Gpu,
    Switch,
    PcieBridge,
    Baseboard,
    Erot,
    Unknown(u8),
}

impl DeviceKind {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Gpu,
            1 => Self::Switch,
            2 => Self::PcieBridge,
            3 => Self::Baseboard,
            4 => Self::Erot,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::Gpu => 0,
            Self::Switch => 1,
            Self::PcieBridge => 2,
            Self::Baseboard => 3,
            Self::Erot => 4,
            Self::Unknown(other) => other,
        }
    }
}

// Ping

pub fn encode_ping_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, PING, 0)?.into_vec())
}

pub fn encode_ping_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, PING, cc, reason);
    }
    Ok(wire::response(instance_id, MSG_TYPE, PING, 0)?.into_vec())
}

pub fn decode_ping_resp(msg: &[u8]) -> Result<Response<()>, CodecError> {
    match wire::parse_sized_response(msg, PING, 0)? {
        Frame::Ok(_) => Ok(Response::Success(())),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Get Supported NVIDIA Message Types

pub fn encode_get_supported_nvidia_message_types_req(
    instance_id: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, SUPPORTED_NVIDIA_MESSAGE_TYPES, 0)?.into_vec())
}

pub fn encode_get_supported_nvidia_message_types_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    types: &Bitmap256,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(
            instance_id,
            MSG_TYPE,
            SUPPORTED_NVIDIA_MESSAGE_TYPES,
            cc,
            reason,
        );
    }
    Ok(wire::response(instance_id, MSG_TYPE, SUPPORTED_NVIDIA_MESSAGE_TYPES, 32)?
        .bytes(&types.0)
        .into_vec())
}

pub fn decode_get_supported_nvidia_message_types_resp(
    msg: &[u8],
) -> Result<Response<Bitmap256>, CodecError> {
    match wire::parse_sized_response(msg, SUPPORTED_NVIDIA_MESSAGE_TYPES, 32)? {
        Frame::Ok(resp) => Ok(Response::Success(Bitmap256::from_wire(resp.data)?)),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Get Supported Command Codes

pub fn encode_get_supported_command_codes_req(
    instance_id: u8,
    nvidia_msg_type: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, SUPPORTED_COMMAND_CODES, 1)?
        .u8(nvidia_msg_type)
        .into_vec())
}

pub fn decode_get_supported_command_codes_req(msg: &[u8]) -> Result<u8, CodecError> {
    let req = wire::parse_request(msg, SUPPORTED_COMMAND_CODES)?;
    if req.data_size < 1 || req.data.is_empty() {
        return Err(CodecError::Data("missing message type"));
    }
    Ok(req.data[0])
}

pub fn encode_get_supported_command_codes_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    codes: &Bitmap256,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, SUPPORTED_COMMAND_CODES, cc, reason);
    }
    Ok(wire::response(instance_id, MSG_TYPE, SUPPORTED_COMMAND_CODES, 32)?
        .bytes(&codes.0)
        .into_vec())
}

pub fn decode_get_supported_command_codes_resp(
    msg: &[u8],
) -> Result<Response<Bitmap256>, CodecError> {
    match wire::parse_sized_response(msg, SUPPORTED_COMMAND_CODES, 32)? {
        Frame::Ok(resp) => Ok(Response::Success(Bitmap256::from_wire(resp.data)?)),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Event sources. Get Supported / Get Current share the request and
// response shapes; only the command byte differs.

pub fn encode_get_supported_event_sources_req(
    instance_id: u8,
    nvidia_msg_type: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_SUPPORTED_EVENT_SOURCES, 1)?
        .u8(nvidia_msg_type)
        .into_vec())
}

pub fn encode_get_current_event_sources_req(
    instance_id: u8,
    nvidia_msg_type: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_CURRENT_EVENT_SOURCES, 1)?
        .u8(nvidia_msg_type)
        .into_vec())
}

pub fn encode_event_sources_resp(
    instance_id: u8,
    command: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    sources: &Bitmap256,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, command, cc, reason);
    }
    Ok(wire::response(instance_id, MSG_TYPE, command, 32)?.bytes(&sources.0).into_vec())
}

pub fn decode_event_sources_resp(
    msg: &[u8],
    command: u8,
) -> Result<Response<Bitmap256>, CodecError> {
    match wire::parse_sized_response(msg, command, 32)? {
        Frame::Ok(resp) => Ok(Response::Success(Bitmap256::from_wire(resp.data)?)),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

pub fn encode_set_current_event_sources_req(
    instance_id: u8,
    nvidia_msg_type: u8,
    sources: &Bitmap256,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, SET_CURRENT_EVENT_SOURCES, 33)?
        .u8(nvidia_msg_type)
        .bytes(&sources.0)
        .into_vec())
}

pub fn decode_set_current_event_sources_resp(msg: &[u8]) -> Result<Response<()>, CodecError> {
    match wire::parse_sized_response(msg, SET_CURRENT_EVENT_SOURCES, 0)? {
        Frame::Ok(_) => Ok(Response::Success(())),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Event subscription

pub fn encode_set_event_subscription_req(
    instance_id: u8,
    global_setting: u8,
    receiver_eid: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, SET_EVENT_SUBSCRIPTION, 2)?
        .u8(global_setting)
        .u8(receiver_eid)
        .into_vec())
}

pub fn decode_set_event_subscription_req(msg: &[u8]) -> Result<(u8, u8), CodecError> {
    let req = wire::parse_request(msg, SET_EVENT_SUBSCRIPTION)?;
    if req.data_size < 2 || req.data.len() < 2 {
        return Err(CodecError::Data("missing subscription fields"));
    }
    Ok((req.data[0], req.data[1]))
}

pub fn decode_set_event_subscription_resp(msg: &[u8]) -> Result<Response<()>, CodecError> {
    match wire::parse_sized_response(msg, SET_EVENT_SUBSCRIPTION, 0)? {
        Frame::Ok(_) => Ok(Response::Success(())),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

pub fn encode_get_event_subscription_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_EVENT_SUBSCRIPTION, 0)?.into_vec())
}

pub fn encode_get_event_subscription_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    global_setting: u8,
    receiver_eid: u8,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, GET_EVENT_SUBSCRIPTION, cc, reason);
    }
    Ok(wire::response(instance_id, MSG_TYPE, GET_EVENT_SUBSCRIPTION, 2)?
        .u8(global_setting)
        .u8(receiver_eid)
        .into_vec())
}

pub fn decode_get_event_subscription_resp(msg: &[u8]) -> Result<Response<(u8, u8)>, CodecError> {
    match wire::parse_sized_response(msg, GET_EVENT_SUBSCRIPTION, 2)? {
        Frame::Ok(resp) => Ok(Response::Success((resp.data[0], resp.data[1]))),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Configure event acknowledgement

pub fn encode_configure_event_acknowledgement_req(
    instance_id: u8,
    nvidia_msg_type: u8,
    sources: &Bitmap256,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, CONFIGURE_EVENT_ACKNOWLEDGEMENT, 33)?
        .u8(nvidia_msg_type)
        .bytes(&sources.0)
        .into_vec())
}

pub fn encode_configure_event_acknowledgement_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    sources: &Bitmap256,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(
            instance_id,
            MSG_TYPE,
            CONFIGURE_EVENT_ACKNOWLEDGEMENT,
            cc,
            reason,
        );
    }
    Ok(wire::response(instance_id, MSG_TYPE, CONFIGURE_EVENT_ACKNOWLEDGEMENT, 32)?
        .bytes(&sources.0)
        .into_vec())
}

pub fn decode_configure_event_acknowledgement_resp(
    msg: &[u8],
) -> Result<Response<Bitmap256>, CodecError> {
    match wire::parse_sized_response(msg, CONFIGURE_EVENT_ACKNOWLEDGEMENT, 32)? {
        Frame::Ok(resp) => Ok(Response::Success(Bitmap256::from_wire(resp.data)?)),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Get Event Log Record

/// A single record from the device event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogRecord {
    pub nvidia_msg_type: u8,
    pub event_id: u8,
    pub event_handle: u32,
    /// Microseconds, device monotonic clock.
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

/// Fixed part of the record: type + id + handle + timestamp.
const EVENT_LOG_RECORD_MIN: usize = 1 + 1 + 4 + 8;

pub fn encode_get_event_log_record_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_EVENT_LOG_RECORD, 0)?.into_vec())
}

pub fn encode_get_event_log_record_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    record: &EventLogRecord,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, GET_EVENT_LOG_RECORD, cc, reason);
    }
    let data_size = EVENT_LOG_RECORD_MIN + record.payload.len();
    Ok(wire::response(instance_id, MSG_TYPE, GET_EVENT_LOG_RECORD, data_size as u16)?
        .u8(record.nvidia_msg_type)
        .u8(record.event_id)
        .u32(record.event_handle)
        .u64(record.timestamp)
        .bytes(&record.payload)
        .into_vec())
}

/// The payload length is derived from the response `data_size`, so this is
/// the one decoder that cannot use the exact-size check.
pub fn decode_get_event_log_record_resp(
    msg: &[u8],
) -> Result<Response<EventLogRecord>, CodecError> {
    let resp = match wire::parse_response(msg)? {
        Frame::Ok(resp) => resp,
        Frame::Failed { cc, reason } => return Ok(Response::Failed { cc, reason }),
    };
    if resp.command != GET_EVENT_LOG_RECORD {
        return Err(CodecError::Data("unexpected command"));
    }
    let data_size = usize::from(resp.data_size);
    if data_size < EVENT_LOG_RECORD_MIN {
        return Err(CodecError::Data("event log record too short"));
    }
    if resp.data.len() < data_size {
        return Err(CodecError::Length { need: data_size, have: resp.data.len() });
    }

    let mut reader = Reader::new(resp.data);
    let nvidia_msg_type = reader.u8()?;
    let event_id = reader.u8()?;
    let event_handle = reader.u32()?;
    let timestamp = reader.u64()?;
    let payload = reader.bytes(data_size - EVENT_LOG_RECORD_MIN)?.to_vec();

    Ok(Response::Success(EventLogRecord {
        nvidia_msg_type,
        event_id,
        event_handle,
        timestamp,
        payload,
    }))
}

// Query Device Identification

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentification {
    pub kind: DeviceKind,
    pub instance: u8,
}

pub fn encode_query_device_identification_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, QUERY_DEVICE_IDENTIFICATION, 0)?.into_vec())
}

pub fn encode_query_device_identification_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    identification: DeviceIdentification,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(
            instance_id,
            MSG_TYPE,
            QUERY_DEVICE_IDENTIFICATION,
            cc,
            reason,
        );
    }
    Ok(wire::response(instance_id, MSG_TYPE, QUERY_DEVICE_IDENTIFICATION, 2)?
        .u8(identification.kind.raw())
        .u8(identification.instance)
        .into_vec())
}

pub fn decode_query_device_identification_resp(
    msg: &[u8],
) -> Result<Response<DeviceIdentification>, CodecError> {
    match wire::parse_sized_response(msg, QUERY_DEVICE_IDENTIFICATION, 2)? {
        Frame::Ok(resp) => Ok(Response::Success(DeviceIdentification {
            kind: DeviceKind::from_raw(resp.data[0]),
            instance: resp.data[1],
        })),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Histograms

/// Width/signedness of histogram bucket values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketFormat {
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    U64,
    S64,
    S24Dot8,
}

impl BucketFormat {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::U8),
            1 => Some(Self::S8),
            2 => Some(Self::U16),
            3 => Some(Self::S16),
            4 => Some(Self::U32),
            5 => Some(Self::S32),
            6 => Some(Self::U64),
            7 => Some(Self::S64),
            8 => Some(Self::S24Dot8),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::S8 => 1,
            Self::U16 => 2,
            Self::S16 => 3,
            Self::U32 => 4,
            Self::S32 => 5,
            Self::U64 => 6,
            Self::S64 => 7,
            Self::S24Dot8 => 8,
        }
    }

    pub fn width(self) -> usize {
        match self {
            Self::U8 | Self::S8 => 1,
            Self::U16 | Self::S16 => 2,
            Self::U32 | Self::S32 | Self::S24Dot8 => 4,
            Self::U64 | Self::S64 => 8,
        }
    }

    fn read(self, reader: &mut Reader<'_>) -> Result<i64, CodecError> {
        Ok(match self {
            Self::U8 => i64::from(reader.u8()?),
            Self::S8 => i64::from(reader.u8()? as i8),
            Self::U16 => i64::from(reader.u16()?),
            Self::S16 => i64::from(reader.u16()? as i16),
            Self::U32 => i64::from(reader.u32()?),
            Self::S32 | Self::S24Dot8 => i64::from(reader.i32()?),
            Self::U64 => reader.u64()? as i64,
            Self::S64 => reader.u64()? as i64,
        })
    }
}

/// Fixed-size metadata block of a Get Histogram Format response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramMetadata {
    pub num_buckets: u16,
    pub min_sampling_time_us: u32,
    pub accumulation_cycle: u8,
    pub increment_duration: u32,
    pub bucket_unit: u8,
    pub bucket_format: BucketFormat,
}

const HISTOGRAM_METADATA_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramFormat {
    pub metadata: HistogramMetadata,
    pub bucket_offsets: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramData {
    pub bucket_format: BucketFormat,
    pub buckets: Vec<i64>,
}

fn encode_histogram_req(
    instance_id: u8,
    command: u8,
    histogram_id: u32,
    parameter: u16,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, command, 6)?
        .u32(histogram_id)
        .u16(parameter)
        .into_vec())
}

pub fn encode_get_histogram_format_req(
    instance_id: u8,
    histogram_id: u32,
    parameter: u16,
) -> Result<Vec<u8>, CodecError> {
    encode_histogram_req(instance_id, GET_HISTOGRAM_FORMAT, histogram_id, parameter)
}

pub fn encode_get_histogram_data_req(
    instance_id: u8,
    histogram_id: u32,
    parameter: u16,
) -> Result<Vec<u8>, CodecError> {
    encode_histogram_req(instance_id, GET_HISTOGRAM_DATA, histogram_id, parameter)
}

pub fn decode_histogram_req(msg: &[u8], command: u8) -> Result<(u32, u16), CodecError> {
    let req = wire::parse_request(msg, command)?;
    if req.data_size < 6 {
        return Err(CodecError::Data("short histogram request"));
    }
    let mut reader = Reader::new(req.data);
    Ok((reader.u32()?, reader.u16()?))
}

pub fn encode_get_histogram_format_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    format: &HistogramFormat,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, GET_HISTOGRAM_FORMAT, cc, reason);
    }
    let meta = &format.metadata;
    if format.bucket_offsets.len() != usize::from(meta.num_buckets) {
        return Err(CodecError::Data("bucket count mismatch"));
    }
    let width = meta.bucket_format.width();
    let data_size = HISTOGRAM_METADATA_LEN + width * format.bucket_offsets.len();
    let mut writer = wire::response(instance_id, MSG_TYPE, GET_HISTOGRAM_FORMAT, data_size as u16)?
        .u16(meta.num_buckets)
        .u32(meta.min_sampling_time_us)
        .u8(meta.accumulation_cycle)
        .u8(0)
        .u32(meta.increment_duration)
        .u8(meta.bucket_unit)
        .u8(0)
        .u8(meta.bucket_format.raw())
        .u8(0);
    for offset in &format.bucket_offsets {
        writer = match width {
            1 => writer.u8(*offset as u8),
            2 => writer.u16(*offset as u16),
            4 => writer.u32(*offset as u32),
            _ => writer.u64(*offset as u64),
        };
    }
    Ok(writer.into_vec())
}

pub fn decode_get_histogram_format_resp(
    msg: &[u8],
) -> Result<Response<HistogramFormat>, CodecError> {
    let resp = match wire::parse_response(msg)? {
        Frame::Ok(resp) => resp,
        Frame::Failed { cc, reason } => return Ok(Response::Failed { cc, reason }),
    };
    if resp.command != GET_HISTOGRAM_FORMAT {
        return Err(CodecError::Data("unexpected command"));
    }

    let mut reader = Reader::new(resp.data);
    let num_buckets = reader.u16()?;
    let min_sampling_time_us = reader.u32()?;
    let accumulation_cycle = reader.u8()?;
    reader.u8()?;
    let increment_duration = reader.u32()?;
    let bucket_unit = reader.u8()?;
    reader.u8()?;
    let bucket_format = BucketFormat::from_raw(reader.u8()?)
        .ok_or(CodecError::Data("unknown bucket data type"))?;
    reader.u8()?;

    let expected = HISTOGRAM_METADATA_LEN + bucket_format.width() * usize::from(num_buckets);
    if usize::from(resp.data_size) != expected {
        return Err(CodecError::Data("data_size mismatch"));
    }

    let mut bucket_offsets = Vec::with_capacity(usize::from(num_buckets));
    for _ in 0..num_buckets {
        bucket_offsets.push(bucket_format.read(&mut reader)?);
    }

    Ok(Response::Success(HistogramFormat {
        metadata: HistogramMetadata {
            num_buckets,
            min_sampling_time_us,
            accumulation_cycle,
            increment_duration,
            bucket_unit,
            bucket_format,
        },
        bucket_offsets,
    }))
}

pub fn encode_get_histogram_data_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    data: &HistogramData,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, GET_HISTOGRAM_DATA, cc, reason);
    }
    let width = data.bucket_format.width();
    let data_size = 3 + width * data.buckets.len();
    let mut writer = wire::response(instance_id, MSG_TYPE, GET_HISTOGRAM_DATA, data_size as u16)?
        .u8(data.bucket_format.raw())
        .u16(data.buckets.len() as u16);
    for bucket in &data.buckets {
        writer = match width {
            1 => writer.u8(*bucket as u8),
            2 => writer.u16(*bucket as u16),
            4 => writer.u32(*bucket as u32),
            _ => writer.u64(*bucket as u64),
        };
    }
    Ok(writer.into_vec())
}

pub fn decode_get_histogram_data_resp(msg: &[u8]) -> Result<Response<HistogramData>, CodecError> {
    let resp = match wire::parse_response(msg)? {
        Frame::Ok(resp) => resp,
        Frame::Failed { cc, reason } => return Ok(Response::Failed { cc, reason }),
    };
    if resp.command != GET_HISTOGRAM_DATA {
        return Err(CodecError::Data("unexpected command"));
    }

    let mut reader = Reader::new(resp.data);
    let bucket_format = BucketFormat::from_raw(reader.u8()?)
        .ok_or(CodecError::Data("unknown bucket data type"))?;
    let num_buckets = reader.u16()?;

    let expected = 3 + bucket_format.width() * usize::from(num_buckets);
    if usize::from(resp.data_size) != expected {
        return Err(CodecError::Data("data_size mismatch"));
    }

    let mut buckets = Vec::with_capacity(usize::from(num_buckets));
    for _ in 0..num_buckets {
        buckets.push(bucket_format.read(&mut reader)?);
    }

    Ok(Response::Success(HistogramData { bucket_format, buckets }))
}

#[cfg(test)]
mod tests {
    use super::*;

    // The exact ping bytes as they appear on the wire.
    #[test]
    fn ping_req_wire_bytes() {
        let msg = encode_ping_req(0).unwrap();
        assert_eq!(msg, vec![0x10, 0xde, 0x80, 0x89, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn ping_resp_decode() {
        let msg = [0x10, 0xde, 0x00, 0x89, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(decode_ping_resp(&msg).unwrap(), Response::Success(()));
    }

    #[test]
    fn ping_resp_round_trip() {
        let msg =
            encode_ping_resp(7, CompletionCode::Success, ReasonCode::NONE).unwrap();
        assert_eq!(decode_ping_resp(&msg).unwrap(), Response::Success(()));
    }

    #[test]
    fn supported_message_types_round_trip() {
        let mut types = Bitmap256::EMPTY;
        types.set(0);
        types.set(3);
        let msg = encode_get_supported_nvidia_message_types_resp(
            1,
            CompletionCode::Success,
            ReasonCode::NONE,
            &types,
        )
        .unwrap();
        assert_eq!(
            decode_get_supported_nvidia_message_types_resp(&msg).unwrap(),
            Response::Success(types)
        );
    }

    #[test]
    fn supported_command_codes_req_carries_type() {
        let msg = encode_get_supported_command_codes_req(0, 3).unwrap();
        assert_eq!(decode_get_supported_command_codes_req(&msg).unwrap(), 3);
    }

    #[test]
    fn truncated_bitmap_resp_is_rejected() {
        let mut types = Bitmap256::EMPTY;
        types.set(1);
        let mut msg = encode_get_supported_nvidia_message_types_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            &types,
        )
        .unwrap();
        msg.truncate(msg.len() - 1);
        assert!(decode_get_supported_nvidia_message_types_resp(&msg).is_err());
    }

    #[test]
    fn device_identification_round_trip() {
        let identification =
            DeviceIdentification { kind: DeviceKind::Gpu, instance: 2 };
        let msg = encode_query_device_identification_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            identification,
        )
        .unwrap();
        assert_eq!(
            decode_query_device_identification_resp(&msg).unwrap(),
            Response::Success(identification)
        );
    }

    #[test]
    fn event_subscription_round_trip() {
        let msg = encode_get_event_subscription_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            1,
            30,
        )
        .unwrap();
        assert_eq!(
            decode_get_event_subscription_resp(&msg).unwrap(),
            Response::Success((1, 30))
        );
    }

    #[test]
    fn event_log_record_round_trip() {
        let record = EventLogRecord {
            nvidia_msg_type: 3,
            event_id: 1,
            event_handle: 0x1234_5678,
            timestamp: 0x9abc_def0_1122_3344,
            payload: vec![0xaa, 0xbb],
        };
        let msg = encode_get_event_log_record_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            &record,
        )
        .unwrap();
        assert_eq!(
            decode_get_event_log_record_resp(&msg).unwrap(),
            Response::Success(record)
        );
    }

    #[test]
    fn non_success_resp_decodes_to_failed() {
        let msg = encode_ping_resp(0, CompletionCode::Busy, ReasonCode::TIMEOUT).unwrap();
        assert_eq!(msg.len(), crate::HDR_LEN + crate::RESPONSE_ERROR_LEN);
        assert_eq!(
            decode_ping_resp(&msg).unwrap(),
            Response::Failed { cc: CompletionCode::Busy, reason: ReasonCode::TIMEOUT }
        );
    }

    #[test]
    fn histogram_format_round_trip() {
        let format = HistogramFormat {
            metadata: HistogramMetadata {
                num_buckets: 4,
                min_sampling_time_us: 1000,
                accumulation_cycle: 2,
                increment_duration: 50,
                bucket_unit: 0,
                bucket_format: BucketFormat::S32,
            },
            bucket_offsets: vec![-100, 0, 100, 200],
        };
        let msg = encode_get_histogram_format_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            &format,
        )
        .unwrap();
        assert_eq!(
            decode_get_histogram_format_resp(&msg).unwrap(),
            Response::Success(format)
        );
    }

    #[test]
    fn histogram_data_round_trip() {
        let data = HistogramData {
            bucket_format: BucketFormat::U16,
            buckets: vec![0, 1, 65535],
        };
        let msg = encode_get_histogram_data_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            &data,
        )
        .unwrap();
        assert_eq!(decode_get_histogram_data_resp(&msg).unwrap(), Response::Success(data));
    }

    #[test]
    fn histogram_req_round_trip() {
        let msg = encode_get_histogram_data_req(5, 0xdead_beef, 7).unwrap();
        assert_eq!(
            decode_histogram_req(&msg, GET_HISTOGRAM_DATA).unwrap(),
            (0xdead_beef, 7)
        );
    }
}

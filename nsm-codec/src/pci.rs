//! PCI link commands (NSM type 2).
//!
//! Scalar group telemetry returns a group of little-endian u32 counters
//! whose meaning depends on the group index (link identity, error counts,
//! recovery counts, ...). The codec treats the group as an opaque vector of
//! scalars; naming the fields is the consumer's business.

use crate::wire::{self, Frame, Reader};
use crate::{CodecError, CompletionCode, MessageType, ReasonCode, Response};

const MSG_TYPE: u8 = MessageType::PciLink as u8;

pub const QUERY_SCALAR_GROUP_TELEMETRY_V1: u8 = 0x04;
pub const ASSERT_PCIE_FUNDAMENTAL_RESET: u8 = 0x05;

pub fn encode_query_scalar_group_telemetry_v1_req(
    instance_id: u8,
    device_id: u8,
    group_index: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, QUERY_SCALAR_GROUP_TELEMETRY_V1, 2)?
        .u8(device_id)
        .u8(group_index)
        .into_vec())
}

pub fn decode_query_scalar_group_telemetry_v1_req(msg: &[u8]) -> Result<(u8, u8), CodecError> {
    let req = wire::parse_request(msg, QUERY_SCALAR_GROUP_TELEMETRY_V1)?;
    if req.data_size < 2 || req.data.len() < 2 {
        return Err(CodecError::Data("short scalar group request"));
    }
    Ok((req.data[0], req.data[1]))
}

pub fn encode_query_scalar_group_telemetry_v1_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    scalars: &[u32],
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(
            instance_id,
            MSG_TYPE,
            QUERY_SCALAR_GROUP_TELEMETRY_V1,
            cc,
            reason,
        );
    }
    let mut writer = wire::response(
        instance_id,
        MSG_TYPE,
        QUERY_SCALAR_GROUP_TELEMETRY_V1,
        (scalars.len() * 4) as u16,
    )?;
    for scalar in scalars {
        writer = writer.u32(*scalar);
    }
    Ok(writer.into_vec())
}

pub fn decode_query_scalar_group_telemetry_v1_resp(
    msg: &[u8],
) -> Result<Response<Vec<u32>>, CodecError> {
    let resp = match wire::parse_response(msg)? {
        Frame::Ok(resp) => resp,
        Frame::Failed { cc, reason } => return Ok(Response::Failed { cc, reason }),
    };
    if resp.command != QUERY_SCALAR_GROUP_TELEMETRY_V1 {
        return Err(CodecError::Data("unexpected command"));
    }
    let data_size = usize::from(resp.data_size);
    if data_size % 4 != 0 {
        return Err(CodecError::Data("scalar group size not a multiple of 4"));
    }
    if resp.data.len() < data_size {
        return Err(CodecError::Length { need: data_size, have: resp.data.len() });
    }

    let mut reader = Reader::new(&resp.data[..data_size]);
    let mut scalars = Vec::with_capacity(data_size / 4);
    for _ in 0..data_size / 4 {
        scalars.push(reader.u32()?);
    }
    Ok(Response::Success(scalars))
}

/// `action`: 1 asserts the reset, 0 releases it.
pub fn encode_assert_pcie_fundamental_reset_req(
    instance_id: u8,
    device_index: u8,
    action: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, ASSERT_PCIE_FUNDAMENTAL_RESET, 2)?
        .u8(device_index)
        .u8(action)
        .into_vec())
}

pub fn decode_assert_pcie_fundamental_reset_resp(msg: &[u8]) -> Result<Response<()>, CodecError> {
    match wire::parse_sized_response(msg, ASSERT_PCIE_FUNDAMENTAL_RESET, 0)? {
        Frame::Ok(_) => Ok(Response::Success(())),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_group_round_trip() {
        let req = encode_query_scalar_group_telemetry_v1_req(0, 1, 2).unwrap();
        assert_eq!(decode_query_scalar_group_telemetry_v1_req(&req).unwrap(), (1, 2));

        let scalars = vec![7, 0, 0xffff_ffff, 12];
        let resp = encode_query_scalar_group_telemetry_v1_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            &scalars,
        )
        .unwrap();
        assert_eq!(
            decode_query_scalar_group_telemetry_v1_resp(&resp).unwrap(),
            Response::Success(scalars)
        );
    }

    #[test]
    fn ragged_scalar_group_is_rejected() {
        let resp = encode_query_scalar_group_telemetry_v1_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            &[1],
        )
        .unwrap();
        let mut bad = resp.clone();
        // Shrink data_size to a non-multiple of four.
        bad[crate::HDR_LEN + 4] = 3;
        assert!(decode_query_scalar_group_telemetry_v1_resp(&bad).is_err());
    }
}

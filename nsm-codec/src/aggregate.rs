//! Aggregate-variant responses: one buffer carrying many tagged telemetry
//! samples.
//!
//! The aggregate header replaces the usual response convention with
//! `command(1) + completion_code(1) + telemetry_count(2, LE)`. Each sample is
//! `tag(1) + (valid:1 | length:3 | reserved:4)(1) + data[1 << length]`.

use byteorder::{ByteOrder, LittleEndian};

use crate::wire::{Reader, Writer};
use crate::{
    pack_header, unpack_header, CodecError, CompletionCode, HeaderInfo, MessageKind, HDR_LEN,
};

/// Sample tag reserved for the monotonic timestamp.
pub const TIMESTAMP_TAG: u8 = 0xff;
/// Largest tag that may map to a child sensor; 0xf0..=0xfe are reserved.
pub const MAX_UNRESERVED_TAG: u8 = 0xef;
/// Sample sizes are powers of two up to `1 << 7` bytes.
pub const MAX_SAMPLE_SIZE_POW2: u8 = 7;

const AGGREGATE_HEADER_LEN: usize = 4;

/// A parsed aggregate response header plus its undecoded sample area.
#[derive(Debug, Clone)]
pub struct AggregateResponse<'a> {
    pub command: u8,
    pub cc: CompletionCode,
    pub sample_count: u16,
    data: &'a [u8],
}

impl<'a> AggregateResponse<'a> {
    pub fn parse(msg: &'a [u8]) -> Result<Self, CodecError> {
        unpack_header(msg)?;
        let payload = &msg[HDR_LEN..];
        if payload.len() < AGGREGATE_HEADER_LEN {
            return Err(CodecError::Length {
                need: HDR_LEN + AGGREGATE_HEADER_LEN,
                have: msg.len(),
            });
        }
        Ok(Self {
            command: payload[0],
            cc: CompletionCode::from_raw(payload[1]),
            sample_count: LittleEndian::read_u16(&payload[2..4]),
            data: &payload[AGGREGATE_HEADER_LEN..],
        })
    }

    pub fn samples(&self) -> Samples<'a> {
        Samples { data: self.data, remaining: self.sample_count }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample<'a> {
    pub tag: u8,
    pub valid: bool,
    pub data: &'a [u8],
}

/// Iterator over the samples of an aggregate response.
///
/// Yields exactly `telemetry_count` samples; a buffer that runs out first
/// produces a `Length` error. Bytes left over after the final sample are
/// surfaced through [`Samples::trailing`].
pub struct Samples<'a> {
    data: &'a [u8],
    remaining: u16,
}

impl<'a> Samples<'a> {
    /// Bytes left past the final sample. Only meaningful once the iterator
    /// is exhausted.
    pub fn trailing(&self) -> usize {
        if self.remaining == 0 {
            self.data.len()
        } else {
            0
        }
    }
}

impl<'a> Iterator for Samples<'a> {
    type Item = Result<Sample<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        if self.data.len() < 2 {
            let have = self.data.len();
            self.remaining = 0;
            self.data = &[];
            return Some(Err(CodecError::Length { need: 2, have }));
        }
        let tag = self.data[0];
        let flags = self.data[1];
        let valid = flags & 1 != 0;
        let length = 1usize << (flags >> 1 & 0x07);
        if self.data.len() < 2 + length {
            let have = self.data.len();
            self.remaining = 0;
            self.data = &[];
            return Some(Err(CodecError::Length { need: 2 + length, have }));
        }
        let data = &self.data[2..2 + length];
        self.data = &self.data[2 + length..];
        Some(Ok(Sample { tag, valid, data }))
    }
}

/// Encode the aggregate response header. Samples are appended with
/// [`push_sample`].
pub fn encode_aggregate_resp(
    instance_id: u8,
    msg_type: u8,
    command: u8,
    cc: CompletionCode,
    sample_count: u16,
) -> Result<Vec<u8>, CodecError> {
    let mut writer = Writer::new();
    let info = HeaderInfo { kind: MessageKind::Response, instance_id, msg_type };
    pack_header(&info, writer.buf_mut())?;
    Ok(writer.u8(command).u8(cc.raw()).u16(sample_count).into_vec())
}

/// Append one sample. `data` must be a power-of-two length up to 128 bytes.
pub fn push_sample(msg: &mut Vec<u8>, tag: u8, valid: bool, data: &[u8]) -> Result<(), CodecError> {
    let length = (0..=MAX_SAMPLE_SIZE_POW2)
        .find(|pow| 1usize << pow == data.len())
        .ok_or(CodecError::Data("sample size is not a power of two"))?;
    msg.push(tag);
    msg.push(length << 1 | valid as u8);
    msg.extend_from_slice(data);
    Ok(())
}

// Per-command sample value decoders. Each checks the exact width the
// command defines for its samples.

pub fn decode_temperature_sample(data: &[u8]) -> Result<f64, CodecError> {
    expect_len(data, 4)?;
    Ok(f64::from(Reader::new(data).i32()?) / 256.0)
}

pub fn encode_temperature_sample(reading: f64) -> Vec<u8> {
    let mut data = [0u8; 4];
    LittleEndian::write_i32(&mut data, (reading * 256.0) as i32);
    data.to_vec()
}

/// Milliwatts.
pub fn decode_power_sample(data: &[u8]) -> Result<u32, CodecError> {
    expect_len(data, 4)?;
    Reader::new(data).u32()
}

pub fn decode_energy_sample(data: &[u8]) -> Result<u64, CodecError> {
    expect_len(data, 8)?;
    Reader::new(data).u64()
}

/// Microvolts.
pub fn decode_voltage_sample(data: &[u8]) -> Result<u32, CodecError> {
    expect_len(data, 4)?;
    Reader::new(data).u32()
}

pub fn decode_thermal_parameter_sample(data: &[u8]) -> Result<i32, CodecError> {
    expect_len(data, 4)?;
    Reader::new(data).i32()
}

/// Microseconds; carried under the reserved tag 0xFF.
pub fn decode_timestamp_sample(data: &[u8]) -> Result<u64, CodecError> {
    expect_len(data, 8)?;
    Reader::new(data).u64()
}

/// GPM percentage metric, hundredths of a percent on the wire at whatever
/// width the device chose.
pub fn decode_percentage_sample(data: &[u8]) -> Result<f64, CodecError> {
    Ok(read_widened(data)? as f64 / 100.0)
}

/// GPM bandwidth metric in bytes per second.
pub fn decode_bandwidth_sample(data: &[u8]) -> Result<u64, CodecError> {
    read_widened(data)
}

fn expect_len(data: &[u8], len: usize) -> Result<(), CodecError> {
    if data.len() != len {
        return Err(CodecError::Length { need: len, have: data.len() });
    }
    Ok(())
}

/// Read a little-endian unsigned integer of width 1, 2, 4 or 8.
fn read_widened(data: &[u8]) -> Result<u64, CodecError> {
    match data.len() {
        1 => Ok(u64::from(data[0])),
        2 => Ok(u64::from(LittleEndian::read_u16(data))),
        4 => Ok(u64::from(LittleEndian::read_u32(data))),
        8 => Ok(LittleEndian::read_u64(data)),
        have => Err(CodecError::Length { need: 8, have }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environmental::GET_TEMPERATURE_READING;

    fn sample_msg(count: u16, samples: &[(u8, &[u8])]) -> Vec<u8> {
        let mut msg = encode_aggregate_resp(
            0,
            3,
            GET_TEMPERATURE_READING,
            CompletionCode::Success,
            count,
        )
        .unwrap();
        for (tag, data) in samples {
            push_sample(&mut msg, *tag, true, data).unwrap();
        }
        msg
    }

    // Two temperature samples under tags 0 and 39.
    #[test]
    fn aggregate_temperature_samples() {
        let msg = sample_msg(
            2,
            &[(0, &[0x57, 0x0c, 0x00, 0x00]), (39, &[0x98, 0x78, 0x90, 0x46])],
        );
        let resp = AggregateResponse::parse(&msg).unwrap();
        assert_eq!(resp.cc, CompletionCode::Success);
        assert_eq!(resp.sample_count, 2);

        let samples: Vec<_> = resp.samples().collect::<Result<_, _>>().unwrap();
        assert_eq!(samples[0].tag, 0);
        let first = decode_temperature_sample(samples[0].data).unwrap();
        assert!((first - 12.33984375).abs() < 1e-9);

        assert_eq!(samples[1].tag, 39);
        let second = decode_temperature_sample(samples[1].data).unwrap();
        assert!((second - f64::from(0x4690_7898_i32) / 256.0).abs() < 1e-9);
    }

    // Fewer samples on the wire than telemetry_count announces.
    #[test]
    fn truncated_sample_stream_is_length_error() {
        let msg = sample_msg(3, &[(0, &[0, 0, 0, 0]), (1, &[0, 0, 0, 0])]);
        let resp = AggregateResponse::parse(&msg).unwrap();
        let results: Vec<_> = resp.samples().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(CodecError::Length { .. })));
    }

    // A sample with length field k carries exactly 1 << k bytes.
    #[test]
    fn sample_sizes_are_powers_of_two() {
        for pow in 0..=MAX_SAMPLE_SIZE_POW2 {
            let data = vec![0xa5; 1 << pow];
            let mut msg = sample_msg(0, &[]);
            // patch the count to 1 after the fact
            msg[HDR_LEN + 2] = 1;
            push_sample(&mut msg, 7, true, &data).unwrap();
            let resp = AggregateResponse::parse(&msg).unwrap();
            let sample = resp.samples().next().unwrap().unwrap();
            assert_eq!(sample.data.len(), 1 << pow);
        }
    }

    #[test]
    fn odd_sample_size_is_rejected() {
        let mut msg = sample_msg(1, &[]);
        assert!(push_sample(&mut msg, 0, true, &[1, 2, 3]).is_err());
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let mut msg = sample_msg(1, &[(0, &[0, 0, 0, 0])]);
        msg.extend_from_slice(&[0xde, 0xad]);
        let resp = AggregateResponse::parse(&msg).unwrap();
        let mut samples = resp.samples();
        assert!(samples.next().unwrap().is_ok());
        assert!(samples.next().is_none());
        assert_eq!(samples.trailing(), 2);
    }

    #[test]
    fn invalid_sample_is_flagged() {
        let mut msg = sample_msg(1, &[]);
        push_sample(&mut msg, 5, false, &[0, 0, 0, 0]).unwrap();
        let resp = AggregateResponse::parse(&msg).unwrap();
        let sample = resp.samples().next().unwrap().unwrap();
        assert!(!sample.valid);
    }

    #[test]
    fn timestamp_sample_round_trip() {
        let mut data = [0u8; 8];
        LittleEndian::write_u64(&mut data, 1_234_567);
        assert_eq!(decode_timestamp_sample(&data).unwrap(), 1_234_567);
    }

    #[test]
    fn percentage_widths() {
        assert_eq!(decode_percentage_sample(&[50]).unwrap(), 0.5);
        assert_eq!(decode_percentage_sample(&[0x10, 0x27]).unwrap(), 100.0);
        assert!(decode_percentage_sample(&[0, 0, 0]).is_err());
    }

    #[test]
    fn wrong_width_value_decoders_reject() {
        assert!(decode_temperature_sample(&[0, 0]).is_err());
        assert!(decode_power_sample(&[0; 8]).is_err());
        assert!(decode_energy_sample(&[0; 4]).is_err());
        assert!(decode_timestamp_sample(&[0; 4]).is_err());
    }
}

//! Request/response framing shared by every command module.

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    pack_header, unpack_header, CodecError, CompletionCode, HeaderInfo, MessageKind, ReasonCode,
    HDR_LEN, RESPONSE_CONVENTION_LEN, RESPONSE_ERROR_LEN,
};

/// A 256-bit bitmap, 32 bytes on the wire. Used for supported message
/// types, supported command codes and event sources.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Bitmap256(pub [u8; 32]);

impl Bitmap256 {
    pub const EMPTY: Self = Self([0; 32]);

    pub fn get(&self, bit: u8) -> bool {
        self.0[usize::from(bit) / 8] & 1 << (bit % 8) != 0
    }

    pub fn set(&mut self, bit: u8) {
        self.0[usize::from(bit) / 8] |= 1 << (bit % 8);
    }

    pub fn clear(&mut self, bit: u8) {
        self.0[usize::from(bit) / 8] &= !(1 << (bit % 8));
    }

    /// Indices of all set bits, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(|bit| self.get(*bit))
    }

    pub fn from_wire(data: &[u8]) -> Result<Self, CodecError> {
        let mut bytes = [0u8; 32];
        if data.len() < 32 {
            return Err(CodecError::Length { need: 32, have: data.len() });
        }
        bytes.copy_from_slice(&data[..32]);
        Ok(Self(bytes))
    }
}

impl Default for Bitmap256 {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl std::fmt::Debug for Bitmap256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter_set()).finish()
    }
}

/// Little-endian cursor over a payload slice.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::Length { need: self.pos + n, have: self.buf.len() });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Little-endian writer. All encoders build messages through this so the
/// byte order lives in exactly one place.
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.buf.push(value);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
        self
    }

    pub fn i32(self, value: i32) -> Self {
        self.u32(value as u32)
    }

    pub fn u64(mut self, value: u64) -> Self {
        let mut bytes = [0u8; 8];
        LittleEndian::write_u64(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
        self
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Start a request message: header plus `command(1) + data_size(1)`.
pub(crate) fn request(
    instance_id: u8,
    msg_type: u8,
    command: u8,
    data_size: u8,
) -> Result<Writer, CodecError> {
    let mut writer = Writer::new();
    let info = HeaderInfo { kind: MessageKind::Request, instance_id, msg_type };
    pack_header(&info, &mut writer.buf)?;
    Ok(writer.u8(command).u8(data_size))
}

/// Start a success response message: header plus the six-byte response
/// convention with `data_size` already filled in.
pub(crate) fn response(
    instance_id: u8,
    msg_type: u8,
    command: u8,
    data_size: u16,
) -> Result<Writer, CodecError> {
    let mut writer = Writer::new();
    let info = HeaderInfo { kind: MessageKind::Response, instance_id, msg_type };
    pack_header(&info, &mut writer.buf)?;
    Ok(writer.u8(command).u8(CompletionCode::Success.raw()).u16(0).u16(data_size))
}

/// Encode the truncated non-success response form.
pub(crate) fn error_response(
    instance_id: u8,
    msg_type: u8,
    command: u8,
    cc: CompletionCode,
    reason: ReasonCode,
) -> Result<Vec<u8>, CodecError> {
    let mut writer = Writer::new();
    let info = HeaderInfo { kind: MessageKind::Response, instance_id, msg_type };
    pack_header(&info, &mut writer.buf)?;
    Ok(writer.u8(command).u8(cc.raw()).u16(reason.0).into_vec())
}

pub(crate) enum Frame<'a> {
    Ok(RespFrame<'a>),
    Failed { cc: CompletionCode, reason: ReasonCode },
}

pub(crate) struct RespFrame<'a> {
    pub command: u8,
    pub data_size: u16,
    pub data: &'a [u8],
}

/// Split a response message into header-validated parts.
///
/// Reads the completion code before anything else; a non-success code means
/// the message is the four-byte `(command, cc, reason)` form, and its length
/// must match that form exactly.
pub(crate) fn parse_response(msg: &[u8]) -> Result<Frame<'_>, CodecError> {
    unpack_header(msg)?;
    let payload = &msg[HDR_LEN..];
    if payload.len() < RESPONSE_ERROR_LEN {
        return Err(CodecError::Length {
            need: HDR_LEN + RESPONSE_ERROR_LEN,
            have: msg.len(),
        });
    }

    let cc = CompletionCode::from_raw(payload[1]);
    if !cc.is_success() {
        if payload.len() != RESPONSE_ERROR_LEN {
            return Err(CodecError::Length {
                need: HDR_LEN + RESPONSE_ERROR_LEN,
                have: msg.len(),
            });
        }
        let reason = ReasonCode(LittleEndian::read_u16(&payload[2..4]));
        return Ok(Frame::Failed { cc, reason });
    }

    if payload.len() < RESPONSE_CONVENTION_LEN {
        return Err(CodecError::Length {
            need: HDR_LEN + RESPONSE_CONVENTION_LEN,
            have: msg.len(),
        });
    }

    Ok(Frame::Ok(RespFrame {
        command: payload[0],
        data_size: LittleEndian::read_u16(&payload[4..6]),
        data: &payload[RESPONSE_CONVENTION_LEN..],
    }))
}

/// Like [`parse_response`], additionally checking the command byte and that
/// `data_size` matches the structural payload length `expected` exactly.
pub(crate) fn parse_sized_response<'a>(
    msg: &'a [u8],
    command: u8,
    expected: usize,
) -> Result<Frame<'a>, CodecError> {
    let frame = parse_response(msg)?;
    let Frame::Ok(ref resp) = frame else {
        return Ok(frame);
    };
    if resp.command != command {
        return Err(CodecError::Data("unexpected command"));
    }
    if resp.data.len() < expected {
        return Err(CodecError::Length {
            need: HDR_LEN + RESPONSE_CONVENTION_LEN + expected,
            have: msg.len(),
        });
    }
    if usize::from(resp.data_size) != expected {
        return Err(CodecError::Data("data_size mismatch"));
    }
    Ok(frame)
}

pub(crate) struct ReqFrame<'a> {
    pub data_size: u8,
    pub data: &'a [u8],
}

/// Split a request message into its command, declared size and payload.
pub(crate) fn parse_request<'a>(msg: &'a [u8], command: u8) -> Result<ReqFrame<'a>, CodecError> {
    let header = unpack_header(msg)?;
    if header.kind != MessageKind::Request {
        return Err(CodecError::Data("not a request"));
    }
    let payload = &msg[HDR_LEN..];
    if payload.len() < crate::REQUEST_CONVENTION_LEN {
        return Err(CodecError::Length {
            need: HDR_LEN + crate::REQUEST_CONVENTION_LEN,
            have: msg.len(),
        });
    }
    if payload[0] != command {
        return Err(CodecError::Data("unexpected command"));
    }
    Ok(ReqFrame { data_size: payload[1], data: &payload[2..] })
}

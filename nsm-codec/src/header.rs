use byteorder::{BigEndian, ByteOrder};

use crate::{CodecError, MessageKind, INSTANCE_ID_MAX, OCP_TYPE, OCP_VERSION, PCI_VENDOR_ID};

/// Length of the packed message header on the wire.
pub const HDR_LEN: usize = 5;

/// The fields needed to pack a header, and the result of unpacking one.
///
/// `msg_type` is kept raw: routing tables are keyed by the byte, and a
/// device may legitimately report types this crate has no decoder for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderInfo {
    pub kind: MessageKind,
    pub instance_id: u8,
    pub msg_type: u8,
}

/// Append the five header bytes for `info` to `out`.
pub fn pack_header(info: &HeaderInfo, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if info.instance_id > INSTANCE_ID_MAX {
        return Err(CodecError::Data("instance id out of range"));
    }

    let (request, datagram) = match info.kind {
        MessageKind::Request => (1, 0),
        MessageKind::Response => (0, 0),
        MessageKind::Event => (1, 1),
        MessageKind::EventAcknowledgment => (0, 1),
    };

    let mut vendor = [0u8; 2];
    BigEndian::write_u16(&mut vendor, PCI_VENDOR_ID);
    out.extend_from_slice(&vendor);
    out.push(request << 7 | datagram << 6 | info.instance_id);
    out.push(OCP_TYPE << 4 | OCP_VERSION);
    out.push(info.msg_type);
    Ok(())
}

/// Validate and unpack the header at the front of `msg`.
pub fn unpack_header(msg: &[u8]) -> Result<HeaderInfo, CodecError> {
    if msg.len() < HDR_LEN {
        return Err(CodecError::Length { need: HDR_LEN, have: msg.len() });
    }

    if BigEndian::read_u16(&msg[0..2]) != PCI_VENDOR_ID {
        return Err(CodecError::Data("bad PCI vendor id"));
    }
    if msg[3] >> 4 != OCP_TYPE {
        return Err(CodecError::Data("bad OCP type"));
    }
    if msg[3] & 0x0f != OCP_VERSION {
        return Err(CodecError::Data("bad OCP version"));
    }

    let request = msg[2] >> 7 & 1;
    let datagram = msg[2] >> 6 & 1;
    let kind = match (request, datagram) {
        (1, 0) => MessageKind::Request,
        (0, 0) => MessageKind::Response,
        (1, 1) => MessageKind::Event,
        _ => MessageKind::EventAcknowledgment,
    };

    Ok(HeaderInfo {
        kind,
        instance_id: msg[2] & crate::INSTANCE_ID_MASK,
        msg_type: msg[4],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        for kind in [
            MessageKind::Request,
            MessageKind::Response,
            MessageKind::Event,
            MessageKind::EventAcknowledgment,
        ] {
            for instance_id in 0..=INSTANCE_ID_MAX {
                for msg_type in [0u8, 3, 6, 0x7f] {
                    let info = HeaderInfo { kind, instance_id, msg_type };
                    let mut buf = Vec::new();
                    pack_header(&info, &mut buf).unwrap();
                    assert_eq!(buf.len(), HDR_LEN);
                    assert_eq!(unpack_header(&buf).unwrap(), info);
                }
            }
        }
    }

    #[test]
    fn vendor_id_is_big_endian_on_the_wire() {
        let info = HeaderInfo { kind: MessageKind::Request, instance_id: 0, msg_type: 0 };
        let mut buf = Vec::new();
        pack_header(&info, &mut buf).unwrap();
        assert_eq!(&buf[0..2], &[0x10, 0xde]);
        assert_eq!(buf[3], 0x89);
    }

    #[test]
    fn instance_id_out_of_range_is_rejected() {
        let info = HeaderInfo { kind: MessageKind::Request, instance_id: 32, msg_type: 0 };
        let mut buf = Vec::new();
        assert_eq!(pack_header(&info, &mut buf), Err(CodecError::Data("instance id out of range")));
    }

    #[test]
    fn foreign_vendor_is_rejected() {
        let mut buf = Vec::new();
        let info = HeaderInfo { kind: MessageKind::Response, instance_id: 1, msg_type: 3 };
        pack_header(&info, &mut buf).unwrap();
        buf[0] = 0x8a;
        assert!(unpack_header(&buf).is_err());
    }

    #[test]
    fn wrong_ocp_fields_are_rejected() {
        let info = HeaderInfo { kind: MessageKind::Response, instance_id: 1, msg_type: 3 };
        let mut buf = Vec::new();
        pack_header(&info, &mut buf).unwrap();
        let mut bad_type = buf.clone();
        bad_type[3] = 0x79;
        assert!(unpack_header(&bad_type).is_err());
        let mut bad_version = buf;
        bad_version[3] = 0x88;
        assert!(unpack_header(&bad_version).is_err());
    }
}

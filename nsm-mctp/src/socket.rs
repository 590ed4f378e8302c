//! Seqpacket socket to the MCTP demultiplexer.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    connect, recv, send, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr,
};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::TransportError;

/// MCTP message type for PCI vendor-defined messages, which is what NSM
/// rides on.
pub const MCTP_MSG_TYPE_PCI_VDM: u8 = 0x7e;

/// Tag-owner request tag used for all outbound requests.
const MCTP_MSG_TAG_REQ: u8 = 0x08;

/// `tag(1) + eid(1) + mctp_msg_type(1)`
const MCTP_PREFIX_LEN: usize = 3;

/// Larger than any NSM message plus framing.
const MAX_PACKET_LEN: usize = 4096;

/// Demultiplexer socket name, honouring the `NSM_MCTP_SOCKET` override.
pub fn socket_path_from_env() -> String {
    std::env::var(crate::SOCKET_ENV_VAR).unwrap_or_else(|_| crate::DEFAULT_SOCKET_NAME.into())
}

/// A connected, registered, non-blocking socket to the demultiplexer.
pub struct MctpSocket {
    fd: AsyncFd<OwnedFd>,
}

impl MctpSocket {
    /// Connect to the demultiplexer at the abstract-namespace `name` and
    /// register for PCI VDM traffic by writing the message type byte.
    pub fn connect(name: &str) -> Result<Self, TransportError> {
        let fd = socket(AddressFamily::Unix, SockType::SeqPacket, SockFlag::empty(), None)
            .map_err(|errno| TransportError::SendFail(errno.into()))?;
        let addr = UnixAddr::new_abstract(name.as_bytes())
            .map_err(|errno| TransportError::SendFail(errno.into()))?;
        connect(fd.as_raw_fd(), &addr)
            .map_err(|errno| TransportError::SendFail(errno.into()))?;

        let registration = [MCTP_MSG_TYPE_PCI_VDM];
        send(fd.as_raw_fd(), &registration, MsgFlags::empty())
            .map_err(|errno| TransportError::SendFail(errno.into()))?;

        Self::from_fd(fd)
    }

    /// Wrap an already-connected seqpacket fd. Used by tests to talk to an
    /// in-process demultiplexer over a socketpair.
    pub fn from_fd(fd: OwnedFd) -> Result<Self, TransportError> {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|errno| TransportError::SendFail(errno.into()))?;
        let fd = AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)
            .map_err(TransportError::SendFail)?;
        Ok(Self { fd })
    }

    /// Send one NSM message to `eid`, prefixed with the MCTP framing.
    pub async fn send(&self, eid: u8, msg: &[u8]) -> Result<(), TransportError> {
        let mut packet = Vec::with_capacity(MCTP_PREFIX_LEN + msg.len());
        packet.extend_from_slice(&[MCTP_MSG_TAG_REQ, eid, MCTP_MSG_TYPE_PCI_VDM]);
        packet.extend_from_slice(msg);

        loop {
            let mut guard = self.fd.writable().await.map_err(TransportError::SendFail)?;
            match guard.try_io(|inner| {
                send(inner.as_raw_fd(), &packet, MsgFlags::empty()).map_err(io::Error::from)
            }) {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(err)) => return Err(TransportError::SendFail(err)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one packet, strip and validate the MCTP framing, and return
    /// `(eid, nsm_bytes)`.
    pub async fn recv(&self) -> Result<(u8, Vec<u8>), TransportError> {
        let mut buf = [0u8; MAX_PACKET_LEN];
        let len = loop {
            let mut guard = self.fd.readable().await.map_err(TransportError::RecvFail)?;
            match guard.try_io(|inner| {
                recv(inner.as_raw_fd(), &mut buf, MsgFlags::empty()).map_err(io::Error::from)
            }) {
                Ok(Ok(0)) => {
                    return Err(TransportError::RecvFail(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "demultiplexer closed the connection",
                    )))
                }
                Ok(Ok(len)) => break len,
                Ok(Err(err)) => return Err(TransportError::RecvFail(err)),
                Err(_would_block) => continue,
            }
        };

        if len < MCTP_PREFIX_LEN + nsm_codec::HDR_LEN {
            return Err(TransportError::InvalidRecvLen(len));
        }
        if buf[2] != MCTP_MSG_TYPE_PCI_VDM {
            return Err(TransportError::NotNsmMessage);
        }
        Ok((buf[1], buf[MCTP_PREFIX_LEN..len].to_vec()))
    }
}

#[cfg(test)]
pub(crate) fn seqpacket_pair() -> (OwnedFd, OwnedFd) {
    nix::sys::socket::socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_prefixes_mctp_framing() {
        let (a, b) = seqpacket_pair();
        let near = MctpSocket::from_fd(a).unwrap();

        let msg = nsm_codec::capability::encode_ping_req(0).unwrap();
        near.send(18, &msg).await.unwrap();

        let mut buf = [0u8; 64];
        let len = recv(b.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(len, MCTP_PREFIX_LEN + msg.len());
        assert_eq!(buf[0], MCTP_MSG_TAG_REQ);
        assert_eq!(buf[1], 18);
        assert_eq!(buf[2], MCTP_MSG_TYPE_PCI_VDM);
        assert_eq!(&buf[MCTP_PREFIX_LEN..len], &msg[..]);
    }

    #[tokio::test]
    async fn recv_strips_and_validates_framing() {
        let (a, b) = seqpacket_pair();
        let near = MctpSocket::from_fd(a).unwrap();

        let msg = nsm_codec::capability::encode_ping_resp(
            0,
            nsm_codec::CompletionCode::Success,
            nsm_codec::ReasonCode::NONE,
        )
        .unwrap();
        let mut packet = vec![MCTP_MSG_TAG_REQ, 18, MCTP_MSG_TYPE_PCI_VDM];
        packet.extend_from_slice(&msg);
        send(b.as_raw_fd(), &packet, MsgFlags::empty()).unwrap();

        let (eid, received) = near.recv().await.unwrap();
        assert_eq!(eid, 18);
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn wrong_mctp_msg_type_is_not_nsm() {
        let (a, b) = seqpacket_pair();
        let near = MctpSocket::from_fd(a).unwrap();

        let mut packet = vec![MCTP_MSG_TAG_REQ, 18, 0x01];
        packet.extend_from_slice(&[0u8; nsm_codec::HDR_LEN]);
        send(b.as_raw_fd(), &packet, MsgFlags::empty()).unwrap();

        assert!(matches!(near.recv().await, Err(TransportError::NotNsmMessage)));
    }

    #[tokio::test]
    async fn runt_packet_is_invalid_recv_len() {
        let (a, b) = seqpacket_pair();
        let near = MctpSocket::from_fd(a).unwrap();

        send(b.as_raw_fd(), &[MCTP_MSG_TAG_REQ, 18], MsgFlags::empty()).unwrap();

        assert!(matches!(near.recv().await, Err(TransportError::InvalidRecvLen(2))));
    }
}

//! Async MCTP transport for NSM.
//!
//! The daemon talks to a local MCTP demultiplexer over a Unix seqpacket
//! socket. Every packet is prefixed with `[tag, eid, mctp_msg_type]`; the
//! message type for NSM is always PCI VDM (0x7E). [`MctpSocket`] owns the
//! socket and the framing, [`Requester`] multiplexes concurrent requests by
//! instance id and hands asynchronous events to a sink.

use thiserror::Error;

mod requester;
mod socket;

pub use requester::{EventStream, RemoteEvent, Requester, RequesterConfig};
pub use socket::{socket_path_from_env, MctpSocket, MCTP_MSG_TYPE_PCI_VDM};

/// Default abstract-namespace socket name of the MCTP demultiplexer.
pub const DEFAULT_SOCKET_NAME: &str = "mctp-mux";

/// Environment variable overriding [`DEFAULT_SOCKET_NAME`].
pub const SOCKET_ENV_VAR: &str = "NSM_MCTP_SOCKET";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to send to MCTP demultiplexer: {0}")]
    SendFail(#[source] std::io::Error),

    #[error("failed to receive from MCTP demultiplexer: {0}")]
    RecvFail(#[source] std::io::Error),

    #[error("received packet shorter than the MCTP framing ({0} bytes)")]
    InvalidRecvLen(usize),

    #[error("received packet is not an NSM message")]
    NotNsmMessage,

    #[error("send_recv requires a request message")]
    NotRequestMessage,

    #[error("received message shorter than header plus completion code")]
    ResponseTooSmall,

    #[error("request timed out")]
    Timeout,

    #[error("endpoint cancelled while request was in flight")]
    Cancelled,

    #[error("transport is shut down")]
    ShutDown,

    #[error(transparent)]
    Codec(#[from] nsm_codec::CodecError),
}

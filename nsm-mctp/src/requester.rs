//! Request/response multiplexing over one demultiplexer connection.
//!
//! One receiver task owns the socket's read side. Responses are routed to
//! the `send_recv` caller whose `(eid, instance_id)` matches; events go to
//! the event stream in arrival order; everything else is dropped with a log
//! line. Instance ids are pooled per endpoint, and the pool size doubles as
//! the in-flight limit: when every id is busy the next caller suspends until
//! a response or timeout releases one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use nsm_codec::{unpack_header, MessageKind, INSTANCE_ID_MAX};

use crate::{MctpSocket, TransportError};

/// An asynchronous NSM event (or event acknowledgement) from a device.
#[derive(Debug)]
pub struct RemoteEvent {
    pub eid: u8,
    pub msg: Vec<u8>,
}

/// Receiving half for device-originated events.
pub type EventStream = mpsc::UnboundedReceiver<RemoteEvent>;

#[derive(Debug, Clone, Copy)]
pub struct RequesterConfig {
    /// Instance ids handed out per endpoint; capped at 32 by the wire
    /// format. This bounds concurrent requests to one device.
    pub max_in_flight_per_endpoint: u8,
    pub default_timeout: Duration,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self { max_in_flight_per_endpoint: 4, default_timeout: Duration::from_secs(2) }
    }
}

struct Endpoint {
    free_ids: VecDeque<u8>,
    pending: FxHashMap<u8, oneshot::Sender<Vec<u8>>>,
    /// Wakers for callers suspended on an empty id pool.
    id_waiters: VecDeque<oneshot::Sender<u8>>,
}

impl Endpoint {
    fn new(pool_size: u8) -> Self {
        Self {
            free_ids: (0..pool_size).collect(),
            pending: FxHashMap::default(),
            id_waiters: VecDeque::new(),
        }
    }

    /// Return an id to the pool, or hand it directly to the next waiter.
    fn release_id(&mut self, instance_id: u8) {
        while let Some(waiter) = self.id_waiters.pop_front() {
            match waiter.send(instance_id) {
                Ok(()) => return,
                // Waiter gave up (cancelled); try the next one.
                Err(_) => continue,
            }
        }
        self.free_ids.push_back(instance_id);
    }
}

struct Shared {
    endpoints: FxHashMap<u8, Endpoint>,
    pool_size: u8,
    shut_down: bool,
}

impl Shared {
    fn endpoint(&mut self, eid: u8) -> &mut Endpoint {
        let pool_size = self.pool_size;
        self.endpoints.entry(eid).or_insert_with(|| Endpoint::new(pool_size))
    }
}

/// The transport handle used by the sensor schedulers and the CLI.
pub struct Requester {
    socket: Arc<MctpSocket>,
    shared: Arc<Mutex<Shared>>,
    config: RequesterConfig,
    receiver: JoinHandle<()>,
}

impl Requester {
    /// Wrap a connected socket. Spawns the receiver task; the returned
    /// stream yields device-originated events.
    pub fn new(socket: MctpSocket, config: RequesterConfig) -> (Self, EventStream) {
        let pool_size = config.max_in_flight_per_endpoint.min(INSTANCE_ID_MAX + 1).max(1);
        let socket = Arc::new(socket);
        let shared = Arc::new(Mutex::new(Shared {
            endpoints: FxHashMap::default(),
            pool_size,
            shut_down: false,
        }));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let receiver = tokio::spawn(receive_loop(socket.clone(), shared.clone(), event_tx));

        (Self { socket, shared, config, receiver }, event_rx)
    }

    /// Send a fully-encoded request and await the matching response.
    ///
    /// The instance id in the encoded message is replaced with one from the
    /// endpoint's pool. On timeout the id is released and the eventual
    /// late response, if any, is dropped by the receiver.
    pub async fn send_recv(
        &self,
        eid: u8,
        mut req: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        let header = unpack_header(&req)?;
        if header.kind != MessageKind::Request {
            return Err(TransportError::NotRequestMessage);
        }

        let instance_id = self.acquire_id(eid).await?;
        // Stamp the pooled id into the packed header byte, keeping the
        // request/datagram bits.
        req[2] = req[2] & 0xe0 | instance_id;

        let rx = {
            let mut shared = self.shared.lock().unwrap();
            let (tx, rx) = oneshot::channel();
            shared.endpoint(eid).pending.insert(instance_id, tx);
            rx
        };

        if let Err(err) = self.socket.send(eid, &req).await {
            self.retire(eid, instance_id);
            return Err(err);
        }

        let timeout = timeout.unwrap_or(self.config.default_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => {
                // The receiver already removed the pending entry.
                self.release(eid, instance_id);
                if resp.len() < nsm_codec::HDR_LEN + 1 {
                    return Err(TransportError::ResponseTooSmall);
                }
                Ok(resp)
            }
            Ok(Err(_closed)) => {
                self.release(eid, instance_id);
                Err(TransportError::Cancelled)
            }
            Err(_elapsed) => {
                self.retire(eid, instance_id);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Send a message that expects no response (event acknowledgements).
    pub async fn send_datagram(&self, eid: u8, msg: &[u8]) -> Result<(), TransportError> {
        self.socket.send(eid, msg).await
    }

    /// Fail every outstanding request to `eid` and reset its id pool.
    /// Used when a device is torn down.
    pub fn cancel_endpoint(&self, eid: u8) {
        let mut shared = self.shared.lock().unwrap();
        if shared.endpoints.remove(&eid).is_some() {
            debug!("cancelled outstanding requests for eid {eid}");
        }
    }

    /// Stop accepting work and stop the receiver task. Pending requests
    /// fail with `Cancelled`.
    pub fn shutdown(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.shut_down = true;
        shared.endpoints.clear();
        self.receiver.abort();
    }

    async fn acquire_id(&self, eid: u8) -> Result<u8, TransportError> {
        let rx = {
            let mut shared = self.shared.lock().unwrap();
            if shared.shut_down {
                return Err(TransportError::ShutDown);
            }
            let endpoint = shared.endpoint(eid);
            if let Some(instance_id) = endpoint.free_ids.pop_front() {
                return Ok(instance_id);
            }
            let (tx, rx) = oneshot::channel();
            endpoint.id_waiters.push_back(tx);
            rx
        };
        rx.await.map_err(|_| TransportError::Cancelled)
    }

    /// Release after a received response (pending entry already gone).
    fn release(&self, eid: u8, instance_id: u8) {
        let mut shared = self.shared.lock().unwrap();
        if let Some(endpoint) = shared.endpoints.get_mut(&eid) {
            endpoint.release_id(instance_id);
        }
    }

    /// Release after a failure where the pending entry may still be
    /// registered (send error, timeout).
    fn retire(&self, eid: u8, instance_id: u8) {
        let mut shared = self.shared.lock().unwrap();
        if let Some(endpoint) = shared.endpoints.get_mut(&eid) {
            endpoint.pending.remove(&instance_id);
            endpoint.release_id(instance_id);
        }
    }
}

impl Drop for Requester {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_loop(
    socket: Arc<MctpSocket>,
    shared: Arc<Mutex<Shared>>,
    event_tx: mpsc::UnboundedSender<RemoteEvent>,
) {
    loop {
        let (eid, msg) = match socket.recv().await {
            Ok(packet) => packet,
            Err(TransportError::NotNsmMessage) => {
                debug!("dropping non-NSM packet from demultiplexer");
                continue;
            }
            Err(TransportError::InvalidRecvLen(len)) => {
                warn!("dropping runt packet ({len} bytes)");
                continue;
            }
            Err(err) => {
                warn!("receiver exiting: {err}");
                let mut shared = shared.lock().unwrap();
                shared.shut_down = true;
                shared.endpoints.clear();
                return;
            }
        };

        let header = match unpack_header(&msg) {
            Ok(header) => header,
            Err(err) => {
                debug!("dropping undecodable message from eid {eid}: {err}");
                continue;
            }
        };

        match header.kind {
            MessageKind::Response => {
                let waiter = {
                    let mut shared = shared.lock().unwrap();
                    shared
                        .endpoints
                        .get_mut(&eid)
                        .and_then(|endpoint| endpoint.pending.remove(&header.instance_id))
                };
                match waiter {
                    Some(tx) => {
                        if tx.send(msg).is_err() {
                            debug!(
                                "waiter for eid {eid} instance {} went away",
                                header.instance_id
                            );
                        }
                    }
                    None => debug!(
                        "no waiter for response from eid {eid} instance {}; dropping",
                        header.instance_id
                    ),
                }
            }
            MessageKind::Event | MessageKind::EventAcknowledgment => {
                if event_tx.send(RemoteEvent { eid, msg }).is_err() {
                    debug!("event sink closed; dropping event from eid {eid}");
                }
            }
            MessageKind::Request => {
                debug!("dropping unexpected request from eid {eid}");
            }
        }
    }
}

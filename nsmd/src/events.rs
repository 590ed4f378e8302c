//! Fan-out of device-originated events to the per-device polling tasks.

use std::sync::{Arc, Mutex};

use log::debug;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use nsm_mctp::EventStream;

/// Raw event messages for one device, in arrival order.
pub type DeviceEvents = mpsc::UnboundedReceiver<Vec<u8>>;

/// Routes the transport's event stream to subscribers keyed by EID.
///
/// Subscribers must not block: delivery is an unbounded channel send, and
/// events for endpoints nobody registered are dropped with a debug log.
#[derive(Clone, Default)]
pub struct EventRouter {
    subscribers: Arc<Mutex<FxHashMap<u8, mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, eid: u8) -> DeviceEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().insert(eid, tx);
        rx
    }

    pub fn unregister(&self, eid: u8) {
        self.subscribers.lock().unwrap().remove(&eid);
    }

    /// Forward events until the transport's stream closes.
    pub async fn run(self, mut stream: EventStream) {
        while let Some(event) = stream.recv().await {
            let subscriber =
                self.subscribers.lock().unwrap().get(&event.eid).cloned();
            match subscriber {
                Some(tx) => {
                    if tx.send(event.msg).is_err() {
                        debug!("event subscriber for eid {} went away", event.eid);
                        self.unregister(event.eid);
                    }
                }
                None => debug!("no subscriber for event from eid {}, dropping", event.eid),
            }
        }
    }
}

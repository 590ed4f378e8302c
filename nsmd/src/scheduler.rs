//! The per-device cooperative polling loop.
//!
//! Each tick: every priority sensor first, then exactly one round-robin
//! sensor. ACCEPTED and BUSY answers re-queue the sensor at the head of its
//! class with exponential backoff; ACCEPTED additionally waits for the
//! long-running completion event. A rediscovery event makes the next tick
//! start by re-reading the capability tables.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use nsm_codec::events as wire_events;
use nsm_codec::{capability, CompletionCode, Response};
use nsm_mctp::{Requester, TransportError};

use crate::device::{Capabilities, Device, SensorClass, SensorSlot};
use crate::events::DeviceEvents;
use crate::publish::{PublishingSurface, Value};
use crate::sensor::SensorError;
use crate::sensors::device_path;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Pause between ticks; events are processed while idle.
    pub tick_interval: Duration,
    pub response_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub long_running_poll_interval: Duration,
    pub long_running_max_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            response_timeout: Duration::from_secs(2),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(5),
            long_running_poll_interval: Duration::from_millis(250),
            long_running_max_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOutcome {
    Done,
    Skipped,
    /// Move to the head of the class and retry after the backoff delay.
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Cancelled,
}

/// Drive one device until cancelled. Owns the device; on exit all
/// outstanding requests are cancelled and pending events drained.
pub async fn run_device(
    mut device: Device,
    requester: Arc<Requester>,
    mut surface: Box<dyn PublishingSurface>,
    mut events: DeviceEvents,
    config: SchedulerConfig,
    cancel: CancellationToken,
) {
    info!(
        "device {} (eid {}): scheduler starting with {} sensors",
        device.name,
        device.eid,
        device.sensor_count()
    );
    device.publish_static(surface.as_mut());
    refresh_capabilities(&mut device, &requester, &config).await;

    while !cancel.is_cancelled() {
        if device.rediscovery_pending {
            device.rediscovery_pending = false;
            device.capabilities = None;
            refresh_capabilities(&mut device, &requester, &config).await;
        }

        // Priority pass: every sensor, in class order, completed (or timed
        // out) before the round-robin emission below.
        let mut requeue = Vec::new();
        for index in 0..device.class_len(SensorClass::Priority) {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = poll_slot(
                &mut device,
                SensorClass::Priority,
                index,
                &requester,
                surface.as_mut(),
                &mut events,
                &config,
                &cancel,
            )
            .await;
            if outcome == SlotOutcome::Backoff {
                requeue.push(index);
            }
        }
        requeue_at_head(&mut device.priority, requeue);

        // One round-robin sensor per tick, strict rotation.
        let rr_len = device.class_len(SensorClass::RoundRobin);
        if rr_len > 0 && !cancel.is_cancelled() {
            let index = device.cursor % rr_len;
            device.cursor = (device.cursor + 1) % rr_len;
            let outcome = poll_slot(
                &mut device,
                SensorClass::RoundRobin,
                index,
                &requester,
                surface.as_mut(),
                &mut events,
                &config,
                &cancel,
            )
            .await;
            if outcome == SlotOutcome::Backoff {
                requeue_at_head(&mut device.round_robin, vec![index]);
            }
        }

        if idle(&mut device, &requester, surface.as_mut(), &mut events, &cancel, &config).await
            == Flow::Cancelled
        {
            break;
        }
    }

    requester.cancel_endpoint(device.eid);
    events.close();
    while events.try_recv().is_ok() {}
    info!("device {} scheduler stopped", device.name);
}

#[allow(clippy::too_many_arguments)]
async fn poll_slot(
    device: &mut Device,
    class: SensorClass,
    index: usize,
    requester: &Requester,
    surface: &mut dyn PublishingSurface,
    events: &mut DeviceEvents,
    config: &SchedulerConfig,
    cancel: &CancellationToken,
) -> SlotOutcome {
    let now = Instant::now();
    if device.slot_mut(class, index).due.is_some_and(|due| due > now.into()) {
        return SlotOutcome::Skipped;
    }

    let (msg_type, command) = device.with_slot(class, index, |sensor| sensor.command());
    if !device.command_supported(msg_type, command) {
        debug!(
            "device {}: command {msg_type}/{command:#04x} unsupported, skipping",
            device.name
        );
        return SlotOutcome::Skipped;
    }

    let eid = device.eid;
    let Some(request) = device.with_slot(class, index, |sensor| sensor.gen_request(eid, 0)) else {
        return SlotOutcome::Skipped;
    };

    match requester.send_recv(eid, request, Some(config.response_timeout)).await {
        Ok(response) => {
            let result = device
                .with_slot(class, index, |sensor| sensor.handle_response(&response, surface));
            match result {
                Ok(()) => {
                    let slot = device.slot_mut(class, index);
                    slot.backoff_exp = 0;
                    slot.due = None;
                    SlotOutcome::Done
                }
                Err(SensorError::Command { cc: CompletionCode::Accepted, .. }) => {
                    await_long_running(
                        device, requester, surface, events, msg_type, command, config, cancel,
                    )
                    .await;
                    apply_backoff(device.slot_mut(class, index), config);
                    SlotOutcome::Backoff
                }
                Err(SensorError::Command { cc: CompletionCode::Busy, .. }) => {
                    apply_backoff(device.slot_mut(class, index), config);
                    SlotOutcome::Backoff
                }
                Err(_already_logged) => SlotOutcome::Done,
            }
        }
        Err(TransportError::Timeout) => {
            let name = device.with_slot(class, index, |sensor| sensor.name().to_string());
            warn!("device {}: request for {name} timed out", device.name);
            device.with_slot(class, index, |sensor| sensor.on_transport_failure(surface));
            SlotOutcome::Done
        }
        Err(err @ TransportError::SendFail(_)) => {
            warn!("device {}: send failed: {err}", device.name);
            device.with_slot(class, index, |sensor| sensor.on_transport_failure(surface));
            apply_backoff(device.slot_mut(class, index), config);
            SlotOutcome::Backoff
        }
        Err(err) => {
            warn!("device {}: transport error: {err}", device.name);
            device.with_slot(class, index, |sensor| sensor.on_transport_failure(surface));
            SlotOutcome::Done
        }
    }
}

/// Exponential backoff, base doubling per consecutive failure, capped.
fn apply_backoff(slot: &mut SensorSlot, config: &SchedulerConfig) {
    let factor = 1u32 << slot.backoff_exp.min(16);
    let delay = config.backoff_base.saturating_mul(factor).min(config.backoff_cap);
    slot.backoff_exp = slot.backoff_exp.saturating_add(1);
    slot.due = Some((Instant::now() + delay).into());
}

/// Move the given slots to the front of their class, keeping their
/// relative order.
fn requeue_at_head(slots: &mut Vec<SensorSlot>, indices: Vec<usize>) {
    for index in indices.into_iter().rev() {
        let slot = slots.remove(index);
        slots.insert(0, slot);
    }
}

/// Wait for the completion event of a long-running command, processing
/// unrelated events normally in the meantime.
#[allow(clippy::too_many_arguments)]
async fn await_long_running(
    device: &mut Device,
    requester: &Requester,
    surface: &mut dyn PublishingSurface,
    events: &mut DeviceEvents,
    msg_type: u8,
    command: u8,
    config: &SchedulerConfig,
    cancel: &CancellationToken,
) {
    let deadline = Instant::now() + config.long_running_max_wait;
    loop {
        let now = Instant::now();
        if now >= deadline {
            warn!(
                "device {}: long-running command {msg_type}/{command:#04x} did not complete \
                 within {:?}",
                device.name, config.long_running_max_wait
            );
            return;
        }
        let wait = config.long_running_poll_interval.min(deadline - now);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
            maybe = events.recv() => {
                let Some(msg) = maybe else { return };
                if let Ok(result) =
                    wire_events::decode_long_running_resp(&msg, msg_type, command)
                {
                    match result.outcome {
                        Response::Success(_) => info!(
                            "device {}: long-running command {msg_type}/{command:#04x} completed",
                            device.name
                        ),
                        Response::Failed { cc, reason } => warn!(
                            "device {}: long-running command {msg_type}/{command:#04x} \
                             failed: {cc}, reason {reason}",
                            device.name
                        ),
                    }
                    return;
                }
                handle_event(device, requester, surface, &msg).await;
            }
        }
    }
}

/// Sleep until the next tick, reacting to events as they arrive.
async fn idle(
    device: &mut Device,
    requester: &Requester,
    surface: &mut dyn PublishingSurface,
    events: &mut DeviceEvents,
    cancel: &CancellationToken,
    config: &SchedulerConfig,
) -> Flow {
    let deadline = Instant::now() + config.tick_interval;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Flow::Cancelled,
            _ = tokio::time::sleep_until(deadline) => return Flow::Continue,
            maybe = events.recv() => match maybe {
                Some(msg) => handle_event(device, requester, surface, &msg).await,
                None => {
                    tokio::time::sleep_until(deadline).await;
                    return Flow::Continue;
                }
            }
        }
    }
}

async fn handle_event(
    device: &mut Device,
    requester: &Requester,
    surface: &mut dyn PublishingSurface,
    msg: &[u8],
) {
    let event = match wire_events::decode_event(msg) {
        Ok(event) => event,
        Err(err) => {
            debug!("device {}: undecodable event: {err}", device.name);
            return;
        }
    };

    if event.ackr {
        match wire_events::encode_event_acknowledgement(
            event.instance_id,
            event.msg_type,
            event.event_id,
        ) {
            Ok(ack) => {
                if let Err(err) = requester.send_datagram(device.eid, &ack).await {
                    warn!("device {}: event acknowledgement failed: {err}", device.name);
                }
            }
            Err(err) => warn!("device {}: could not encode event ack: {err}", device.name),
        }
    }

    match (event.msg_type, event.event_id) {
        (0, wire_events::REDISCOVERY_EVENT)
            if event.event_class == wire_events::EventClass::General =>
        {
            info!("device {}: rediscovery requested", device.name);
            device.rediscovery_pending = true;
        }
        (0, wire_events::LONG_RUNNING_EVENT) => {
            debug!("device {}: unsolicited long-running event", device.name);
        }
        (3, wire_events::XID_EVENT) => match wire_events::decode_xid_event_payload(event.data) {
            Ok(payload) => {
                warn!(
                    "device {}: XID event, reason {}, sequence {}",
                    device.name, payload.reason, payload.sequence_number
                );
                surface.set_property(
                    &device_path(&device.name),
                    "events",
                    "LastXidReason",
                    Value::from(payload.reason),
                );
            }
            Err(err) => debug!("device {}: bad XID payload: {err}", device.name),
        },
        (3, wire_events::RESET_REQUIRED_EVENT) => {
            warn!("device {}: reset required", device.name);
            surface.set_property(
                &device_path(&device.name),
                "events",
                "ResetRequired",
                Value::Bool(true),
            );
        }
        (msg_type, event_id) => {
            debug!(
                "device {}: unhandled event type {msg_type} id {event_id}",
                device.name
            );
        }
    }
}

/// Re-read the capability tables, supported message types first.
async fn refresh_capabilities(
    device: &mut Device,
    requester: &Requester,
    config: &SchedulerConfig,
) {
    let eid = device.eid;
    let request = match capability::encode_get_supported_nvidia_message_types_req(0) {
        Ok(request) => request,
        Err(err) => {
            warn!("device {}: capability request encode failed: {err}", device.name);
            return;
        }
    };
    let response = match requester.send_recv(eid, request, Some(config.response_timeout)).await {
        Ok(response) => response,
        Err(err) => {
            warn!("device {}: capability refresh failed: {err}", device.name);
            return;
        }
    };
    let msg_types = match capability::decode_get_supported_nvidia_message_types_resp(&response) {
        Ok(Response::Success(bitmap)) => bitmap,
        Ok(Response::Failed { cc, reason }) => {
            warn!(
                "device {}: supported message types failed: {cc}, reason {reason}",
                device.name
            );
            return;
        }
        Err(err) => {
            warn!("device {}: supported message types decode failed: {err}", device.name);
            return;
        }
    };

    let mut commands = FxHashMap::default();
    for msg_type in msg_types.iter_set().take_while(|msg_type| *msg_type < 7) {
        let request = match capability::encode_get_supported_command_codes_req(0, msg_type) {
            Ok(request) => request,
            Err(err) => {
                warn!("device {}: command codes encode failed: {err}", device.name);
                continue;
            }
        };
        match requester.send_recv(eid, request, Some(config.response_timeout)).await {
            Ok(response) => match capability::decode_get_supported_command_codes_resp(&response) {
                Ok(Response::Success(bitmap)) => {
                    commands.insert(msg_type, bitmap);
                }
                Ok(Response::Failed { cc, reason }) => warn!(
                    "device {}: command codes for type {msg_type} failed: {cc}, reason {reason}",
                    device.name
                ),
                Err(err) => warn!(
                    "device {}: command codes for type {msg_type} undecodable: {err}",
                    device.name
                ),
            },
            Err(err) => warn!(
                "device {}: command codes request for type {msg_type} failed: {err}",
                device.name
            ),
        }
    }

    device.capabilities = Some(Capabilities { msg_types, commands });
    info!("device {}: capability tables refreshed", device.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use crate::publish::NullSurface;
    use crate::sensors::TempSensor;
    use nsm_codec::{environmental, Bitmap256, ReasonCode};
    use nsm_mctp::{MctpSocket, RequesterConfig};
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::sync::Mutex;

    fn seqpacket_pair() -> (OwnedFd, OwnedFd) {
        nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::SeqPacket,
            None,
            nix::sys::socket::SockFlag::empty(),
        )
        .unwrap()
    }

    /// Pretends to be a GPU behind the demultiplexer: answers capability
    /// queries and temperature reads, and records every request it sees as
    /// `(msg_type, command, first payload byte)`.
    struct FakeGpu {
        fd: OwnedFd,
        seen: Arc<Mutex<Vec<(u8, u8, u8)>>>,
    }

    impl FakeGpu {
        fn serve(self) {
            let mut buf = [0u8; 4096];
            loop {
                let len = match nix::sys::socket::recv(
                    self.fd.as_raw_fd(),
                    &mut buf,
                    nix::sys::socket::MsgFlags::empty(),
                ) {
                    Ok(0) | Err(_) => return,
                    Ok(len) => len,
                };
                let eid = buf[1];
                let msg = &buf[3..len];
                let header = nsm_codec::unpack_header(msg).unwrap();
                let command = msg[nsm_codec::HDR_LEN];
                let arg = msg.get(nsm_codec::HDR_LEN + 2).copied().unwrap_or(0);
                self.seen.lock().unwrap().push((header.msg_type, command, arg));

                let instance_id = header.instance_id;
                let response = match (header.msg_type, command) {
                    (0, capability::SUPPORTED_NVIDIA_MESSAGE_TYPES) => {
                        let mut types = Bitmap256::EMPTY;
                        types.set(0);
                        types.set(3);
                        capability::encode_get_supported_nvidia_message_types_resp(
                            instance_id,
                            CompletionCode::Success,
                            ReasonCode::NONE,
                            &types,
                        )
                        .unwrap()
                    }
                    (0, capability::SUPPORTED_COMMAND_CODES) => {
                        let all = Bitmap256([0xff; 32]);
                        capability::encode_get_supported_command_codes_resp(
                            instance_id,
                            CompletionCode::Success,
                            ReasonCode::NONE,
                            &all,
                        )
                        .unwrap()
                    }
                    (3, environmental::GET_TEMPERATURE_READING) => {
                        environmental::encode_get_temperature_reading_resp(
                            instance_id,
                            CompletionCode::Success,
                            ReasonCode::NONE,
                            30.0,
                        )
                        .unwrap()
                    }
                    _ => continue,
                };
                let mut packet = vec![0x08, eid, nsm_mctp::MCTP_MSG_TYPE_PCI_VDM];
                packet.extend_from_slice(&response);
                let _ = nix::sys::socket::send(
                    self.fd.as_raw_fd(),
                    &packet,
                    nix::sys::socket::MsgFlags::empty(),
                );
            }
        }
    }

    struct Harness {
        requester: Arc<Requester>,
        seen: Arc<Mutex<Vec<(u8, u8, u8)>>>,
        events_tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
        events_rx: Option<DeviceEvents>,
    }

    fn harness() -> Harness {
        let (near, far) = seqpacket_pair();
        let socket = MctpSocket::from_fd(near).unwrap();
        let (requester, _transport_events) = Requester::new(socket, RequesterConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let gpu = FakeGpu { fd: far, seen: seen.clone() };
        // Exits when the requester side of the socketpair closes.
        std::thread::spawn(move || gpu.serve());
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        Harness { requester: Arc::new(requester), seen, events_tx, events_rx: Some(events_rx) }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(10),
            response_timeout: Duration::from_millis(500),
            ..SchedulerConfig::default()
        }
    }

    fn temp_device(sensor_ids: &[u8], priority_ids: &[u8]) -> Device {
        let mut device = Device::new(DeviceId::nil(), 8, "GPU_0");
        for id in priority_ids {
            device.add_sensor(
                Box::new(TempSensor::new(format!("PRIO_{id}"), *id, Vec::new())),
                SensorClass::Priority,
            );
        }
        for id in sensor_ids {
            device.add_sensor(
                Box::new(TempSensor::new(format!("RR_{id}"), *id, Vec::new())),
                SensorClass::RoundRobin,
            );
        }
        device
    }

    fn temp_requests(seen: &[(u8, u8, u8)]) -> Vec<u8> {
        seen.iter()
            .filter(|(msg_type, command, _)| {
                *msg_type == 3 && *command == environmental::GET_TEMPERATURE_READING
            })
            .map(|(_, _, sensor_id)| *sensor_id)
            .collect()
    }

    // Every round-robin sensor is polled once per |round_robin| ticks.
    #[tokio::test]
    async fn round_robin_rotates_without_starvation() {
        let mut h = harness();
        let device = temp_device(&[1, 2, 3], &[]);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_device(
            device,
            h.requester.clone(),
            Box::new(NullSurface),
            h.events_rx.take().unwrap(),
            fast_config(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        let polled = temp_requests(&h.seen.lock().unwrap());
        assert!(polled.len() >= 6, "expected several ticks, saw {polled:?}");
        // Strict rotation: every window of three consecutive polls covers
        // all three sensors.
        for window in polled.chunks_exact(3) {
            let mut sorted = window.to_vec();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![1, 2, 3], "rotation broke: {polled:?}");
        }

        h.requester.shutdown();
    }

    // Priority sensors go first in every tick.
    #[tokio::test]
    async fn priority_sensors_precede_round_robin() {
        let mut h = harness();
        let device = temp_device(&[1, 2], &[9]);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_device(
            device,
            h.requester.clone(),
            Box::new(NullSurface),
            h.events_rx.take().unwrap(),
            fast_config(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        task.await.unwrap();

        let polled = temp_requests(&h.seen.lock().unwrap());
        assert!(polled.len() >= 4);
        // Pattern per tick is [9, rr]: even positions are the priority
        // sensor.
        for pair in polled.chunks_exact(2) {
            assert_eq!(pair[0], 9, "priority sensor did not lead the tick: {polled:?}");
            assert_ne!(pair[1], 9);
        }

        h.requester.shutdown();
    }

    // A rediscovery event makes the next tick start with Get Supported
    // NVIDIA Message Types.
    #[tokio::test]
    async fn rediscovery_reissues_capability_queries() {
        let mut h = harness();
        let device = temp_device(&[1], &[]);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_device(
            device,
            h.requester.clone(),
            Box::new(NullSurface),
            h.events_rx.take().unwrap(),
            fast_config(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let mark = h.seen.lock().unwrap().len();

        let event = wire_events::encode_event(
            0,
            0,
            false,
            wire_events::EVENT_VERSION,
            wire_events::REDISCOVERY_EVENT,
            wire_events::EventClass::General,
            0,
            &[],
        )
        .unwrap();
        h.events_tx.send(event).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        let seen = h.seen.lock().unwrap();
        let after = &seen[mark..];
        let first_capability = after
            .iter()
            .position(|(msg_type, _, _)| *msg_type == 0)
            .expect("no capability query after rediscovery");
        assert_eq!(
            after[first_capability].1,
            capability::SUPPORTED_NVIDIA_MESSAGE_TYPES,
            "rediscovery must start with supported message types: {after:?}"
        );

        drop(seen);
        h.requester.shutdown();
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let config = SchedulerConfig::default();
        let mut slot = SensorSlot {
            inner: crate::device::SlotSensor::Leaf(Box::new(TempSensor::new(
                "t",
                0,
                Vec::new(),
            ))),
            due: None,
            backoff_exp: 0,
        };

        let mut last = Duration::ZERO;
        for _ in 0..4 {
            apply_backoff(&mut slot, &config);
            let remaining = slot.due.unwrap() - std::time::Instant::from(Instant::now());
            assert!(remaining > last);
            last = remaining;
        }
        for _ in 0..10 {
            apply_backoff(&mut slot, &config);
        }
        let remaining = slot.due.unwrap() - std::time::Instant::from(Instant::now());
        assert!(remaining <= config.backoff_cap);
    }
}

//! Per-device state: sensor populations, aggregator table, capability
//! cache.

use std::time::Instant;

use log::info;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use nsm_codec::{Bitmap256, CodecError};

use crate::aggregator::{AddChild, AggregateKind, ChildSensor, NumericAggregator};
use crate::publish::PublishingSurface;
use crate::sensor::Sensor;

pub type DeviceId = Uuid;

/// Scheduling class of a sensor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorClass {
    /// Emitted every tick.
    Priority,
    /// One per tick, strict rotation.
    RoundRobin,
}

/// What a slot schedules: a leaf sensor it owns, or a reference into the
/// device's aggregator table.
pub(crate) enum SlotSensor {
    Leaf(Box<dyn Sensor>),
    Aggregator((u8, u8)),
}

/// One schedulable entry plus its backoff state.
pub struct SensorSlot {
    pub(crate) inner: SlotSensor,
    /// Not eligible before this instant; set by ACCEPTED/BUSY backoff.
    pub(crate) due: Option<Instant>,
    pub(crate) backoff_exp: u32,
}

impl SensorSlot {
    fn leaf(sensor: Box<dyn Sensor>) -> Self {
        Self { inner: SlotSensor::Leaf(sensor), due: None, backoff_exp: 0 }
    }

    fn aggregator(key: (u8, u8)) -> Self {
        Self { inner: SlotSensor::Aggregator(key), due: None, backoff_exp: 0 }
    }
}

/// Capability tables learned from the device, invalidated by rediscovery.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub msg_types: Bitmap256,
    pub commands: FxHashMap<u8, Bitmap256>,
}

impl Capabilities {
    pub fn supports(&self, msg_type: u8, command: u8) -> bool {
        self.msg_types.get(msg_type)
            && self.commands.get(&msg_type).is_some_and(|codes| codes.get(command))
    }
}

/// One NSM endpoint and everything the daemon polls on it.
pub struct Device {
    pub uuid: DeviceId,
    pub eid: u8,
    pub name: String,
    event_mode: u8,
    pub(crate) priority: Vec<SensorSlot>,
    pub(crate) round_robin: Vec<SensorSlot>,
    pub(crate) cursor: usize,
    aggregators: FxHashMap<(u8, u8), NumericAggregator>,
    pub(crate) capabilities: Option<Capabilities>,
    pub(crate) rediscovery_pending: bool,
}

impl Device {
    pub fn new(uuid: DeviceId, eid: u8, name: impl Into<String>) -> Self {
        Self {
            uuid,
            eid,
            name: name.into(),
            event_mode: 0,
            priority: Vec::new(),
            round_robin: Vec::new(),
            cursor: 0,
            aggregators: FxHashMap::default(),
            capabilities: None,
            rediscovery_pending: false,
        }
    }

    pub fn event_mode(&self) -> u8 {
        self.event_mode
    }

    pub fn set_event_mode(&mut self, mode: u8) {
        self.event_mode = mode;
    }

    pub fn sensor_count(&self) -> usize {
        self.priority.len() + self.round_robin.len()
    }

    /// Add a standalone sensor to the given class.
    pub fn add_sensor(&mut self, sensor: Box<dyn Sensor>, class: SensorClass) {
        let slot = SensorSlot::leaf(sensor);
        match class {
            SensorClass::Priority => self.priority.push(slot),
            SensorClass::RoundRobin => self.round_robin.push(slot),
        }
    }

    /// Route a sensor into the aggregator for its command family, creating
    /// the aggregator on first use. At most one aggregator exists per
    /// `(msg_type, command)`; a priority child promotes it into the
    /// priority class.
    pub fn add_aggregated(
        &mut self,
        kind: AggregateKind,
        tag: u8,
        child: ChildSensor,
        priority: bool,
    ) -> Result<(), CodecError> {
        let key = (nsm_codec::MessageType::PlatformEnvironmental as u8, kind.command());
        if !self.aggregators.contains_key(&key) {
            let aggregator = NumericAggregator::new(
                format!("{}_{:#04x}_Aggregator", self.name, kind.command()),
                kind,
                priority,
            );
            info!(
                "device {}: new aggregator {} ({:?})",
                self.name,
                aggregator.name(),
                kind
            );
            self.aggregators.insert(key, aggregator);
            let slot = SensorSlot::aggregator(key);
            if priority {
                self.priority.push(slot);
            } else {
                self.round_robin.push(slot);
            }
            return self.aggregators.get_mut(&key).unwrap().add_child(tag, child, false).map(drop);
        }

        let aggregator = self.aggregators.get_mut(&key).unwrap();
        if aggregator.add_child(tag, child, priority)? == AddChild::Promoted {
            self.promote(key);
        }
        Ok(())
    }

    pub fn aggregator(&self, msg_type: u8, command: u8) -> Option<&NumericAggregator> {
        self.aggregators.get(&(msg_type, command))
    }

    /// Move an aggregator slot from the round-robin class to the priority
    /// class. Called between ticks, never while a tick is running.
    fn promote(&mut self, key: (u8, u8)) {
        let position = self.round_robin.iter().position(
            |slot| matches!(slot.inner, SlotSensor::Aggregator(k) if k == key),
        );
        if let Some(position) = position {
            let slot = self.round_robin.remove(position);
            if position < self.cursor && self.cursor > 0 {
                self.cursor -= 1;
            }
            self.priority.push(slot);
        }
    }

    pub(crate) fn slot_mut(&mut self, class: SensorClass, index: usize) -> &mut SensorSlot {
        match class {
            SensorClass::Priority => &mut self.priority[index],
            SensorClass::RoundRobin => &mut self.round_robin[index],
        }
    }

    /// Run `f` against the sensor behind a slot, resolving aggregator
    /// references through the table.
    pub(crate) fn with_slot<R>(
        &mut self,
        class: SensorClass,
        index: usize,
        f: impl FnOnce(&mut dyn Sensor) -> R,
    ) -> R {
        let slot = match class {
            SensorClass::Priority => &mut self.priority[index],
            SensorClass::RoundRobin => &mut self.round_robin[index],
        };
        match &mut slot.inner {
            SlotSensor::Leaf(sensor) => f(sensor.as_mut()),
            SlotSensor::Aggregator(key) => {
                let aggregator = self
                    .aggregators
                    .get_mut(key)
                    .expect("aggregator slot without table entry");
                f(aggregator)
            }
        }
    }

    /// Publish availability and associations for every sensor.
    pub fn publish_static(&mut self, surface: &mut dyn PublishingSurface) {
        for class in [SensorClass::Priority, SensorClass::RoundRobin] {
            for index in 0..self.class_len(class) {
                self.with_slot(class, index, |sensor| sensor.publish_static(surface));
            }
        }
    }

    pub(crate) fn class_len(&self, class: SensorClass) -> usize {
        match class {
            SensorClass::Priority => self.priority.len(),
            SensorClass::RoundRobin => self.round_robin.len(),
        }
    }

    /// True when the capability cache says this command will be answered.
    /// Unknown capabilities mean "try it".
    pub(crate) fn command_supported(&self, msg_type: u8, command: u8) -> bool {
        match &self.capabilities {
            Some(capabilities) => capabilities.supports(msg_type, command),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::TempSensor;

    fn device() -> Device {
        Device::new(Uuid::nil(), 8, "GPU_0")
    }

    fn child(name: &str) -> ChildSensor {
        ChildSensor { name: name.into(), path: format!("sensors/temperature/{name}") }
    }

    #[test]
    fn aggregator_is_created_once_per_command() {
        let mut dev = device();
        dev.add_aggregated(AggregateKind::Temperature, 0, child("a"), false).unwrap();
        dev.add_aggregated(AggregateKind::Temperature, 1, child("b"), false).unwrap();
        assert_eq!(dev.round_robin.len(), 1);
        assert!(dev
            .aggregator(3, nsm_codec::environmental::GET_TEMPERATURE_READING)
            .is_some());
    }

    #[test]
    fn duplicate_tag_is_rejected() {
        let mut dev = device();
        dev.add_aggregated(AggregateKind::Temperature, 0, child("a"), false).unwrap();
        assert!(dev
            .add_aggregated(AggregateKind::Temperature, 0, child("b"), false)
            .is_err());
    }

    #[test]
    fn priority_child_promotes_aggregator() {
        let mut dev = device();
        dev.add_aggregated(AggregateKind::Temperature, 0, child("a"), false).unwrap();
        assert_eq!(dev.round_robin.len(), 1);
        assert_eq!(dev.priority.len(), 0);

        dev.add_aggregated(AggregateKind::Temperature, 1, child("b"), true).unwrap();
        assert_eq!(dev.round_robin.len(), 0);
        assert_eq!(dev.priority.len(), 1);

        // A third priority child must not add another slot.
        dev.add_aggregated(AggregateKind::Temperature, 2, child("c"), true).unwrap();
        assert_eq!(dev.priority.len(), 1);
    }

    #[test]
    fn leaf_sensors_land_in_their_class() {
        let mut dev = device();
        dev.add_sensor(
            Box::new(TempSensor::new("GPU_0_TEMP", 0, Vec::new())),
            SensorClass::Priority,
        );
        dev.add_sensor(
            Box::new(TempSensor::new("GPU_0_TEMP_1", 1, Vec::new())),
            SensorClass::RoundRobin,
        );
        assert_eq!(dev.priority.len(), 1);
        assert_eq!(dev.round_robin.len(), 1);
    }

    #[test]
    fn event_mode_round_trips() {
        let mut dev = device();
        dev.set_event_mode(2);
        assert_eq!(dev.event_mode(), 2);
    }

    #[test]
    fn unknown_capabilities_allow_everything() {
        let dev = device();
        assert!(dev.command_supported(3, 0x00));
    }

    #[test]
    fn capability_tables_gate_commands() {
        let mut dev = device();
        let mut msg_types = Bitmap256::EMPTY;
        msg_types.set(3);
        let mut env_commands = Bitmap256::EMPTY;
        env_commands.set(0x00);
        let mut commands = FxHashMap::default();
        commands.insert(3u8, env_commands);
        dev.capabilities = Some(Capabilities { msg_types, commands });

        assert!(dev.command_supported(3, 0x00));
        assert!(!dev.command_supported(3, 0x0f));
        assert!(!dev.command_supported(0, 0x00));
    }
}

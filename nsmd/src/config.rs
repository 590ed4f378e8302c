//! Declarative sensor configuration.
//!
//! The daemon consumes a JSON document listing devices by UUID, the EID
//! table that maps UUIDs onto MCTP endpoints, and one descriptor per
//! sensor. Descriptors marked `aggregated` share their family's aggregate
//! command; `priority` selects the every-tick scheduling class.

use log::info;
use rustc_hash::FxHashMap;
use serde_derive::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use nsm_codec::environmental::ClockType;

use crate::aggregator::{AggregateKind, ChildSensor};
use crate::device::{Device, SensorClass};
use crate::sensor::Association;
use crate::sensors::{
    self, DriverInfoSensor, EnergySensor, MemoryCapacityUtilSensor, PciGroupSensor, PowerSensor,
    ResetControl, RowRemapKind, TempSensor, ThresholdSensor, VoltageSensor,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("device {device}: sensor {sensor}: {source}")]
    Sensor {
        device: String,
        sensor: String,
        #[source]
        source: nsm_codec::CodecError,
    },
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub eid_table: Vec<EidMapping>,
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub sensors: Vec<SensorDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct EidMapping {
    pub uuid: Uuid,
    pub eids: Vec<EidEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EidEntry {
    pub eid: u8,
    pub medium: String,
    pub binding: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSelector {
    Graphics,
    Memory,
}

impl From<ClockSelector> for ClockType {
    fn from(selector: ClockSelector) -> Self {
        match selector {
            ClockSelector::Graphics => ClockType::Graphics,
            ClockSelector::Memory => ClockType::Memory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowRemapSelector {
    State,
    Counts,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssociationConfig {
    pub forward: String,
    pub backward: String,
    pub absolute_path: String,
}

impl From<&AssociationConfig> for Association {
    fn from(config: &AssociationConfig) -> Self {
        Self {
            forward: config.forward.clone(),
            backward: config.backward.clone(),
            absolute_path: config.absolute_path.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorDescriptor {
    Temp {
        name: String,
        sensor_id: u8,
        #[serde(default)]
        aggregated: bool,
        #[serde(default)]
        priority: bool,
        #[serde(default)]
        associations: Vec<AssociationConfig>,
    },
    Power {
        name: String,
        sensor_id: u8,
        #[serde(default)]
        averaging_interval: u8,
        #[serde(default)]
        aggregated: bool,
        #[serde(default)]
        priority: bool,
        #[serde(default)]
        associations: Vec<AssociationConfig>,
    },
    Energy {
        name: String,
        sensor_id: u8,
        #[serde(default)]
        aggregated: bool,
        #[serde(default)]
        priority: bool,
        #[serde(default)]
        associations: Vec<AssociationConfig>,
    },
    Voltage {
        name: String,
        sensor_id: u8,
        #[serde(default)]
        aggregated: bool,
        #[serde(default)]
        priority: bool,
        #[serde(default)]
        associations: Vec<AssociationConfig>,
    },
    Threshold {
        name: String,
        parameter_id: u8,
        #[serde(default)]
        aggregated: bool,
        #[serde(default)]
        priority: bool,
    },
    /// Peak power is sampled through the aggregate command only.
    PeakPower {
        name: String,
        sensor_id: u8,
        #[serde(default)]
        averaging_interval: u8,
        #[serde(default)]
        priority: bool,
    },
    Mig,
    Ecc,
    EccErrorCounts,
    EdppScalingFactor,
    ClockLimit {
        clock_type: ClockSelector,
    },
    CurrentClockFreq {
        clock_type: ClockSelector,
    },
    MemoryCapacityUtilization,
    RowRemapping {
        remap_kind: RowRemapSelector,
    },
    PciGroup {
        group_index: u8,
        device_id: u8,
    },
    DriverInfo,
    Reset {
        device_index: u8,
    },
}

/// UUID to endpoint mapping. A UUID may be reachable over several media;
/// lookup prefers PCIe.
#[derive(Debug, Default)]
pub struct EidTable {
    entries: FxHashMap<Uuid, Vec<EidEntry>>,
}

impl EidTable {
    pub fn from_config(mappings: &[EidMapping]) -> Self {
        let mut entries: FxHashMap<Uuid, Vec<EidEntry>> = FxHashMap::default();
        for mapping in mappings {
            entries.entry(mapping.uuid).or_default().extend(mapping.eids.iter().cloned());
        }
        Self { entries }
    }

    pub fn lookup(&self, uuid: &Uuid) -> Option<&EidEntry> {
        let entries = self.entries.get(uuid)?;
        entries.iter().find(|entry| entry.medium == "PCIe").or_else(|| entries.first())
    }
}

/// Build the runtime device from its configuration.
pub fn build_device(config: &DeviceConfig, eid: u8) -> Result<Device, ConfigError> {
    let mut device = Device::new(config.uuid, eid, config.name.clone());
    let device_name = &config.name;

    for descriptor in &config.sensors {
        build_sensor(&mut device, device_name, descriptor).map_err(|source| {
            ConfigError::Sensor {
                device: device_name.clone(),
                sensor: format!("{descriptor:?}"),
                source,
            }
        })?;
    }

    info!(
        "device {}: built {} sensors from configuration",
        device_name,
        device.sensor_count()
    );
    Ok(device)
}

fn class(priority: bool) -> SensorClass {
    if priority {
        SensorClass::Priority
    } else {
        SensorClass::RoundRobin
    }
}

fn build_sensor(
    device: &mut Device,
    device_name: &str,
    descriptor: &SensorDescriptor,
) -> Result<(), nsm_codec::CodecError> {
    match descriptor {
        SensorDescriptor::Temp { name, sensor_id, aggregated, priority, associations } => {
            if *aggregated {
                device.add_aggregated(
                    AggregateKind::Temperature,
                    *sensor_id,
                    child("temperature", name),
                    *priority,
                )?;
            } else {
                let associations = associations.iter().map(Association::from).collect();
                device.add_sensor(
                    Box::new(TempSensor::new(name.clone(), *sensor_id, associations)),
                    class(*priority),
                );
            }
        }
        SensorDescriptor::Power {
            name,
            sensor_id,
            averaging_interval,
            aggregated,
            priority,
            associations,
        } => {
            if *aggregated {
                device.add_aggregated(
                    AggregateKind::Power { averaging_interval: *averaging_interval },
                    *sensor_id,
                    child("power", name),
                    *priority,
                )?;
            } else {
                let associations = associations.iter().map(Association::from).collect();
                device.add_sensor(
                    Box::new(PowerSensor::new(
                        name.clone(),
                        *sensor_id,
                        *averaging_interval,
                        associations,
                    )),
                    class(*priority),
                );
            }
        }
        SensorDescriptor::Energy { name, sensor_id, aggregated, priority, associations } => {
            if *aggregated {
                device.add_aggregated(
                    AggregateKind::Energy,
                    *sensor_id,
                    child("energy", name),
                    *priority,
                )?;
            } else {
                let associations = associations.iter().map(Association::from).collect();
                device.add_sensor(
                    Box::new(EnergySensor::new(name.clone(), *sensor_id, associations)),
                    class(*priority),
                );
            }
        }
        SensorDescriptor::Voltage { name, sensor_id, aggregated, priority, associations } => {
            if *aggregated {
                device.add_aggregated(
                    AggregateKind::Voltage,
                    *sensor_id,
                    child("voltage", name),
                    *priority,
                )?;
            } else {
                let associations = associations.iter().map(Association::from).collect();
                device.add_sensor(
                    Box::new(VoltageSensor::new(name.clone(), *sensor_id, associations)),
                    class(*priority),
                );
            }
        }
        SensorDescriptor::Threshold { name, parameter_id, aggregated, priority } => {
            if *aggregated {
                device.add_aggregated(
                    AggregateKind::ThermalParameter,
                    *parameter_id,
                    child("temperature", name),
                    *priority,
                )?;
            } else {
                device.add_sensor(
                    Box::new(ThresholdSensor::new(name.clone(), *parameter_id)),
                    class(*priority),
                );
            }
        }
        SensorDescriptor::PeakPower { name, sensor_id, averaging_interval, priority } => {
            device.add_aggregated(
                AggregateKind::PeakPower { averaging_interval: *averaging_interval },
                *sensor_id,
                child("power", name),
                *priority,
            )?;
        }
        SensorDescriptor::Mig => {
            device.add_sensor(
                Box::new(sensors::MigSensor::new(device_name)),
                SensorClass::RoundRobin,
            );
        }
        SensorDescriptor::Ecc => {
            device.add_sensor(
                Box::new(sensors::EccModeSensor::new(device_name)),
                SensorClass::RoundRobin,
            );
        }
        SensorDescriptor::EccErrorCounts => {
            device.add_sensor(
                Box::new(sensors::EccErrorCountsSensor::new(device_name)),
                SensorClass::RoundRobin,
            );
        }
        SensorDescriptor::EdppScalingFactor => {
            device.add_sensor(
                Box::new(sensors::EdppSensor::new(device_name)),
                SensorClass::RoundRobin,
            );
        }
        SensorDescriptor::ClockLimit { clock_type } => {
            device.add_sensor(
                Box::new(sensors::ClockLimitSensor::new(device_name, (*clock_type).into())),
                SensorClass::RoundRobin,
            );
        }
        SensorDescriptor::CurrentClockFreq { clock_type } => {
            device.add_sensor(
                Box::new(sensors::CurrentClockFreqSensor::new(
                    device_name,
                    (*clock_type).into(),
                )),
                SensorClass::RoundRobin,
            );
        }
        SensorDescriptor::MemoryCapacityUtilization => {
            device.add_sensor(
                Box::new(MemoryCapacityUtilSensor::new(device_name)),
                SensorClass::RoundRobin,
            );
        }
        SensorDescriptor::RowRemapping { remap_kind } => {
            let kind = match remap_kind {
                RowRemapSelector::State => RowRemapKind::State,
                RowRemapSelector::Counts => RowRemapKind::Counts,
            };
            device.add_sensor(
                Box::new(sensors::RowRemapSensor::new(device_name, kind)),
                SensorClass::RoundRobin,
            );
        }
        SensorDescriptor::PciGroup { group_index, device_id } => {
            device.add_sensor(
                Box::new(PciGroupSensor::new(device_name, *group_index, *device_id)),
                SensorClass::RoundRobin,
            );
        }
        SensorDescriptor::DriverInfo => {
            device.add_sensor(
                Box::new(DriverInfoSensor::new(device_name)),
                SensorClass::RoundRobin,
            );
        }
        SensorDescriptor::Reset { device_index } => {
            device.add_sensor(
                Box::new(ResetControl::new(device_name, *device_index)),
                SensorClass::RoundRobin,
            );
        }
    }
    Ok(())
}

fn child(category: &str, name: &str) -> ChildSensor {
    ChildSensor { name: name.to_string(), path: format!("sensors/{category}/{name}") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_sensor_kind_is_rejected() {
        let text = r#"{
            "devices": [
                {"uuid": "c7f46dc6-4e14-4c1d-9b44-f7bdbf5467a4",
                 "name": "GPU_0",
                 "sensors": [{"kind": "fan_pwm", "name": "x"}]}
            ]
        }"#;
        assert!(Config::from_json(text).is_err());
    }

    const GOOD: &str = r#"{
        "devices": [
            {
                "uuid": "c7f46dc6-4e14-4c1d-9b44-f7bdbf5467a4",
                "name": "GPU_0",
                "sensors": [
                    {"kind": "temp", "name": "GPU_0_TEMP_0", "sensor_id": 0,
                     "aggregated": true, "priority": true},
                    {"kind": "temp", "name": "GPU_0_TEMP_1", "sensor_id": 1,
                     "aggregated": true},
                    {"kind": "power", "name": "GPU_0_POWER", "sensor_id": 0,
                     "priority": true},
                    {"kind": "energy", "name": "GPU_0_ENERGY", "sensor_id": 0},
                    {"kind": "peak_power", "name": "GPU_0_PEAK", "sensor_id": 0,
                     "averaging_interval": 1},
                    {"kind": "mig"},
                    {"kind": "driver_info"},
                    {"kind": "row_remapping", "remap_kind": "state"}
                ]
            }
        ],
        "eid_table": [
            {
                "uuid": "c7f46dc6-4e14-4c1d-9b44-f7bdbf5467a4",
                "eids": [
                    {"eid": 30, "medium": "I2C", "binding": "SMBus"},
                    {"eid": 8, "medium": "PCIe", "binding": "PCIe"}
                ]
            }
        ]
    }"#;

    #[test]
    fn eid_lookup_prefers_pcie() {
        let config = Config::from_json(GOOD).unwrap();
        let table = EidTable::from_config(&config.eid_table);
        let entry = table.lookup(&config.devices[0].uuid).unwrap();
        assert_eq!(entry.eid, 8);
        assert_eq!(entry.medium, "PCIe");
    }

    #[test]
    fn build_creates_expected_classes() {
        let config = Config::from_json(GOOD).unwrap();
        let device = build_device(&config.devices[0], 8).unwrap();
        // Temp aggregator promoted by its priority child, plus the
        // standalone priority power sensor.
        assert_eq!(device.sensor_count(), 7);
    }

    #[test]
    fn duplicate_aggregate_tags_are_rejected() {
        let config = DeviceConfig {
            uuid: Uuid::nil(),
            name: "GPU_0".into(),
            sensors: vec![
                SensorDescriptor::Temp {
                    name: "a".into(),
                    sensor_id: 0,
                    aggregated: true,
                    priority: false,
                    associations: Vec::new(),
                },
                SensorDescriptor::Temp {
                    name: "b".into(),
                    sensor_id: 0,
                    aggregated: true,
                    priority: false,
                    associations: Vec::new(),
                },
            ],
        };
        assert!(build_device(&config, 8).is_err());
    }
}

//! Numeric aggregators: one request, many tagged samples, many sensors.

use log::{debug, error};
use rustc_hash::FxHashMap;

use nsm_codec::aggregate::{
    self, AggregateResponse, MAX_UNRESERVED_TAG, TIMESTAMP_TAG,
};
use nsm_codec::{environmental, CodecError, MessageType, ReasonCode};

use crate::publish::{PublishingSurface, Unit};
use crate::sensor::{log_failure, ErrorBitmap, Sensor, SensorError};

/// Sensor id wildcard: one request samples every sensor of the family.
const ALL_SENSORS: u8 = 0xff;

/// The command family an aggregator speaks, with the per-family request
/// parameters and sample decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Temperature,
    Power { averaging_interval: u8 },
    PeakPower { averaging_interval: u8 },
    Energy,
    Voltage,
    ThermalParameter,
}

impl AggregateKind {
    pub fn command(&self) -> u8 {
        match self {
            Self::Temperature => environmental::GET_TEMPERATURE_READING,
            Self::Power { .. } => environmental::GET_CURRENT_POWER_DRAW,
            Self::PeakPower { .. } => environmental::GET_MAX_OBSERVED_POWER,
            Self::Energy => environmental::GET_CURRENT_ENERGY_COUNT,
            Self::Voltage => environmental::GET_VOLTAGE,
            Self::ThermalParameter => environmental::READ_THERMAL_PARAMETER,
        }
    }

    pub fn unit(&self) -> Unit {
        match self {
            Self::Temperature | Self::ThermalParameter => Unit::DegreesC,
            Self::Power { .. } | Self::PeakPower { .. } => Unit::Watts,
            Self::Energy => Unit::Joules,
            Self::Voltage => Unit::Volts,
        }
    }

    fn encode_request(&self, instance_id: u8) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Temperature => {
                environmental::encode_get_temperature_reading_req(instance_id, ALL_SENSORS)
            }
            Self::Power { averaging_interval } => {
                environmental::encode_get_current_power_draw_req(
                    instance_id,
                    ALL_SENSORS,
                    *averaging_interval,
                )
            }
            Self::PeakPower { averaging_interval } => {
                environmental::encode_get_max_observed_power_req(
                    instance_id,
                    ALL_SENSORS,
                    *averaging_interval,
                )
            }
            Self::Energy => {
                environmental::encode_get_current_energy_count_req(instance_id, ALL_SENSORS)
            }
            Self::Voltage => environmental::encode_get_voltage_req(instance_id, ALL_SENSORS),
            Self::ThermalParameter => {
                environmental::encode_read_thermal_parameter_req(instance_id, ALL_SENSORS)
            }
        }
    }

    /// Decode one sample into the published unit (watts, volts, joules,
    /// degrees).
    fn decode_sample(&self, data: &[u8]) -> Result<f64, CodecError> {
        match self {
            Self::Temperature => aggregate::decode_temperature_sample(data),
            Self::Power { .. } | Self::PeakPower { .. } => {
                Ok(f64::from(aggregate::decode_power_sample(data)?) / 1000.0)
            }
            Self::Energy => Ok(aggregate::decode_energy_sample(data)? as f64 / 1000.0),
            Self::Voltage => {
                Ok(f64::from(aggregate::decode_voltage_sample(data)?) / 1_000_000.0)
            }
            Self::ThermalParameter => {
                Ok(f64::from(aggregate::decode_thermal_parameter_sample(data)?))
            }
        }
    }
}

/// A child slot: where one tag's readings are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSensor {
    pub name: String,
    pub path: String,
}

/// Outcome of [`NumericAggregator::add_child`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddChild {
    Added,
    /// First priority child; the device must move this aggregator into the
    /// priority class.
    Promoted,
}

/// One aggregate-capable command on one device, fanning samples out to the
/// children registered by tag.
pub struct NumericAggregator {
    name: String,
    kind: AggregateKind,
    priority: bool,
    children: FxHashMap<u8, ChildSensor>,
    timestamp: Option<u64>,
    unmapped_samples: u64,
    errors: ErrorBitmap,
}

impl NumericAggregator {
    pub fn new(name: impl Into<String>, kind: AggregateKind, priority: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            priority,
            children: FxHashMap::default(),
            timestamp: None,
            unmapped_samples: 0,
            errors: ErrorBitmap::default(),
        }
    }

    pub fn kind(&self) -> AggregateKind {
        self.kind
    }

    pub fn priority(&self) -> bool {
        self.priority
    }

    /// Register `child` under `tag`. A duplicate tag is refused; a priority
    /// child promotes the whole aggregator exactly once.
    pub fn add_child(
        &mut self,
        tag: u8,
        child: ChildSensor,
        priority: bool,
    ) -> Result<AddChild, CodecError> {
        if tag > MAX_UNRESERVED_TAG {
            return Err(CodecError::Data("tag is reserved"));
        }
        if self.children.contains_key(&tag) {
            return Err(CodecError::Data("duplicate sample tag"));
        }
        self.children.insert(tag, child);
        if priority && !self.priority {
            self.priority = true;
            return Ok(AddChild::Promoted);
        }
        Ok(AddChild::Added)
    }

    pub fn remove_child(&mut self, tag: u8) -> Option<ChildSensor> {
        self.children.remove(&tag)
    }

    /// Samples seen for tags no child claimed.
    pub fn unmapped_samples(&self) -> u64 {
        self.unmapped_samples
    }
}

impl Sensor for NumericAggregator {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (MessageType::PlatformEnvironmental as u8, self.kind.command())
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        for child in self.children.values() {
            surface.set_available(&child.path, true);
        }
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        for child in self.children.values() {
            surface.set_functional(&child.path, false);
        }
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        match self.kind.encode_request(instance_id) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encoding aggregate request failed for eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        let resp = AggregateResponse::parse(msg)?;
        if !resp.cc.is_success() {
            // A failed aggregate command arrives in the common non-success
            // layout; the count field holds the reason code.
            let err =
                SensorError::Command { cc: resp.cc, reason: ReasonCode(resp.sample_count) };
            log_failure(&mut self.errors, &self.name, "aggregate response", &err);
            return Err(err);
        }

        let mut worst: Result<(), SensorError> = Ok(());
        let mut samples = resp.samples();
        for sample in &mut samples {
            let sample = match sample {
                Ok(sample) => sample,
                Err(err) => {
                    let err = SensorError::from(err);
                    log_failure(&mut self.errors, &self.name, "aggregate sample", &err);
                    return Err(err);
                }
            };

            if sample.tag == TIMESTAMP_TAG {
                match aggregate::decode_timestamp_sample(sample.data) {
                    Ok(timestamp) => self.timestamp = Some(timestamp),
                    Err(err) => {
                        let err = SensorError::from(err);
                        log_failure(&mut self.errors, &self.name, "timestamp sample", &err);
                        worst = Err(err);
                    }
                }
                continue;
            }
            if sample.tag > MAX_UNRESERVED_TAG {
                continue;
            }

            let Some(child) = self.children.get(&sample.tag) else {
                self.unmapped_samples += 1;
                debug!(
                    "aggregator {}: no sensor for tag {}, dropping sample",
                    self.name, sample.tag
                );
                continue;
            };

            if !sample.valid {
                surface.set_functional(&child.path, false);
                continue;
            }

            match self.kind.decode_sample(sample.data) {
                Ok(value) => {
                    surface.set_reading(&child.path, value, self.kind.unit(), self.timestamp);
                    surface.set_functional(&child.path, true);
                }
                Err(err) => {
                    surface.set_functional(&child.path, false);
                    let err = SensorError::from(err);
                    log_failure(&mut self.errors, &self.name, "sample decode", &err);
                    worst = Err(err);
                }
            }
        }

        let trailing = samples.trailing();
        if trailing > 0 {
            debug!("aggregator {}: {trailing} trailing bytes after samples", self.name);
        }

        if worst.is_ok() {
            self.errors.clear();
        }
        worst
    }
}

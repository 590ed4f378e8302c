//! Processor-scoped property sensors: MIG and ECC modes, ECC error counts,
//! EDPp scaling, clock limits and frequencies, row remapping, reset control.

use log::error;

use nsm_codec::environmental::{self, ClockType, EccMode, MigMode};
use nsm_codec::{MessageType, Response};

use crate::publish::{PublishingSurface, Unit, Value};
use crate::sensor::{log_failure, ErrorBitmap, Sensor, SensorError};

use super::device_path;

/// Publish a property set, or mark the device path non-functional.
fn publish_properties(
    errors: &mut ErrorBitmap,
    name: &str,
    what: &str,
    path: &str,
    iface: &'static str,
    result: Result<Response<Vec<(&'static str, Value)>>, nsm_codec::CodecError>,
    surface: &mut dyn PublishingSurface,
) -> Result<(), SensorError> {
    match result {
        Ok(Response::Success(props)) => {
            for (prop, value) in props {
                surface.set_property(path, iface, prop, value);
            }
            surface.set_functional(path, true);
            errors.clear();
            Ok(())
        }
        Ok(Response::Failed { cc, reason }) => {
            surface.set_functional(path, false);
            let err = SensorError::Command { cc, reason };
            log_failure(errors, name, what, &err);
            Err(err)
        }
        Err(err) => {
            surface.set_functional(path, false);
            let err = SensorError::from(err);
            log_failure(errors, name, what, &err);
            Err(err)
        }
    }
}

macro_rules! property_sensor {
    ($sensor:ident, $suffix:literal) => {
        pub struct $sensor {
            name: String,
            path: String,
            errors: ErrorBitmap,
        }

        impl $sensor {
            pub fn new(device: &str) -> Self {
                Self {
                    name: format!(concat!("{}_", $suffix), device),
                    path: device_path(device),
                    errors: ErrorBitmap::default(),
                }
            }
        }
    };
}

// MIG mode

property_sensor!(MigSensor, "MigMode");

impl Sensor for MigSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (MessageType::PlatformEnvironmental as u8, environmental::GET_MIG_MODE)
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        surface.set_functional(&self.path, false);
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        match environmental::encode_get_mig_mode_req(instance_id) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_get_mig_mode_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        let result = environmental::decode_get_mig_mode_resp(msg).map(|resp| {
            resp.map(|mode| {
                vec![("MigModeEnabled", Value::from(mode.contains(MigMode::ENABLED)))]
            })
        });
        publish_properties(
            &mut self.errors,
            &self.name,
            "decode_get_mig_mode_resp",
            &self.path,
            "mig_mode",
            result,
            surface,
        )
    }
}

// ECC mode

property_sensor!(EccModeSensor, "EccMode");

impl Sensor for EccModeSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (MessageType::PlatformEnvironmental as u8, environmental::GET_ECC_MODE)
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        surface.set_functional(&self.path, false);
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        match environmental::encode_get_ecc_mode_req(instance_id) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_get_ecc_mode_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        let result = environmental::decode_get_ecc_mode_resp(msg).map(|resp| {
            resp.map(|mode| {
                vec![
                    ("EccModeEnabled", Value::from(mode.contains(EccMode::ENABLED))),
                    ("PendingEccState", Value::from(mode.contains(EccMode::PENDING))),
                ]
            })
        });
        publish_properties(
            &mut self.errors,
            &self.name,
            "decode_get_ecc_mode_resp",
            &self.path,
            "ecc_mode",
            result,
            surface,
        )
    }
}

// ECC error counts

property_sensor!(EccErrorCountsSensor, "EccErrorCounts");

impl Sensor for EccErrorCountsSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (
            MessageType::PlatformEnvironmental as u8,
            environmental::GET_ECC_ERROR_COUNTS,
        )
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        surface.set_functional(&self.path, false);
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        match environmental::encode_get_ecc_error_counts_req(instance_id) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_get_ecc_error_counts_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        let result = environmental::decode_get_ecc_error_counts_resp(msg).map(|resp| {
            resp.map(|counts| {
                let corrected =
                    u64::from(counts.sram_corrected) + u64::from(counts.dram_corrected);
                let uncorrected = u64::from(counts.sram_uncorrected_secded)
                    + u64::from(counts.sram_uncorrected_parity)
                    + u64::from(counts.dram_uncorrected);
                vec![
                    ("CorrectableErrorCount", Value::U64(corrected)),
                    ("UncorrectableErrorCount", Value::U64(uncorrected)),
                ]
            })
        });
        publish_properties(
            &mut self.errors,
            &self.name,
            "decode_get_ecc_error_counts_resp",
            &self.path,
            "ecc_counts",
            result,
            surface,
        )
    }
}

// EDPp scaling factor

property_sensor!(EdppSensor, "EdppScalingFactor");

impl Sensor for EdppSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (
            MessageType::PlatformEnvironmental as u8,
            environmental::GET_PROGRAMMABLE_EDPP_SCALING_FACTOR,
        )
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        surface.set_functional(&self.path, false);
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        match environmental::encode_get_programmable_edpp_scaling_factor_req(instance_id) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_get_programmable_edpp_scaling_factor_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        let result =
            environmental::decode_get_programmable_edpp_scaling_factor_resp(msg).map(|resp| {
                resp.map(|factors| {
                    vec![
                        ("AllowedMax", Value::from(u32::from(factors.maximum))),
                        ("AllowedMin", Value::from(u32::from(factors.minimum))),
                        ("Default", Value::from(u32::from(factors.default))),
                    ]
                })
            });
        publish_properties(
            &mut self.errors,
            &self.name,
            "decode_get_programmable_edpp_scaling_factor_resp",
            &self.path,
            "edpp_scaling",
            result,
            surface,
        )
    }
}

// Clock limit

pub struct ClockLimitSensor {
    name: String,
    path: String,
    clock: ClockType,
    errors: ErrorBitmap,
}

impl ClockLimitSensor {
    pub fn new(device: &str, clock: ClockType) -> Self {
        Self {
            name: format!("{device}_ClockLimit"),
            path: device_path(device),
            clock,
            errors: ErrorBitmap::default(),
        }
    }
}

impl Sensor for ClockLimitSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (MessageType::PlatformEnvironmental as u8, environmental::GET_CLOCK_LIMIT)
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        surface.set_functional(&self.path, false);
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        match environmental::encode_get_clock_limit_req(instance_id, self.clock) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_get_clock_limit_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        let result = environmental::decode_get_clock_limit_resp(msg).map(|resp| {
            resp.map(|limit| {
                vec![
                    ("RequestedSpeedLimitMin", Value::from(limit.requested_min)),
                    ("RequestedSpeedLimitMax", Value::from(limit.requested_max)),
                    ("SpeedLimitMin", Value::from(limit.present_min)),
                    ("SpeedLimitMax", Value::from(limit.present_max)),
                ]
            })
        });
        publish_properties(
            &mut self.errors,
            &self.name,
            "decode_get_clock_limit_resp",
            &self.path,
            "clock_limit",
            result,
            surface,
        )
    }
}

// Current clock frequency

pub struct CurrentClockFreqSensor {
    name: String,
    path: String,
    clock: ClockType,
    errors: ErrorBitmap,
}

impl CurrentClockFreqSensor {
    pub fn new(device: &str, clock: ClockType) -> Self {
        let suffix = match clock {
            ClockType::Graphics => "GraphicsClock",
            ClockType::Memory => "MemoryClock",
        };
        Self {
            name: format!("{device}_{suffix}"),
            path: super::reading_path("frequency", &format!("{device}_{suffix}")),
            clock,
            errors: ErrorBitmap::default(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Sensor for CurrentClockFreqSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (
            MessageType::PlatformEnvironmental as u8,
            environmental::GET_CURRENT_CLOCK_FREQUENCY,
        )
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        surface.set_functional(&self.path, false);
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        match environmental::encode_get_curr_clock_freq_req(instance_id, self.clock) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_get_curr_clock_freq_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        match environmental::decode_get_curr_clock_freq_resp(msg) {
            Ok(Response::Success(mhz)) => {
                surface.set_reading(&self.path, f64::from(mhz), Unit::Megahertz, None);
                surface.set_functional(&self.path, true);
                self.errors.clear();
                Ok(())
            }
            Ok(Response::Failed { cc, reason }) => {
                surface.set_functional(&self.path, false);
                let err = SensorError::Command { cc, reason };
                log_failure(
                    &mut self.errors,
                    &self.name,
                    "decode_get_curr_clock_freq_resp",
                    &err,
                );
                Err(err)
            }
            Err(err) => {
                surface.set_functional(&self.path, false);
                let err = SensorError::from(err);
                log_failure(
                    &mut self.errors,
                    &self.name,
                    "decode_get_curr_clock_freq_resp",
                    &err,
                );
                Err(err)
            }
        }
    }
}

// Row remapping

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRemapKind {
    State,
    Counts,
}

pub struct RowRemapSensor {
    name: String,
    path: String,
    kind: RowRemapKind,
    errors: ErrorBitmap,
}

impl RowRemapSensor {
    pub fn new(device: &str, kind: RowRemapKind) -> Self {
        Self {
            name: format!("{device}_RowRemapping"),
            path: device_path(device),
            kind,
            errors: ErrorBitmap::default(),
        }
    }
}

impl Sensor for RowRemapSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        let command = match self.kind {
            RowRemapKind::State => environmental::GET_ROW_REMAP_STATE_FLAGS,
            RowRemapKind::Counts => environmental::GET_ROW_REMAPPING_COUNTS,
        };
        (MessageType::PlatformEnvironmental as u8, command)
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        surface.set_functional(&self.path, false);
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        let result = match self.kind {
            RowRemapKind::State => environmental::encode_get_row_remap_state_req(instance_id),
            RowRemapKind::Counts => {
                environmental::encode_get_row_remapping_counts_req(instance_id)
            }
        };
        match result {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encoding row remap request failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        let result = match self.kind {
            RowRemapKind::State => environmental::decode_get_row_remap_state_resp(msg)
                .map(|resp| {
                    resp.map(|state| {
                        vec![
                            (
                                "RowRemappingFailureState",
                                Value::from(
                                    state
                                        .contains(environmental::RowRemapState::FAILURE_OCCURRED),
                                ),
                            ),
                            (
                                "RowRemappingPendingState",
                                Value::from(
                                    state.contains(environmental::RowRemapState::PENDING),
                                ),
                            ),
                        ]
                    })
                }),
            RowRemapKind::Counts => environmental::decode_get_row_remapping_counts_resp(msg)
                .map(|resp| {
                    resp.map(|counts| {
                        vec![
                            ("CorrectableRowRemapCount", Value::from(counts.correctable)),
                            ("UncorrectableRowRemapCount", Value::from(counts.uncorrectable)),
                        ]
                    })
                }),
        };
        publish_properties(
            &mut self.errors,
            &self.name,
            "row remap decode",
            &self.path,
            "row_remapping",
            result,
            surface,
        )
    }
}

// Reset control: no polling, publishes its identity and reacts to operator
// requests routed from the publishing side.

pub struct ResetControl {
    name: String,
    path: String,
    device_index: u8,
}

impl ResetControl {
    pub fn new(device: &str, device_index: u8) -> Self {
        Self {
            name: format!("{device}_Reset"),
            path: device_path(device),
            device_index,
        }
    }
}

impl ResetControl {
    /// Request used when an operator triggers the reset through the
    /// publishing side.
    pub fn gen_reset_request(&self, instance_id: u8) -> Option<Vec<u8>> {
        match nsm_codec::pci::encode_assert_pcie_fundamental_reset_req(
            instance_id,
            self.device_index,
            1,
        ) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_assert_pcie_fundamental_reset_req failed: {err}");
                None
            }
        }
    }
}

impl Sensor for ResetControl {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (
            MessageType::PciLink as u8,
            nsm_codec::pci::ASSERT_PCIE_FUNDAMENTAL_RESET,
        )
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
        surface.set_property(
            &self.path,
            "reset_control",
            "DeviceIndex",
            Value::from(u32::from(self.device_index)),
        );
    }

    fn gen_request(&self, _eid: u8, _instance_id: u8) -> Option<Vec<u8>> {
        None
    }

    fn handle_response(
        &mut self,
        _msg: &[u8],
        _surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::RecordingSurface;
    use nsm_codec::environmental::EccErrorCounts;
    use nsm_codec::{CompletionCode, ReasonCode};

    #[test]
    fn ecc_counts_are_summed_by_severity() {
        let mut sensor = EccErrorCountsSensor::new("GPU_0");
        let mut surface = RecordingSurface::default();
        let msg = environmental::encode_get_ecc_error_counts_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            &EccErrorCounts {
                flags: 0,
                sram_corrected: 10,
                sram_uncorrected_secded: 1,
                sram_uncorrected_parity: 2,
                dram_corrected: 5,
                dram_uncorrected: 3,
            },
        )
        .unwrap();

        sensor.handle_response(&msg, &mut surface).unwrap();
        assert_eq!(
            surface.last_property("inventory/GPU_0", "CorrectableErrorCount"),
            Some(&Value::U64(15))
        );
        assert_eq!(
            surface.last_property("inventory/GPU_0", "UncorrectableErrorCount"),
            Some(&Value::U64(6))
        );
    }

    #[test]
    fn mig_mode_publishes_enabled_bit() {
        let mut sensor = MigSensor::new("GPU_0");
        let mut surface = RecordingSurface::default();
        let msg = environmental::encode_get_mig_mode_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            MigMode::ENABLED,
        )
        .unwrap();

        sensor.handle_response(&msg, &mut surface).unwrap();
        assert_eq!(
            surface.last_property("inventory/GPU_0", "MigModeEnabled"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn clock_freq_publishes_mhz_reading() {
        let mut sensor = CurrentClockFreqSensor::new("GPU_0", ClockType::Graphics);
        let mut surface = RecordingSurface::default();
        let msg = environmental::encode_get_curr_clock_freq_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            1980,
        )
        .unwrap();

        sensor.handle_response(&msg, &mut surface).unwrap();
        assert_eq!(
            surface.last_reading("sensors/frequency/GPU_0_GraphicsClock"),
            Some(1980.0)
        );
    }

    #[test]
    fn reset_control_never_polls() {
        let sensor = ResetControl::new("GPU_0", 2);
        assert!(sensor.gen_request(8, 0).is_none());
    }

    #[test]
    fn reset_request_names_the_device_index() {
        let sensor = ResetControl::new("GPU_0", 2);
        let request = sensor.gen_reset_request(0).unwrap();
        assert_eq!(
            nsm_codec::pci::decode_query_scalar_group_telemetry_v1_req(&request).err(),
            Some(nsm_codec::CodecError::Data("unexpected command"))
        );
        // device index and assert action follow the request convention
        assert_eq!(&request[nsm_codec::HDR_LEN + 2..], &[2, 1]);
    }
}

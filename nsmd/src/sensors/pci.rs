//! PCIe scalar telemetry groups (link errors, recovery counts).

use log::error;

use nsm_codec::{pci, MessageType, Response};

use crate::publish::{PublishingSurface, Value};
use crate::sensor::{log_failure, ErrorBitmap, Sensor, SensorError};

use super::device_path;

/// Names for the scalars of the groups the daemon publishes. Groups the
/// table does not cover publish as indexed counters.
fn scalar_name(group_index: u8, position: usize) -> String {
    let known: &[&str] = match group_index {
        2 => &["NonFatalErrorCount", "FatalErrorCount", "UnsupportedRequestCount"],
        3 => &["L0ToRecoveryCount"],
        4 => &["ReplayCount", "ReplayRolloverCount", "NakSentCount", "NakReceivedCount"],
        5 => &["CorrectableErrorCount"],
        _ => &[],
    };
    known
        .get(position)
        .map(|name| (*name).to_string())
        .unwrap_or_else(|| format!("Group{group_index}Scalar{position}"))
}

pub struct PciGroupSensor {
    name: String,
    path: String,
    group_index: u8,
    device_id: u8,
    errors: ErrorBitmap,
}

impl PciGroupSensor {
    pub fn new(device: &str, group_index: u8, device_id: u8) -> Self {
        Self {
            name: format!("{device}_PCIeGroup{group_index}"),
            path: device_path(device),
            group_index,
            device_id,
            errors: ErrorBitmap::default(),
        }
    }
}

impl Sensor for PciGroupSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (MessageType::PciLink as u8, pci::QUERY_SCALAR_GROUP_TELEMETRY_V1)
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        surface.set_functional(&self.path, false);
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        match pci::encode_query_scalar_group_telemetry_v1_req(
            instance_id,
            self.device_id,
            self.group_index,
        ) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_query_scalar_group_telemetry_v1_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        match pci::decode_query_scalar_group_telemetry_v1_resp(msg) {
            Ok(Response::Success(scalars)) => {
                for (position, scalar) in scalars.iter().enumerate() {
                    surface.set_property(
                        &self.path,
                        "pcie_errors",
                        &scalar_name(self.group_index, position),
                        Value::from(*scalar),
                    );
                }
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
                    "decode_query_scalar_group_telemetry_v1_resp",
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
                    "decode_query_scalar_group_telemetry_v1_resp",
                    &err,
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::RecordingSurface;
    use nsm_codec::{CompletionCode, ReasonCode};

    #[test]
    fn group_scalars_publish_under_known_names() {
        let mut sensor = PciGroupSensor::new("GPU_0", 2, 0);
        let mut surface = RecordingSurface::default();
        let msg = pci::encode_query_scalar_group_telemetry_v1_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            &[4, 0, 1],
        )
        .unwrap();

        sensor.handle_response(&msg, &mut surface).unwrap();
        assert_eq!(
            surface.last_property("inventory/GPU_0", "NonFatalErrorCount"),
            Some(&Value::U64(4))
        );
        assert_eq!(
            surface.last_property("inventory/GPU_0", "UnsupportedRequestCount"),
            Some(&Value::U64(1))
        );
    }

    #[test]
    fn unknown_group_scalars_publish_indexed() {
        let mut sensor = PciGroupSensor::new("GPU_0", 9, 0);
        let mut surface = RecordingSurface::default();
        let msg = pci::encode_query_scalar_group_telemetry_v1_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            &[11],
        )
        .unwrap();

        sensor.handle_response(&msg, &mut surface).unwrap();
        assert_eq!(
            surface.last_property("inventory/GPU_0", "Group9Scalar0"),
            Some(&Value::U64(11))
        );
    }
}

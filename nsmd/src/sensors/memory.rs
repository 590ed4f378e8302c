//! Memory capacity and utilisation.

use log::error;

use nsm_codec::{environmental, MessageType, Response};

use crate::publish::{PublishingSurface, Value};
use crate::sensor::{log_failure, ErrorBitmap, Sensor, SensorError};

use super::device_path;

const IFACE: &str = "memory_metrics";

pub struct MemoryCapacityUtilSensor {
    name: String,
    path: String,
    errors: ErrorBitmap,
}

impl MemoryCapacityUtilSensor {
    pub fn new(device: &str) -> Self {
        Self {
            name: format!("{device}_MemoryCapacityUtil"),
            path: device_path(device),
            errors: ErrorBitmap::default(),
        }
    }
}

impl Sensor for MemoryCapacityUtilSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (
            MessageType::PlatformEnvironmental as u8,
            environmental::GET_MEMORY_CAPACITY_UTILIZATION,
        )
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        surface.set_functional(&self.path, false);
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        match environmental::encode_get_memory_capacity_util_req(instance_id) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_get_memory_capacity_util_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        match environmental::decode_get_memory_capacity_util_resp(msg) {
            Ok(Response::Success(util)) => {
                surface.set_property(
                    &self.path,
                    IFACE,
                    "ReservedMemoryMiB",
                    Value::from(util.reserved_memory),
                );
                surface.set_property(
                    &self.path,
                    IFACE,
                    "UsedMemoryMiB",
                    Value::from(util.used_memory),
                );
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
                    "decode_get_memory_capacity_util_resp",
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
                    "decode_get_memory_capacity_util_resp",
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
    use nsm_codec::environmental::MemoryCapacityUtilization;
    use nsm_codec::{CompletionCode, ReasonCode};

    #[test]
    fn both_fields_publish_as_properties() {
        let mut sensor = MemoryCapacityUtilSensor::new("GPU_0");
        let mut surface = RecordingSurface::default();
        let msg = environmental::encode_get_memory_capacity_util_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            MemoryCapacityUtilization { reserved_memory: 512, used_memory: 40_960 },
        )
        .unwrap();

        sensor.handle_response(&msg, &mut surface).unwrap();
        assert_eq!(
            surface.last_property("inventory/GPU_0", "ReservedMemoryMiB"),
            Some(&Value::U64(512))
        );
        assert_eq!(
            surface.last_property("inventory/GPU_0", "UsedMemoryMiB"),
            Some(&Value::U64(40_960))
        );
    }
}

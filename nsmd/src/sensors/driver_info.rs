//! Driver state and version inventory.

use log::error;

use nsm_codec::environmental::{self, DriverState};
use nsm_codec::{MessageType, Response};

use crate::publish::{PublishingSurface, Value};
use crate::sensor::{log_failure, ErrorBitmap, Sensor, SensorError};

use super::device_path;

const IFACE: &str = "software_version";

pub struct DriverInfoSensor {
    name: String,
    path: String,
    errors: ErrorBitmap,
}

impl DriverInfoSensor {
    pub fn new(device: &str) -> Self {
        Self {
            name: format!("{device}_DriverInfo"),
            path: device_path(device),
            errors: ErrorBitmap::default(),
        }
    }
}

impl Sensor for DriverInfoSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (MessageType::PlatformEnvironmental as u8, environmental::GET_DRIVER_INFO)
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        surface.set_functional(&self.path, false);
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        match environmental::encode_get_driver_info_req(instance_id) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_get_driver_info_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        match environmental::decode_get_driver_info_resp(msg) {
            Ok(Response::Success(info)) => {
                surface.set_property(
                    &self.path,
                    IFACE,
                    "DriverLoaded",
                    Value::from(info.state == DriverState::Loaded),
                );
                surface.set_property(
                    &self.path,
                    IFACE,
                    "DriverVersion",
                    Value::Text(info.version),
                );
                surface.set_functional(&self.path, true);
                self.errors.clear();
                Ok(())
            }
            Ok(Response::Failed { cc, reason }) => {
                surface.set_functional(&self.path, false);
                let err = SensorError::Command { cc, reason };
                log_failure(&mut self.errors, &self.name, "decode_get_driver_info_resp", &err);
                Err(err)
            }
            Err(err) => {
                surface.set_functional(&self.path, false);
                let err = SensorError::from(err);
                log_failure(&mut self.errors, &self.name, "decode_get_driver_info_resp", &err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::RecordingSurface;
    use nsm_codec::environmental::DriverInfo;
    use nsm_codec::{CompletionCode, ReasonCode};

    #[test]
    fn state_and_version_publish_as_properties() {
        let mut sensor = DriverInfoSensor::new("GPU_0");
        let mut surface = RecordingSurface::default();
        let msg = environmental::encode_get_driver_info_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            &DriverInfo { state: DriverState::Loaded, version: "550.54.15".into() },
        )
        .unwrap();

        sensor.handle_response(&msg, &mut surface).unwrap();
        assert_eq!(
            surface.last_property("inventory/GPU_0", "DriverLoaded"),
            Some(&Value::Bool(true))
        );
        assert_eq!(
            surface.last_property("inventory/GPU_0", "DriverVersion"),
            Some(&Value::Text("550.54.15".into()))
        );
    }
}

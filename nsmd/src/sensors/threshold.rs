//! Thermal parameter (threshold) sensors.

use log::error;

use nsm_codec::{environmental, MessageType};

use crate::publish::{PublishingSurface, Unit};
use crate::sensor::{publish_numeric, ErrorBitmap, Sensor, SensorError};

use super::reading_path;

pub struct ThresholdSensor {
    name: String,
    parameter_id: u8,
    path: String,
    errors: ErrorBitmap,
}

impl ThresholdSensor {
    pub fn new(name: impl Into<String>, parameter_id: u8) -> Self {
        let name = name.into();
        let path = reading_path("temperature", &name);
        Self { name, parameter_id, path, errors: ErrorBitmap::default() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Sensor for ThresholdSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (
            MessageType::PlatformEnvironmental as u8,
            environmental::READ_THERMAL_PARAMETER,
        )
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        surface.set_functional(&self.path, false);
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        match environmental::encode_read_thermal_parameter_req(instance_id, self.parameter_id) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_read_thermal_parameter_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        let result = environmental::decode_read_thermal_parameter_resp(msg)
            .map(|resp| resp.map(f64::from));
        publish_numeric(
            &mut self.errors,
            &self.name,
            "decode_read_thermal_parameter_resp",
            &self.path,
            Unit::DegreesC,
            result,
            surface,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::RecordingSurface;
    use nsm_codec::{CompletionCode, ReasonCode};

    #[test]
    fn threshold_reading_is_published() {
        let mut sensor = ThresholdSensor::new("GPU_0_SHUTDOWN_TEMP", 1);
        let mut surface = RecordingSurface::default();
        let msg = environmental::encode_read_thermal_parameter_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            95,
        )
        .unwrap();

        sensor.handle_response(&msg, &mut surface).unwrap();
        assert_eq!(
            surface.last_reading("sensors/temperature/GPU_0_SHUTDOWN_TEMP"),
            Some(95.0)
        );
    }
}

//! GPU and board temperature sensors.

use log::error;

use nsm_codec::{environmental, MessageType, Response};

use crate::publish::{PublishingSurface, Unit};
use crate::sensor::{log_failure, Association, ErrorBitmap, Sensor, SensorError};

use super::reading_path;

pub struct TempSensor {
    name: String,
    sensor_id: u8,
    path: String,
    associations: Vec<Association>,
    errors: ErrorBitmap,
}

impl TempSensor {
    pub fn new(name: impl Into<String>, sensor_id: u8, associations: Vec<Association>) -> Self {
        let name = name.into();
        let path = reading_path("temperature", &name);
        Self { name, sensor_id, path, associations, errors: ErrorBitmap::default() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Sensor for TempSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (
            MessageType::PlatformEnvironmental as u8,
            environmental::GET_TEMPERATURE_READING,
        )
    }

    fn publish_static(&self, surface: &mut dyn PublishingSurface) {
        surface.set_available(&self.path, true);
        for assoc in &self.associations {
            surface.add_association(
                &self.path,
                &assoc.forward,
                &assoc.backward,
                &assoc.absolute_path,
            );
        }
    }

    fn on_transport_failure(&mut self, surface: &mut dyn PublishingSurface) {
        surface.set_functional(&self.path, false);
    }

    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>> {
        match environmental::encode_get_temperature_reading_req(instance_id, self.sensor_id) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_get_temperature_reading_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        let result = environmental::decode_get_temperature_reading_resp(msg);
        match result {
            Ok(Response::Success(reading)) => {
                surface.set_reading(&self.path, reading, Unit::DegreesC, None);
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
                    "decode_get_temperature_reading_resp",
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
                    "decode_get_temperature_reading_resp",
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
    fn request_carries_sensor_id() {
        let sensor = TempSensor::new("GPU_0_TEMP", 3, Vec::new());
        let request = sensor.gen_request(8, 0).unwrap();
        assert_eq!(
            environmental::decode_get_temperature_reading_req(&request).unwrap(),
            3
        );
    }

    #[test]
    fn reading_is_published_in_degrees() {
        let mut sensor = TempSensor::new("GPU_0_TEMP", 0, Vec::new());
        let mut surface = RecordingSurface::default();
        let msg = environmental::encode_get_temperature_reading_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            43.5,
        )
        .unwrap();

        sensor.handle_response(&msg, &mut surface).unwrap();
        assert_eq!(surface.last_reading("sensors/temperature/GPU_0_TEMP"), Some(43.5));
        assert_eq!(
            surface.last_functional("sensors/temperature/GPU_0_TEMP"),
            Some(true)
        );
    }

    // A failing sensor is marked non-functional and the stale reading is
    // left alone.
    #[test]
    fn failure_marks_non_functional_and_keeps_stale_reading() {
        let mut sensor = TempSensor::new("GPU_0_TEMP", 0, Vec::new());
        let mut surface = RecordingSurface::default();

        let ok = environmental::encode_get_temperature_reading_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            40.0,
        )
        .unwrap();
        sensor.handle_response(&ok, &mut surface).unwrap();

        let failed = environmental::encode_get_temperature_reading_resp(
            0,
            CompletionCode::Error,
            ReasonCode::TIMEOUT,
            0.0,
        )
        .unwrap();
        let err = sensor.handle_response(&failed, &mut surface).unwrap_err();
        assert_eq!(
            err.completion_code(),
            Some(CompletionCode::Error)
        );
        assert_eq!(surface.last_reading("sensors/temperature/GPU_0_TEMP"), Some(40.0));
        assert_eq!(
            surface.last_functional("sensors/temperature/GPU_0_TEMP"),
            Some(false)
        );
    }

    #[test]
    fn associations_publish_statically() {
        let sensor = TempSensor::new(
            "GPU_0_TEMP",
            0,
            vec![Association {
                forward: "chassis".into(),
                backward: "all_sensors".into(),
                absolute_path: "inventory/GPU_0".into(),
            }],
        );
        let mut surface = RecordingSurface::default();
        sensor.publish_static(&mut surface);
        assert_eq!(surface.available.len(), 1);
        assert_eq!(surface.associations.len(), 1);
    }
}

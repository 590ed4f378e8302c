//! Voltage rail sensors.

use log::error;

use nsm_codec::{environmental, MessageType};

use crate::publish::{PublishingSurface, Unit};
use crate::sensor::{publish_numeric, Association, ErrorBitmap, Sensor, SensorError};

use super::reading_path;

pub struct VoltageSensor {
    name: String,
    sensor_id: u8,
    path: String,
    associations: Vec<Association>,
    errors: ErrorBitmap,
}

impl VoltageSensor {
    pub fn new(name: impl Into<String>, sensor_id: u8, associations: Vec<Association>) -> Self {
        let name = name.into();
        let path = reading_path("voltage", &name);
        Self { name, sensor_id, path, associations, errors: ErrorBitmap::default() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Sensor for VoltageSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (MessageType::PlatformEnvironmental as u8, environmental::GET_VOLTAGE)
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
        match environmental::encode_get_voltage_req(instance_id, self.sensor_id) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_get_voltage_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        // Microvolts on the wire, volts on the surface.
        let result = environmental::decode_get_voltage_resp(msg)
            .map(|resp| resp.map(|microvolts| f64::from(microvolts) / 1_000_000.0));
        publish_numeric(
            &mut self.errors,
            &self.name,
            "decode_get_voltage_resp",
            &self.path,
            Unit::Volts,
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
    fn microvolts_are_published_as_volts() {
        let mut sensor = VoltageSensor::new("GPU_0_VDD", 2, Vec::new());
        let mut surface = RecordingSurface::default();
        let msg = environmental::encode_get_voltage_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            875_000,
        )
        .unwrap();

        sensor.handle_response(&msg, &mut surface).unwrap();
        assert_eq!(surface.last_reading("sensors/voltage/GPU_0_VDD"), Some(0.875));
    }
}

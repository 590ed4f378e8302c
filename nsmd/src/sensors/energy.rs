//! Accumulated energy sensors.

use log::error;

use nsm_codec::{environmental, MessageType};

use crate::publish::{PublishingSurface, Unit};
use crate::sensor::{publish_numeric, Association, ErrorBitmap, Sensor, SensorError};

use super::reading_path;

pub struct EnergySensor {
    name: String,
    sensor_id: u8,
    path: String,
    associations: Vec<Association>,
    errors: ErrorBitmap,
}

impl EnergySensor {
    pub fn new(name: impl Into<String>, sensor_id: u8, associations: Vec<Association>) -> Self {
        let name = name.into();
        let path = reading_path("energy", &name);
        Self { name, sensor_id, path, associations, errors: ErrorBitmap::default() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Sensor for EnergySensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> (u8, u8) {
        (
            MessageType::PlatformEnvironmental as u8,
            environmental::GET_CURRENT_ENERGY_COUNT,
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
        match environmental::encode_get_current_energy_count_req(instance_id, self.sensor_id) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("encode_get_current_energy_count_req failed, eid {eid}: {err}");
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError> {
        // Millijoules on the wire, joules on the surface.
        let result = environmental::decode_get_current_energy_count_resp(msg)
            .map(|resp| resp.map(|millijoules| millijoules as f64 / 1000.0));
        publish_numeric(
            &mut self.errors,
            &self.name,
            "decode_get_current_energy_count_resp",
            &self.path,
            Unit::Joules,
            result,
            surface,
        )
    }
}

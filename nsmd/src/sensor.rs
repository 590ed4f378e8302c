//! The sensor capability contract and shared failure bookkeeping.

use log::error;
use thiserror::Error;

use nsm_codec::{CodecError, CompletionCode, ReasonCode};

use crate::publish::PublishingSurface;

/// A cross-object association published next to a sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub forward: String,
    pub backward: String,
    pub absolute_path: String,
}

/// Why one polling exchange with a device did not produce a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("decode failed: {0}")]
    Codec(#[from] CodecError),

    #[error("device returned {cc}, reason {reason}")]
    Command { cc: CompletionCode, reason: ReasonCode },
}

impl SensorError {
    pub fn completion_code(&self) -> Option<CompletionCode> {
        match self {
            Self::Codec(_) => None,
            Self::Command { cc, .. } => Some(*cc),
        }
    }

    /// Bucket for the once-per-failure-kind log suppression.
    fn digest(&self) -> u8 {
        match self {
            Self::Codec(CodecError::Length { .. }) => 0,
            Self::Codec(CodecError::Data(_)) => 1,
            Self::Command { cc, reason } => {
                cc.raw().wrapping_mul(31).wrapping_add(reason.0 as u8).wrapping_add(2)
            }
        }
    }
}

/// 256-bit map of failure digests already logged.
///
/// A sensor polled every tick can emit the same error indefinitely; each
/// distinct `(kind, cc, reason)` digest is logged once, then muted until the
/// next success clears the map.
#[derive(Debug, Default, Clone)]
pub struct ErrorBitmap {
    bits: [u64; 4],
}

impl ErrorBitmap {
    /// Marks the error seen. Returns true the first time, false while muted.
    pub fn should_log(&mut self, err: &SensorError) -> bool {
        let digest = err.digest();
        let word = usize::from(digest) / 64;
        let mask = 1u64 << (digest % 64);
        let fresh = self.bits[word] & mask == 0;
        self.bits[word] |= mask;
        fresh
    }

    pub fn clear(&mut self) {
        self.bits = [0; 4];
    }
}

/// Log a handling failure, rate-limited through the sensor's bitmap.
pub fn log_failure(errors: &mut ErrorBitmap, sensor: &str, what: &str, err: &SensorError) {
    if errors.should_log(err) {
        error!("{what} failed for sensor {sensor}: {err}");
    }
}

/// Publish the decoded reading, or mark the path non-functional and report
/// why. Shared by every leaf numeric sensor.
pub(crate) fn publish_numeric(
    errors: &mut ErrorBitmap,
    name: &str,
    what: &str,
    path: &str,
    unit: crate::publish::Unit,
    result: Result<nsm_codec::Response<f64>, CodecError>,
    surface: &mut dyn PublishingSurface,
) -> Result<(), SensorError> {
    match result {
        Ok(nsm_codec::Response::Success(value)) => {
            surface.set_reading(path, value, unit, None);
            surface.set_functional(path, true);
            errors.clear();
            Ok(())
        }
        Ok(nsm_codec::Response::Failed { cc, reason }) => {
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

/// One pollable entity on a device.
///
/// Leaf sensors fetch one reading; aggregators fetch a whole sample stream
/// and fan it out to children; async-update sensors return no request and
/// react to events only.
pub trait Sensor: Send {
    fn name(&self) -> &str;

    /// `(nvidia_msg_type, command)` this sensor emits; the scheduler checks
    /// it against the device's capability tables.
    fn command(&self) -> (u8, u8);

    /// Publish the static side of the sensor (availability, associations)
    /// once, before polling starts.
    fn publish_static(&self, _surface: &mut dyn PublishingSurface) {}

    /// The request timed out or could not be sent; the reading is stale and
    /// the sensor must show as non-functional until the next success.
    fn on_transport_failure(&mut self, _surface: &mut dyn PublishingSurface) {}

    /// Encode the request to send to `eid`. `None` means nothing to send
    /// this tick (async-update sensors, or an encode failure already
    /// logged).
    fn gen_request(&self, eid: u8, instance_id: u8) -> Option<Vec<u8>>;

    /// Absorb the matching response and publish through `surface`.
    fn handle_response(
        &mut self,
        msg: &[u8],
        surface: &mut dyn PublishingSurface,
    ) -> Result<(), SensorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_errors_log_once_until_cleared() {
        let mut bitmap = ErrorBitmap::default();
        let err = SensorError::Command {
            cc: CompletionCode::Busy,
            reason: ReasonCode::TIMEOUT,
        };
        assert!(bitmap.should_log(&err));
        assert!(!bitmap.should_log(&err));
        assert!(!bitmap.should_log(&err));

        let other = SensorError::Codec(CodecError::Data("data_size mismatch"));
        assert!(bitmap.should_log(&other));
        assert!(!bitmap.should_log(&other));

        bitmap.clear();
        assert!(bitmap.should_log(&err));
    }

    #[test]
    fn distinct_command_failures_have_distinct_digests() {
        let busy = SensorError::Command { cc: CompletionCode::Busy, reason: ReasonCode::NONE };
        let error = SensorError::Command {
            cc: CompletionCode::Error,
            reason: ReasonCode::TIMEOUT,
        };
        let mut bitmap = ErrorBitmap::default();
        assert!(bitmap.should_log(&busy));
        assert!(bitmap.should_log(&error));
    }
}

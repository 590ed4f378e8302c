//! The adapter between the sensor model and whatever publishes readings.

/// Unit attached to a numeric reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    DegreesC,
    Watts,
    Joules,
    Volts,
    Percent,
    Megahertz,
    Bytes,
    Counts,
}

/// A property value for non-reading publications.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U64(u64),
    I64(i64),
    Double(f64),
    Text(String),
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::U64(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::U64(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Where readings, health and associations go.
///
/// Implementations must be cheap and non-blocking; they are called from the
/// per-device polling tasks.
pub trait PublishingSurface: Send {
    /// Publish a numeric reading. `timestamp` is the device-provided sample
    /// time in microseconds when the reading came out of an aggregate
    /// response carrying one.
    fn set_reading(&mut self, path: &str, value: f64, unit: Unit, timestamp: Option<u64>);

    fn set_available(&mut self, path: &str, available: bool);

    fn set_functional(&mut self, path: &str, functional: bool);

    fn set_property(&mut self, path: &str, iface: &str, prop: &str, value: Value);

    fn add_association(&mut self, path: &str, forward: &str, backward: &str, absolute: &str);
}

/// Discards everything. Stands in where no publishing backend is wired up.
#[derive(Debug, Default)]
pub struct NullSurface;

impl PublishingSurface for NullSurface {
    fn set_reading(&mut self, _path: &str, _value: f64, _unit: Unit, _timestamp: Option<u64>) {}
    fn set_available(&mut self, _path: &str, _available: bool) {}
    fn set_functional(&mut self, _path: &str, _functional: bool) {}
    fn set_property(&mut self, _path: &str, _iface: &str, _prop: &str, _value: Value) {}
    fn add_association(&mut self, _path: &str, _forward: &str, _backward: &str, _absolute: &str) {}
}

/// Writes every publication to the log. The default surface of the `nsmd`
/// binary until a bus backend is attached in front of it.
#[derive(Debug, Default)]
pub struct LogSurface;

impl PublishingSurface for LogSurface {
    fn set_reading(&mut self, path: &str, value: f64, unit: Unit, timestamp: Option<u64>) {
        match timestamp {
            Some(timestamp) => {
                log::debug!("{path}: {value} {unit:?} (sampled at {timestamp} us)")
            }
            None => log::debug!("{path}: {value} {unit:?}"),
        }
    }

    fn set_available(&mut self, path: &str, available: bool) {
        log::debug!("{path}: available = {available}");
    }

    fn set_functional(&mut self, path: &str, functional: bool) {
        log::debug!("{path}: functional = {functional}");
    }

    fn set_property(&mut self, path: &str, iface: &str, prop: &str, value: Value) {
        log::debug!("{path}: {iface}.{prop} = {value:?}");
    }

    fn add_association(&mut self, path: &str, forward: &str, backward: &str, absolute: &str) {
        log::debug!("{path}: association {forward}/{backward} -> {absolute}");
    }
}

/// Records every call; the test double used throughout the sensor tests.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    pub readings: Vec<(String, f64, Unit, Option<u64>)>,
    pub available: Vec<(String, bool)>,
    pub functional: Vec<(String, bool)>,
    pub properties: Vec<(String, String, String, Value)>,
    pub associations: Vec<(String, String, String, String)>,
}

impl RecordingSurface {
    pub fn last_reading(&self, path: &str) -> Option<f64> {
        self.readings.iter().rev().find(|(p, ..)| p == path).map(|(_, value, ..)| *value)
    }

    pub fn last_functional(&self, path: &str) -> Option<bool> {
        self.functional.iter().rev().find(|(p, _)| p == path).map(|(_, func)| *func)
    }

    pub fn last_property(&self, path: &str, prop: &str) -> Option<&Value> {
        self.properties
            .iter()
            .rev()
            .find(|(p, _, name, _)| p == path && name == prop)
            .map(|(_, _, _, value)| value)
    }
}

impl PublishingSurface for RecordingSurface {
    fn set_reading(&mut self, path: &str, value: f64, unit: Unit, timestamp: Option<u64>) {
        self.readings.push((path.to_string(), value, unit, timestamp));
    }

    fn set_available(&mut self, path: &str, available: bool) {
        self.available.push((path.to_string(), available));
    }

    fn set_functional(&mut self, path: &str, functional: bool) {
        self.functional.push((path.to_string(), functional));
    }

    fn set_property(&mut self, path: &str, iface: &str, prop: &str, value: Value) {
        self.properties.push((path.to_string(), iface.to_string(), prop.to_string(), value));
    }

    fn add_association(&mut self, path: &str, forward: &str, backward: &str, absolute: &str) {
        self.associations.push((
            path.to_string(),
            forward.to_string(),
            backward.to_string(),
            absolute.to_string(),
        ));
    }
}

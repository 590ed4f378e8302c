//! Concrete sensor kinds, one module per command family.

pub mod driver_info;
pub mod energy;
pub mod memory;
pub mod pci;
pub mod power;
pub mod processor;
pub mod temp;
pub mod threshold;
pub mod voltage;

pub use driver_info::DriverInfoSensor;
pub use energy::EnergySensor;
pub use memory::MemoryCapacityUtilSensor;
pub use pci::PciGroupSensor;
pub use power::PowerSensor;
pub use processor::{
    ClockLimitSensor, CurrentClockFreqSensor, EccErrorCountsSensor, EccModeSensor, EdppSensor,
    MigSensor, ResetControl, RowRemapSensor, RowRemapKind,
};
pub use temp::TempSensor;
pub use threshold::ThresholdSensor;
pub use voltage::VoltageSensor;

/// Object path for a numeric reading, by sensor category.
pub(crate) fn reading_path(category: &str, name: &str) -> String {
    format!("sensors/{category}/{name}")
}

/// Object path for per-device properties (modes, limits, inventory).
pub(crate) fn device_path(device: &str) -> String {
    format!("inventory/{device}")
}

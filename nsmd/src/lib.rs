//! The NSM telemetry daemon.
//!
//! `nsmd` discovers NVIDIA management endpoints behind a local MCTP
//! demultiplexer, builds a sensor population per device from declarative
//! configuration, and drives every device with a cooperative polling loop:
//! priority sensors every tick, one round-robin sensor per tick, exponential
//! backoff when the device answers BUSY, and rediscovery when a device asks
//! for its capability tables to be re-read.
//!
//! The daemon never opens an object bus itself. Everything it learns goes
//! through the [`publish::PublishingSurface`] adapter, so the same core runs
//! against D-Bus, shared memory or a test recorder.

pub mod aggregator;
pub mod config;
pub mod device;
pub mod events;
pub mod publish;
pub mod scheduler;
pub mod sensor;
pub mod sensors;

pub use device::{Device, DeviceId};
pub use scheduler::{run_device, SchedulerConfig};

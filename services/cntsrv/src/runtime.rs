//! Service runtime: device tasks, supervision and health reporting

pub mod collector;
pub mod health;

pub use collector::{Collector, CollectorReport, DevicePoller, DeviceReport};
pub use health::{DeviceStatus, HealthRegistry, HealthSummary, StatusReport};

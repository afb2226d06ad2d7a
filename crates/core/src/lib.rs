pub mod signal;
pub mod telemetry;
pub mod version;

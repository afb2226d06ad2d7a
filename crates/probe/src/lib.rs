//! Core probe engine: streaming parser, per-protocol probers, the
//! per-endpoint state machine, the admission controller, and the worker
//! pool that ties them together. `crates/cli` is the only consumer.

pub mod admission;
pub mod cdn;
pub mod classify;
pub mod config;
pub mod dial;
pub mod engine;
pub mod intel;
pub mod outcome;
pub mod parse;
pub mod platform;
pub mod probers;
pub mod progress;
pub mod state_machine;
pub mod transport;
pub mod wire;
pub mod writer;

pub use config::RunConfig;
pub use engine::{EngineHandle, start};
pub use outcome::Counters;

//! Stream aggregation engine for dronewatch
//!
//! This crate holds the transport-independent logic of the drone telemetry
//! dashboard: payload normalization, per-source latest/history state, the
//! source connector lifecycle, the remote aggregate poller and the
//! percentage breakdowns consumed by the dashboard.
//!
//! Presentation is not part of this crate. A dashboard reads engine state
//! through [`app_state::SourceHandle`] snapshots and listens to
//! [`app_state::EngineEvent`]s, and never mutates anything directly.

pub mod aggregate;
pub mod app_state;
pub mod config;
pub mod connector;
pub mod metrics;
pub mod sensors;
pub mod storage;
pub mod transport;

pub use app_state::{Engine, EngineError, EngineEvent, SourceHandle};
pub use config::{EngineConfig, SourceConfig};
pub use sensors::{Parameter, Reading, SourceId};

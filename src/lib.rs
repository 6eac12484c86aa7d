//! Measurement-acquisition core for iterative HPC performance analysis.
//!
//! The crate drives online-access-instrumented application processes over
//! a text/binary TCP protocol, schedules conflict-free hardware-counter
//! experiments, and lands the returned profile and per-call-path samples
//! in an iteration-indexed time-series store.
//!
//! # Modules
//!
//! - [`driver`] - protocol driver and per-process state machine
//! - [`scheduler`] - counter-set conflict resolution
//! - [`calltree`] - call-tree index with per-cycle native-id maps
//! - [`store`] - windowed time-series store
//! - [`metrics`] / [`region`] / [`context`] - the measurement data model
//! - [`records`] / [`wire`] - wire formats and the command channel

pub mod calltree;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod records;
pub mod region;
pub mod scheduler;
pub mod store;
pub mod wire;

// Re-export for convenience
pub use calltree::{CallTree, ConfigKind, NodeId, TuningResult};
pub use config::AgentConfig;
pub use context::CallContext;
pub use driver::{
    Driver, GatherStatus, ProcessDescriptor, Subscriber, TuningAction, TuningActionKind,
    TuningRequest, TuningScope,
};
pub use error::{AgentError, Result};
pub use metrics::{Metric, MetricGroup};
pub use region::{RegionId, RegionKind, RegionRegistry};
pub use store::{Interpolation, Reduction, SeriesKey, SeriesStore};

//! Stack Launch
//!
//! A dependency-gated launcher for multi-service stacks.
//!
//! # Overview
//!
//! Stack launch allows you to:
//! - Declare units, their dependencies and health checks in a YAML file
//! - Start every unit as soon as its dependencies are healthy, not merely started
//! - Restart failed units with exponential backoff within a retry budget
//! - Observe every state change as a timestamped transition event
//! - Stop the whole stack cleanly on request
//!
//! # Example Stack File
//!
//! ```yaml
//! version: "1"
//!
//! env:
//!   DATA_DIR: "${HOME}/.local/share/stack"
//!
//! units:
//!   prometheus:
//!     command: prometheus
//!     args: ["--storage.tsdb.path=${DATA_DIR}/prometheus"]
//!     healthcheck:
//!       http: "http://localhost:9090/-/ready"
//!       interval_ms: 500
//!       retries: 5
//!
//!   loki:
//!     command: loki
//!     healthcheck:
//!       tcp: "localhost:3100"
//!
//!   grafana:
//!     command: grafana-server
//!     depends_on:
//!       - prometheus
//!       - loki:
//!           required: false
//!     restart:
//!       policy: on-failure
//!       max_retries: 3
//! ```

pub mod cli;
pub mod config;
pub mod runtime;

pub use cli::StackArgs;
pub use config::{InterpolationError, Interpolator, StackFile, StackFileError};
pub use runtime::{
    ConfigError, DependencyGraph, HealthProbe, LaunchError, Orchestrator, OrchestratorConfig,
    ProbeError, ProbeOutcome, ProcessLauncher, StackPlan, StackResult, StackState,
    StateTransition, TransportProbe, UnitLauncher, UnitSpec, UnitState,
};

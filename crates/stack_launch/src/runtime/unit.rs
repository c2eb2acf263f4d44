//! Immutable unit descriptions handed to the orchestrator

use crate::runtime::dependency::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default grace period between SIGTERM and a forced kill
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How to launch a unit.
///
/// The orchestration core passes this through to the launcher untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Executable to run
    pub command: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Environment variables (global stack env merged with unit env)
    pub env: HashMap<String, String>,
    /// Working directory for the process
    pub working_dir: Option<PathBuf>,
}

impl LaunchConfig {
    /// Launch config that runs `command` with no arguments
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Append arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// A declared dependency edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Name of the unit depended on
    pub name: String,
    /// Hard dependency: must be `Healthy`. Soft: any terminal state suffices.
    pub required: bool,
}

/// What a single probe attempt talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// HTTP GET, any 2xx is healthy
    Http { url: String },
    /// TCP connect to `host:port`
    Tcp { address: String },
    /// Run a command, exit status 0 is healthy
    Command { argv: Vec<String> },
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::Http { url } => write!(f, "http {}", url),
            ProbeTarget::Tcp { address } => write!(f, "tcp {}", address),
            ProbeTarget::Command { argv } => write!(f, "command `{}`", argv.join(" ")),
        }
    }
}

/// Health check definition for a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub target: ProbeTarget,
    /// Delay between probes (and before the first one)
    pub interval: Duration,
    /// Per-attempt timeout; exceeding it counts as unhealthy
    pub timeout: Duration,
    /// Consecutive unhealthy probes before the unit is failed
    pub max_consecutive_failures: u32,
    /// Grace period after launch during which failures are not counted
    pub start_period: Duration,
}

impl HealthCheck {
    /// Health check with one-second interval and timeout and three retries
    pub fn new(target: ProbeTarget) -> Self {
        Self {
            target,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            max_consecutive_failures: 3,
            start_period: Duration::ZERO,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    pub fn with_start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }
}

/// Restart policy for a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart (default)
    #[default]
    Never,
    /// Restart on health failure, launch failure or non-zero exit
    OnFailure,
    /// Restart on any failure, including a clean exit
    Always,
}

/// Exponential backoff between restarts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl Backoff {
    /// Constant delay between restarts
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_ms: ms,
            max_ms: ms,
            multiplier: 1.0,
        }
    }

    /// Delay before restart number `restart` (1-based)
    pub fn delay(&self, restart: u32) -> Duration {
        let exponent = restart.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_ms as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Restart behaviour: policy plus bounded budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartSpec {
    pub policy: RestartPolicy,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RestartSpec {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::Never,
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RestartSpec {
    pub fn never() -> Self {
        Self::default()
    }

    pub fn on_failure(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            policy: RestartPolicy::OnFailure,
            max_retries,
            backoff,
        }
    }

    pub fn always(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            policy: RestartPolicy::Always,
            max_retries,
            backoff,
        }
    }
}

/// One runnable unit of the stack
#[derive(Debug, Clone)]
pub struct UnitSpec {
    /// Unique, non-empty name
    pub name: String,
    /// Opaque launch configuration
    pub launch: LaunchConfig,
    /// Declared dependencies, in declaration order
    pub dependencies: Vec<Dependency>,
    /// `None` means the unit is healthy as soon as it is launched
    pub health_check: Option<HealthCheck>,
    pub restart: RestartSpec,
    /// Grace period given to the unit when it is stopped
    pub stop_timeout: Duration,
}

impl UnitSpec {
    pub fn new(name: impl Into<String>, launch: LaunchConfig) -> Self {
        Self {
            name: name.into(),
            launch,
            dependencies: Vec::new(),
            health_check: None,
            restart: RestartSpec::default(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Add a hard dependency
    pub fn depends_on(self, name: impl Into<String>) -> Self {
        self.with_dependency(name, true)
    }

    /// Add a soft dependency
    pub fn soft_depends_on(self, name: impl Into<String>) -> Self {
        self.with_dependency(name, false)
    }

    /// Add a dependency; a repeated name is hard if any declaration is hard
    pub fn with_dependency(mut self, name: impl Into<String>, required: bool) -> Self {
        let name = name.into();
        match self.dependencies.iter_mut().find(|d| d.name == name) {
            Some(existing) => existing.required |= required,
            None => self.dependencies.push(Dependency { name, required }),
        }
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = Some(health_check);
        self
    }

    pub fn with_restart(mut self, restart: RestartSpec) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Whether the dependency on `name` is required (`None` if not declared)
    pub fn dependency_required(&self, name: &str) -> Option<bool> {
        self.dependencies
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.required)
    }

    /// Check the unit on its own, without looking at other units
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUnit {
            unit: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.launch.command.trim().is_empty() {
            return Err(invalid("command must not be empty"));
        }
        if let Some(hc) = &self.health_check {
            if hc.interval.is_zero() {
                return Err(invalid("health check interval must be greater than zero"));
            }
            if hc.timeout.is_zero() {
                return Err(invalid("health check timeout must be greater than zero"));
            }
            if hc.max_consecutive_failures == 0 {
                return Err(invalid("health check retries must be at least 1"));
            }
            if let ProbeTarget::Command { argv } = &hc.target {
                if argv.is_empty() {
                    return Err(invalid("health check command must not be empty"));
                }
            }
        }
        let backoff = &self.restart.backoff;
        if backoff.multiplier.is_nan() || backoff.multiplier < 1.0 {
            return Err(invalid("restart backoff multiplier must be >= 1.0"));
        }
        if backoff.max_ms < backoff.initial_ms {
            return Err(invalid("restart backoff max_ms must be >= initial_ms"));
        }
        Ok(())
    }
}

//! Stack file YAML schema definitions

use crate::config::Interpolator;
use crate::runtime::dependency::ConfigError;
use crate::runtime::unit::{
    Backoff, HealthCheck, LaunchConfig, ProbeTarget, RestartPolicy, RestartSpec, UnitSpec,
    DEFAULT_STOP_TIMEOUT,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Root stack file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackFile {
    /// Stack file format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Environment variables (applied to all units, visible to interpolation).
    /// Expanded in declaration order: an entry may refer to the ones above it.
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Unit definitions (ordered map; display order only, never start order)
    pub units: IndexMap<String, UnitConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Unit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitConfig {
    /// Executable to run
    pub command: String,

    /// Arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables specific to this unit
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the process
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Units this one waits on
    #[serde(default)]
    pub depends_on: Vec<DependencySpec>,

    /// Health check; without one the unit is healthy once launched
    #[serde(default)]
    pub healthcheck: Option<HealthCheckConfig>,

    /// Restart policy
    #[serde(default)]
    pub restart: RestartConfig,

    /// Profiles this unit belongs to (empty = always enabled)
    #[serde(default)]
    pub profiles: Vec<String>,

    /// Grace period between SIGTERM and kill
    #[serde(default)]
    pub stop_timeout_ms: Option<u64>,
}

/// Dependency specification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    /// Plain unit name: a required dependency
    Simple(String),
    /// `{ unit_name: { required: bool } }`
    Detailed(IndexMap<String, DependencyOptions>),
}

impl DependencySpec {
    /// All `(unit name, required)` pairs this entry declares
    pub fn entries(&self) -> Vec<(&str, bool)> {
        match self {
            DependencySpec::Simple(name) => vec![(name.as_str(), true)],
            DependencySpec::Detailed(map) => map
                .iter()
                .map(|(name, opts)| (name.as_str(), opts.required))
                .collect(),
        }
    }
}

/// Options of a detailed dependency entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyOptions {
    /// Whether the dependency must be healthy (default: true)
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Health check configuration; exactly one of `http`, `tcp`, `command`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub http: Option<String>,
    #[serde(default)]
    pub tcp: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures before the unit is declared failed
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub start_period_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_retries() -> u32 {
    3
}

/// Restart configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartConfig {
    #[serde(default)]
    pub policy: RestartPolicy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::Never,
            max_retries: default_max_retries(),
            backoff: Backoff::default(),
        }
    }
}

impl StackFile {
    /// Load stack file from a YAML file
    pub fn from_file(path: &str) -> Result<Self, StackFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| StackFileError::Io {
            path: path.to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse stack file from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, StackFileError> {
        let stack_file: StackFile = serde_yaml::from_str(content).map_err(StackFileError::Parse)?;
        stack_file.validate()?;
        Ok(stack_file)
    }

    /// Validate the stack file structure
    pub fn validate(&self) -> Result<(), StackFileError> {
        if self.units.is_empty() {
            return Err(StackFileError::Validation(
                "stack file declares no units".to_string(),
            ));
        }

        for (name, unit) in &self.units {
            if let Some(hc) = &unit.healthcheck {
                let targets = [hc.http.is_some(), hc.tcp.is_some(), hc.command.is_some()]
                    .iter()
                    .filter(|set| **set)
                    .count();
                if targets != 1 {
                    return Err(StackFileError::Validation(format!(
                        "Unit '{}': healthcheck must specify exactly one of 'http', 'tcp' or 'command'",
                        name
                    )));
                }
            }

            for dep in &unit.depends_on {
                for (dep_name, _) in dep.entries() {
                    if !self.units.contains_key(dep_name) {
                        return Err(StackFileError::Validation(format!(
                            "Unit '{}': depends on unknown unit '{}'",
                            name, dep_name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Get all unique profile names
    pub fn profiles(&self) -> Vec<String> {
        let mut profiles: Vec<String> = self
            .units
            .values()
            .flat_map(|u| u.profiles.iter().cloned())
            .collect();
        profiles.sort();
        profiles.dedup();
        profiles
    }

    /// Names of units enabled for the selected profiles
    pub fn enabled_units(&self, selected_profiles: &HashSet<String>) -> HashSet<String> {
        self.units
            .iter()
            .filter(|(_, u)| {
                u.profiles.is_empty() || u.profiles.iter().any(|p| selected_profiles.contains(p))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Interpolate and convert enabled units into [`UnitSpec`]s
    pub fn resolve(
        &self,
        interpolator: &Interpolator,
        selected_profiles: &HashSet<String>,
    ) -> Result<Vec<UnitSpec>, ConfigError> {
        let enabled = self.enabled_units(selected_profiles);
        let mut specs = Vec::with_capacity(enabled.len());

        // Global env is expanded once, then visible to every unit's values
        let mut interpolator = interpolator.clone();
        let mut global_env = HashMap::with_capacity(self.env.len());
        for (k, v) in &self.env {
            let value = interpolator
                .interpolate(v)
                .map_err(|e| ConfigError::Interpolation {
                    context: format!("global env '{}'", k),
                    source: e,
                })?;
            interpolator.env.insert(k.clone(), value.clone());
            global_env.insert(k.clone(), value);
        }

        for (name, unit) in &self.units {
            if !enabled.contains(name) {
                continue;
            }
            for dep in &unit.depends_on {
                for (dep_name, _) in dep.entries() {
                    if self.units.contains_key(dep_name) && !enabled.contains(dep_name) {
                        return Err(ConfigError::DisabledDependency {
                            unit: name.clone(),
                            dependency: dep_name.to_string(),
                        });
                    }
                }
            }
            specs.push(Self::resolve_unit(name, unit, &global_env, &interpolator)?);
        }

        Ok(specs)
    }

    fn resolve_unit(
        name: &str,
        unit: &UnitConfig,
        global_env: &HashMap<String, String>,
        interpolator: &Interpolator,
    ) -> Result<UnitSpec, ConfigError> {
        let interp = |value: &str, field: &str| {
            interpolator
                .interpolate(value)
                .map_err(|e| ConfigError::Interpolation {
                    context: format!("unit '{}' {}", name, field),
                    source: e,
                })
        };

        // Global env first, then unit-specific values override
        let mut env = global_env.clone();
        for (k, v) in &unit.env {
            env.insert(k.clone(), interp(v, &format!("env '{}'", k))?);
        }

        let mut args = Vec::with_capacity(unit.args.len());
        for arg in &unit.args {
            args.push(interp(arg, "args")?);
        }

        let launch = LaunchConfig {
            command: interp(&unit.command, "command")?,
            args,
            env,
            working_dir: match &unit.working_dir {
                Some(dir) => Some(PathBuf::from(interp(dir, "working_dir")?)),
                None => None,
            },
        };

        let mut spec = UnitSpec::new(name, launch)
            .with_restart(RestartSpec {
                policy: unit.restart.policy,
                max_retries: unit.restart.max_retries,
                backoff: unit.restart.backoff,
            })
            .with_stop_timeout(
                unit.stop_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_STOP_TIMEOUT),
            );

        for dep in &unit.depends_on {
            for (dep_name, required) in dep.entries() {
                spec = spec.with_dependency(dep_name, required);
            }
        }

        if let Some(hc) = &unit.healthcheck {
            let target = if let Some(url) = &hc.http {
                ProbeTarget::Http {
                    url: interp(url, "healthcheck.http")?,
                }
            } else if let Some(address) = &hc.tcp {
                ProbeTarget::Tcp {
                    address: interp(address, "healthcheck.tcp")?,
                }
            } else if let Some(argv) = &hc.command {
                let mut resolved = Vec::with_capacity(argv.len());
                for arg in argv {
                    resolved.push(interp(arg, "healthcheck.command")?);
                }
                ProbeTarget::Command { argv: resolved }
            } else {
                return Err(ConfigError::InvalidUnit {
                    unit: name.to_string(),
                    reason: "healthcheck has no target".to_string(),
                });
            };

            spec = spec.with_health_check(
                HealthCheck::new(target)
                    .with_interval(Duration::from_millis(hc.interval_ms))
                    .with_timeout(Duration::from_millis(hc.timeout_ms))
                    .with_max_failures(hc.retries)
                    .with_start_period(Duration::from_millis(hc.start_period_ms)),
            );
        }

        Ok(spec)
    }
}

/// Errors that can occur when loading a stack file
#[derive(Debug, thiserror::Error)]
pub enum StackFileError {
    #[error("Failed to read stack file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse stack file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const STACK: &str = r#"
version: "1.0"
env:
  OTEL_ENDPOINT: "http://otel-collector:4317"
units:
  prometheus:
    command: prometheus
    args: ["--config.file=${PROM_CONFIG:-prometheus.yml}"]
    healthcheck:
      http: "http://localhost:9090/-/ready"
      interval_ms: 500
      retries: 5
  loki:
    command: loki
    healthcheck:
      tcp: "localhost:3100"
  grafana:
    command: grafana-server
    env:
      GF_LOG_LEVEL: warn
    depends_on:
      - prometheus
      - loki: { required: false }
    restart:
      policy: on-failure
      max_retries: 2
      backoff: { initial_ms: 100, max_ms: 400 }
  debug-ui:
    command: jaeger
    profiles: [debug]
    depends_on:
      - grafana
"#;

    fn no_profiles() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn test_parse_stack_file() {
        let stack = StackFile::from_yaml(STACK).unwrap();
        assert_eq!(stack.units.len(), 4);
        assert_eq!(stack.version, "1.0");
        assert_eq!(stack.profiles(), vec!["debug".to_string()]);

        let grafana = &stack.units["grafana"];
        assert_eq!(grafana.restart.policy, RestartPolicy::OnFailure);
        assert_eq!(grafana.restart.backoff.multiplier, 2.0);
    }

    #[test]
    fn test_resolve_units() {
        let stack = StackFile::from_yaml(STACK).unwrap();
        let units = stack
            .resolve(&Interpolator::isolated(), &no_profiles())
            .unwrap();

        let names: Vec<_> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["prometheus", "loki", "grafana"]);

        let prometheus = &units[0];
        assert_eq!(prometheus.launch.args, vec!["--config.file=prometheus.yml"]);
        let hc = prometheus.health_check.as_ref().unwrap();
        assert_eq!(hc.interval, Duration::from_millis(500));
        assert_eq!(hc.max_consecutive_failures, 5);

        let grafana = &units[2];
        assert_eq!(grafana.dependency_required("prometheus"), Some(true));
        assert_eq!(grafana.dependency_required("loki"), Some(false));
        assert_eq!(grafana.launch.env["GF_LOG_LEVEL"], "warn");
        assert_eq!(grafana.launch.env["OTEL_ENDPOINT"], "http://otel-collector:4317");
        assert!(grafana.health_check.is_none());
        assert_eq!(grafana.restart.max_retries, 2);
    }

    #[test]
    fn test_profile_enables_unit() {
        let stack = StackFile::from_yaml(STACK).unwrap();
        let profiles: HashSet<String> = ["debug".to_string()].into_iter().collect();
        let units = stack.resolve(&Interpolator::isolated(), &profiles).unwrap();
        assert_eq!(units.len(), 4);
    }

    #[test]
    fn test_dependency_on_disabled_unit() {
        let yaml = r#"
units:
  base:
    command: base
    profiles: [extra]
  app:
    command: app
    depends_on: [base]
"#;
        let stack = StackFile::from_yaml(yaml).unwrap();
        let result = stack.resolve(&Interpolator::isolated(), &no_profiles());
        assert!(matches!(
            result,
            Err(ConfigError::DisabledDependency { .. })
        ));
    }

    #[test]
    fn test_interpolation_error_names_field() {
        let yaml = r#"
units:
  app:
    command: app
    env:
      TOKEN: "${APP_TOKEN:?token required}"
"#;
        let stack = StackFile::from_yaml(yaml).unwrap();
        let err = stack
            .resolve(&Interpolator::isolated(), &no_profiles())
            .unwrap_err();
        assert!(err.to_string().contains("unit 'app' env 'TOKEN'"));
    }

    #[test]
    fn test_global_env_is_expanded_before_use() {
        let yaml = r#"
env:
  DATA_DIR: "${ROOT:-/var/lib}/stack"
units:
  app:
    command: app
    args: ["--data=${DATA_DIR}"]
"#;
        let stack = StackFile::from_yaml(yaml).unwrap();
        let units = stack
            .resolve(&Interpolator::isolated(), &no_profiles())
            .unwrap();
        assert_eq!(units[0].launch.args, vec!["--data=/var/lib/stack"]);
        assert_eq!(units[0].launch.env["DATA_DIR"], "/var/lib/stack");

        let overridden = stack
            .resolve(
                &Interpolator::isolated().with_override("ROOT", "/srv"),
                &no_profiles(),
            )
            .unwrap();
        assert_eq!(overridden[0].launch.args, vec!["--data=/srv/stack"]);
    }

    #[test]
    fn test_global_env_sees_earlier_entries() {
        let yaml = r#"
env:
  BASE: /opt/stack
  CONFIG_DIR: "${BASE}/etc"
  LOG_DIR: "${LATER:-none}"
  LATER: defined-too-late
units:
  app:
    command: "${CONFIG_DIR}/app"
"#;
        let stack = StackFile::from_yaml(yaml).unwrap();
        let units = stack
            .resolve(&Interpolator::isolated(), &no_profiles())
            .unwrap();
        assert_eq!(units[0].launch.command, "/opt/stack/etc/app");
        assert_eq!(units[0].launch.env["CONFIG_DIR"], "/opt/stack/etc");
        // Entries below are not yet visible
        assert_eq!(units[0].launch.env["LOG_DIR"], "none");

        let forward = r#"
env:
  A: "${B}"
  B: value
units:
  app:
    command: app
"#;
        let err = StackFile::from_yaml(forward)
            .unwrap()
            .resolve(&Interpolator::isolated(), &no_profiles())
            .unwrap_err();
        assert!(err.to_string().contains("global env 'A'"));
    }

    #[test]
    fn test_validation_multiple_probe_targets() {
        let yaml = r#"
units:
  bad:
    command: bad
    healthcheck:
      http: "http://localhost"
      tcp: "localhost:80"
"#;
        assert!(matches!(
            StackFile::from_yaml(yaml),
            Err(StackFileError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_unknown_dependency() {
        let yaml = r#"
units:
  app:
    command: app
    depends_on: [db]
"#;
        assert!(StackFile::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
units:
  app:
    command: app
    restart_policy: always
"#;
        assert!(matches!(
            StackFile::from_yaml(yaml),
            Err(StackFileError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(STACK.as_bytes()).unwrap();

        let stack = StackFile::from_file(file.path().to_str().unwrap()).unwrap();
        assert!(stack.units.contains_key("loki"));

        let missing = StackFile::from_file("/nonexistent/stack.yaml");
        assert!(matches!(missing, Err(StackFileError::Io { .. })));
    }
}

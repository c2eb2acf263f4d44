//! Health probes: single attempts classified as healthy, unhealthy or probe error

use crate::runtime::unit::ProbeTarget;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::Instant;

/// Classification of one probe attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// The unit answered badly, refused, or did not answer in time
    Unhealthy(String),
    /// Fault unrelated to the unit's own state (bad target, resolution, transport)
    Error(ProbeError),
}

/// Result of [`probe_once`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub outcome: ProbeOutcome,
    pub latency: Duration,
    pub at: DateTime<Utc>,
}

/// Probe errors; transient from the unit's point of view
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("Invalid probe target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("Cannot resolve '{0}'")]
    Resolve(String),

    #[error("Probe transport error: {0}")]
    Transport(String),
}

/// A single health check attempt against a unit
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `target` once. `timeout` is advisory here; [`probe_once`] enforces it.
    async fn check(&self, target: &ProbeTarget, timeout: Duration) -> ProbeOutcome;
}

/// Run one attempt, turning an exceeded timeout into `Unhealthy`
pub async fn probe_once(
    probe: &dyn HealthProbe,
    target: &ProbeTarget,
    timeout: Duration,
) -> ProbeReport {
    let started = Instant::now();
    let outcome = match tokio::time::timeout(timeout, probe.check(target, timeout)).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::Unhealthy(format!("timed out after {}ms", timeout.as_millis())),
    };

    ProbeReport {
        outcome,
        latency: started.elapsed(),
        at: Utc::now(),
    }
}

/// Probes over real transports: HTTP GET, TCP connect or a command
#[derive(Debug, Clone)]
pub struct TransportProbe {
    client: reqwest::Client,
}

impl TransportProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("stack_launch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    async fn check_http(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let parsed = match reqwest::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => parsed,
            Ok(parsed) => {
                return ProbeOutcome::Error(ProbeError::InvalidTarget {
                    target: url.to_string(),
                    reason: format!("unsupported scheme '{}'", parsed.scheme()),
                })
            }
            Err(e) => {
                return ProbeOutcome::Error(ProbeError::InvalidTarget {
                    target: url.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        // Resolve first so name resolution faults are not blamed on the unit
        let host = parsed.host_str().unwrap_or_default().to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);
        if let Err(e) = resolve(&format!("{}:{}", host, port)).await {
            return ProbeOutcome::Error(e);
        }

        match self.client.get(parsed).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(response) => ProbeOutcome::Unhealthy(format!("HTTP {}", response.status())),
            Err(e) if e.is_builder() => ProbeOutcome::Error(ProbeError::InvalidTarget {
                target: url.to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.is_timeout() => {
                ProbeOutcome::Unhealthy(format!("timed out after {}ms", timeout.as_millis()))
            }
            Err(e) => ProbeOutcome::Unhealthy(e.to_string()),
        }
    }

    async fn check_tcp(&self, address: &str) -> ProbeOutcome {
        let addrs = match resolve(address).await {
            Ok(addrs) => addrs,
            Err(e) => return ProbeOutcome::Error(e),
        };

        match TcpStream::connect(addrs.as_slice()).await {
            Ok(_) => ProbeOutcome::Healthy,
            Err(e) => ProbeOutcome::Unhealthy(format!("connect {}: {}", address, e)),
        }
    }

    async fn check_command(&self, argv: &[String]) -> ProbeOutcome {
        let Some((program, args)) = argv.split_first() else {
            return ProbeOutcome::Error(ProbeError::InvalidTarget {
                target: String::new(),
                reason: "empty command".to_string(),
            });
        };

        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(status) if status.success() => ProbeOutcome::Healthy,
            Ok(status) => ProbeOutcome::Unhealthy(match status.code() {
                Some(code) => format!("`{}` exited with code {}", program, code),
                None => format!("`{}` terminated by signal", program),
            }),
            Err(e) => ProbeOutcome::Error(ProbeError::Transport(format!(
                "cannot run `{}`: {}",
                program, e
            ))),
        }
    }
}

#[async_trait]
impl HealthProbe for TransportProbe {
    async fn check(&self, target: &ProbeTarget, timeout: Duration) -> ProbeOutcome {
        match target {
            ProbeTarget::Http { url } => self.check_http(url, timeout).await,
            ProbeTarget::Tcp { address } => self.check_tcp(address).await,
            ProbeTarget::Command { argv } => self.check_command(argv).await,
        }
    }
}

/// Resolve `host:port` to socket addresses
async fn resolve(address: &str) -> Result<Vec<std::net::SocketAddr>, ProbeError> {
    if !address.contains(':') {
        return Err(ProbeError::InvalidTarget {
            target: address.to_string(),
            reason: "expected host:port".to_string(),
        });
    }

    let addrs: Vec<_> = tokio::net::lookup_host(address)
        .await
        .map_err(|e| ProbeError::Resolve(format!("{}: {}", address, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(ProbeError::Resolve(address.to_string()));
    }
    Ok(addrs)
}

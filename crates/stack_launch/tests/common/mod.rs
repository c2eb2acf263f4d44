//! Test helpers: scripted launcher and probe for deterministic orchestration tests
//!
//! Everything here is driven by tokio's clock, so tests run under
//! `#[tokio::test(start_paused = true)]` and observe exact timings.

#![allow(dead_code)]

use async_trait::async_trait;
use stack_launch::runtime::{
    HealthCheck, HealthProbe, LaunchConfig, LaunchError, ProbeError, ProbeOutcome, ProbeTarget,
    RunningUnit, StateTransition, SupervisorCommand, UnitLauncher, UnitSpec, UnitSummary,
    UnitSupervisor,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What the launcher does on one `start` call for a unit
#[derive(Debug, Clone)]
pub enum Step {
    /// Launch fails
    Fail,
    /// Launch succeeds, unit runs until stopped
    Run,
    /// Launch takes this long, then the unit runs until stopped
    SlowRun(Duration),
    /// Launch succeeds, unit exits on its own after the delay
    ExitAfter(Duration, Option<i32>),
}

/// Launcher that follows a per-unit script; units without more steps just run
pub struct ScriptedLauncher {
    origin: Instant,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    starts: Mutex<Vec<(String, Duration)>>,
    stops: Arc<Mutex<Vec<String>>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            scripts: Mutex::new(HashMap::new()),
            starts: Mutex::new(Vec::new()),
            stops: Arc::new(Mutex::new(Vec::new())),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn script(&self, unit: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(unit.to_string())
            .or_default()
            .extend(steps);
    }

    /// Offsets from test start at which `unit` was asked to start
    pub fn starts_of(&self, unit: &str) -> Vec<Duration> {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == unit)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn started(&self, unit: &str) -> bool {
        !self.starts_of(unit).is_empty()
    }

    pub fn stops_of(&self, unit: &str) -> usize {
        self.stops
            .lock()
            .unwrap()
            .iter()
            .filter(|name| *name == unit)
            .count()
    }

    /// Launched units not yet stopped
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitLauncher for ScriptedLauncher {
    async fn start(&self, unit: &UnitSpec) -> Result<Box<dyn RunningUnit>, LaunchError> {
        self.starts
            .lock()
            .unwrap()
            .push((unit.name.clone(), self.origin.elapsed()));

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&unit.name)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Run);

        let exit = match step {
            Step::Fail => {
                return Err(LaunchError::Rejected {
                    unit: unit.name.clone(),
                    reason: "scripted failure".to_string(),
                })
            }
            Step::Run => None,
            Step::SlowRun(delay) => {
                tokio::time::sleep(delay).await;
                None
            }
            Step::ExitAfter(delay, code) => Some((Instant::now() + delay, code)),
        };

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeUnit {
            name: unit.name.clone(),
            exit,
            stopped: false,
            stops: self.stops.clone(),
            live: self.live.clone(),
        }))
    }
}

/// Handle returned by [`ScriptedLauncher`]
pub struct FakeUnit {
    name: String,
    exit: Option<(Instant, Option<i32>)>,
    stopped: bool,
    stops: Arc<Mutex<Vec<String>>>,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl RunningUnit for FakeUnit {
    fn id(&self) -> String {
        format!("fake-{}", self.name)
    }

    async fn exited(&mut self) -> Option<i32> {
        match self.exit {
            Some((deadline, code)) => {
                tokio::time::sleep_until(deadline).await;
                code
            }
            None => std::future::pending().await,
        }
    }

    async fn stop(&mut self, _grace: Duration) -> Result<(), LaunchError> {
        if !self.stopped {
            self.stopped = true;
            self.stops.lock().unwrap().push(self.name.clone());
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Probe answering from per-unit scripts, keyed by the TCP address
/// (tests use the unit name as address). Falls back to `Healthy`.
pub struct ScriptedProbe {
    scripts: Mutex<HashMap<String, VecDeque<ProbeOutcome>>>,
    fallback: Mutex<HashMap<String, ProbeOutcome>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        })
    }

    /// Outcomes returned, in order, before the fallback applies
    pub fn script(&self, unit: &str, outcomes: impl IntoIterator<Item = ProbeOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(unit.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Outcome once the script is used up
    pub fn always(&self, unit: &str, outcome: ProbeOutcome) {
        self.fallback
            .lock()
            .unwrap()
            .insert(unit.to_string(), outcome);
    }

    pub fn calls(&self, unit: &str) -> u32 {
        self.calls.lock().unwrap().get(unit).copied().unwrap_or(0)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, target: &ProbeTarget, _timeout: Duration) -> ProbeOutcome {
        let key = match target {
            ProbeTarget::Tcp { address } => address.clone(),
            other => other.to_string(),
        };
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;

        if let Some(outcome) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|outcomes| outcomes.pop_front())
        {
            return outcome;
        }
        self.fallback
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or(ProbeOutcome::Healthy)
    }
}

pub fn unhealthy() -> ProbeOutcome {
    ProbeOutcome::Unhealthy("scripted".to_string())
}

pub fn probe_error() -> ProbeOutcome {
    ProbeOutcome::Error(ProbeError::Resolve("scripted".to_string()))
}

/// A unit probed every second, failing after three unhealthy probes
pub fn unit(name: &str) -> UnitSpec {
    UnitSpec::new(name, LaunchConfig::command(name)).with_health_check(
        HealthCheck::new(ProbeTarget::Tcp {
            address: name.to_string(),
        })
        .with_interval(Duration::from_secs(1)),
    )
}

/// A unit with no health check: healthy as soon as it is launched
pub fn unchecked_unit(name: &str) -> UnitSpec {
    UnitSpec::new(name, LaunchConfig::command(name))
}

/// Assert that `actual` is `expected` seconds after test start
pub fn assert_at(actual: Duration, expected: f64) {
    let expected = Duration::from_secs_f64(expected);
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= Duration::from_millis(10),
        "expected t={:?}, got t={:?}",
        expected,
        actual
    );
}

/// A single supervisor wired to test-owned channels
pub struct SupervisorHarness {
    pub events: mpsc::UnboundedReceiver<StateTransition>,
    pub commands: mpsc::UnboundedSender<SupervisorCommand>,
    pub stop: watch::Sender<bool>,
    pub task: JoinHandle<UnitSummary>,
}

impl SupervisorHarness {
    pub fn spawn(
        spec: UnitSpec,
        launcher: Arc<ScriptedLauncher>,
        probe: Arc<ScriptedProbe>,
    ) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        let supervisor = UnitSupervisor::new(
            Arc::new(spec),
            launcher,
            probe,
            event_tx,
            command_rx,
            stop_rx,
        );
        Self {
            events,
            commands,
            stop,
            task: tokio::spawn(supervisor.run()),
        }
    }

    /// Next transition, waiting at most a minute of (paused) time
    pub async fn next(&mut self) -> StateTransition {
        tokio::time::timeout(Duration::from_secs(60), self.events.recv())
            .await
            .expect("no transition within 60s")
            .expect("supervisor dropped its event channel")
    }
}

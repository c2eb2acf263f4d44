//! Per-unit supervisor: launch, health polling, restart and stop.
//!
//! Each supervisor runs as its own task and is the only owner of its
//! [`UnitRuntimeState`]. It talks to the orchestrator through two channels:
//! it receives [`SupervisorCommand`]s (leave `Pending`, or give up) and emits
//! [`StateTransition`]s. A shared stop flag is observed at every scheduling
//! point: while waiting to start, between probes and during restart backoff.
//! A launch in progress always completes before the stop is honoured, so a
//! started resource is never left unsupervised.

use crate::runtime::launcher::{RunningUnit, UnitLauncher};
use crate::runtime::probe::{probe_once, HealthProbe, ProbeOutcome, ProbeReport};
use crate::runtime::state::{StateTransition, UnitState};
use crate::runtime::unit::{HealthCheck, RestartPolicy, UnitSpec};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Consecutive probe errors tolerated before one is counted as unhealthy
pub const PROBE_ERROR_CAP: u32 = 3;

/// Uptime after which a unit without a health check counts as stable,
/// refreshing its restart budget
pub const STABLE_RUN_WINDOW: Duration = Duration::from_secs(10);

/// Instructions from the orchestrator to a `Pending` unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Dependencies are satisfied
    Start,
    /// A required dependency can never become healthy
    Abandon { reason: String },
}

/// Mutable state of one unit, owned by its supervisor
#[derive(Default)]
pub struct UnitRuntimeState {
    pub state: UnitState,
    /// Launch attempts so far
    pub launches: u32,
    /// Restarts so far
    pub restarts: u32,
    /// Restarts charged against the budget since the unit was last healthy
    pub budget_used: u32,
    pub consecutive_failures: u32,
    pub probe_errors: u32,
    pub last_probe: Option<ProbeReport>,
    handle: Option<Box<dyn RunningUnit>>,
}

/// Final report of a supervisor task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSummary {
    pub name: String,
    pub state: UnitState,
    pub launches: u32,
    pub restarts: u32,
    /// Most recent health probe, if the unit was ever probed
    pub last_probe: Option<ProbeReport>,
}

enum Gate {
    Start,
    Abandon(String),
    Stop,
}

enum Tick {
    Stop,
    Exited(Option<i32>),
    Probe,
}

enum Failure {
    Launch(String),
    Unhealthy(String),
    Exited(Option<i32>),
}

#[derive(PartialEq, Eq)]
enum Next {
    Restart,
    Done,
}

/// Owns the lifecycle of exactly one unit
pub struct UnitSupervisor {
    spec: Arc<UnitSpec>,
    launcher: Arc<dyn UnitLauncher>,
    probe: Arc<dyn HealthProbe>,
    runtime: UnitRuntimeState,
    events: mpsc::UnboundedSender<StateTransition>,
    commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    stop: watch::Receiver<bool>,
}

impl UnitSupervisor {
    pub fn new(
        spec: Arc<UnitSpec>,
        launcher: Arc<dyn UnitLauncher>,
        probe: Arc<dyn HealthProbe>,
        events: mpsc::UnboundedSender<StateTransition>,
        commands: mpsc::UnboundedReceiver<SupervisorCommand>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            spec,
            launcher,
            probe,
            runtime: UnitRuntimeState::default(),
            events,
            commands,
            stop,
        }
    }

    /// Drive the unit until it reaches a terminal state
    pub async fn run(mut self) -> UnitSummary {
        loop {
            match self.wait_for_start().await {
                Gate::Start => {}
                Gate::Abandon(reason) => {
                    self.transition(UnitState::Failed, reason, true);
                    break;
                }
                Gate::Stop => {
                    self.transition(UnitState::Stopped, "cancelled before start", true);
                    break;
                }
            }

            let reason = if self.runtime.launches == 0 {
                "dependencies ready".to_string()
            } else {
                format!("restart {} of {}", self.runtime.budget_used, self.spec.restart.max_retries)
            };
            self.transition(UnitState::Starting, reason, false);
            self.runtime.launches += 1;

            // Not raced against stop: the launch must complete or fail first
            match self.launcher.start(&self.spec).await {
                Ok(handle) => self.runtime.handle = Some(handle),
                Err(e) => {
                    if self.fail(Failure::Launch(e.to_string())).await == Next::Done {
                        break;
                    }
                    continue;
                }
            }

            if self.stop_requested() {
                self.release().await;
                self.transition(UnitState::Stopped, "stop requested during launch", true);
                break;
            }

            let id = self
                .runtime
                .handle
                .as_ref()
                .map(|h| h.id())
                .unwrap_or_default();
            self.transition(UnitState::WaitingHealthy, format!("launched ({})", id), false);

            match self.supervise().await {
                None => {
                    self.release().await;
                    self.transition(UnitState::Stopped, "stop requested", true);
                    break;
                }
                Some(failure) => {
                    self.release().await;
                    if self.fail(failure).await == Next::Done {
                        break;
                    }
                }
            }
        }

        UnitSummary {
            name: self.spec.name.clone(),
            state: self.runtime.state,
            launches: self.runtime.launches,
            restarts: self.runtime.restarts,
            last_probe: self.runtime.last_probe,
        }
    }

    async fn wait_for_start(&mut self) -> Gate {
        if self.stop_requested() {
            return Gate::Stop;
        }

        tokio::select! {
            biased;
            _ = wait_stopped(&mut self.stop) => Gate::Stop,
            command = self.commands.recv() => match command {
                Some(SupervisorCommand::Start) => Gate::Start,
                Some(SupervisorCommand::Abandon { reason }) => Gate::Abandon(reason),
                // Orchestrator is gone: nobody can ever start us
                None => Gate::Stop,
            },
        }
    }

    /// Watch a launched unit. `None` means stop was requested.
    async fn supervise(&mut self) -> Option<Failure> {
        let Some(hc) = self.spec.health_check.clone() else {
            // Launch alone does not prove stability: the budget is kept
            // until the unit has stayed up for a while
            self.transition(UnitState::Healthy, "no health check configured", false);
            let mut window = Some(STABLE_RUN_WINDOW);
            loop {
                match self.next_tick(window).await {
                    Tick::Stop => return None,
                    Tick::Exited(code) => return Some(Failure::Exited(code)),
                    Tick::Probe => {
                        if self.runtime.budget_used > 0 {
                            log::debug!(
                                "[{}] Up for {}s, restart budget refreshed",
                                self.spec.name,
                                STABLE_RUN_WINDOW.as_secs()
                            );
                        }
                        self.runtime.budget_used = 0;
                        window = None;
                    }
                }
            }
        };

        let launched_at = Instant::now();
        loop {
            match self.next_tick(Some(hc.interval)).await {
                Tick::Stop => return None,
                Tick::Exited(code) => return Some(Failure::Exited(code)),
                Tick::Probe => {}
            }

            let report = probe_once(self.probe.as_ref(), &hc.target, hc.timeout).await;
            let outcome = report.outcome.clone();
            log::debug!(
                "[{}] Probe {} took {}ms: {:?}",
                self.spec.name,
                hc.target,
                report.latency.as_millis(),
                outcome
            );
            self.runtime.last_probe = Some(report);

            match outcome {
                ProbeOutcome::Healthy => {
                    self.runtime.consecutive_failures = 0;
                    self.runtime.probe_errors = 0;
                    match self.runtime.state {
                        UnitState::WaitingHealthy => self.become_healthy("probe succeeded"),
                        UnitState::Degraded => self.become_healthy("probe recovered"),
                        _ => {}
                    }
                }
                ProbeOutcome::Unhealthy(reason) => {
                    self.runtime.probe_errors = 0;
                    if let Some(failure) = self.count_failure(&hc, reason, launched_at) {
                        return Some(failure);
                    }
                }
                ProbeOutcome::Error(e) => {
                    self.runtime.probe_errors += 1;
                    log::warn!(
                        "[{}] Probe error ({}/{}): {}",
                        self.spec.name,
                        self.runtime.probe_errors,
                        PROBE_ERROR_CAP,
                        e
                    );
                    if self.runtime.probe_errors >= PROBE_ERROR_CAP {
                        self.runtime.probe_errors = 0;
                        let reason = format!("probe kept erroring: {}", e);
                        if let Some(failure) = self.count_failure(&hc, reason, launched_at) {
                            return Some(failure);
                        }
                    }
                }
            }
        }
    }

    /// Charge one unhealthy probe; returns the failure once the budget is spent
    fn count_failure(
        &mut self,
        hc: &HealthCheck,
        reason: String,
        launched_at: Instant,
    ) -> Option<Failure> {
        if self.runtime.state == UnitState::WaitingHealthy && launched_at.elapsed() < hc.start_period
        {
            log::debug!(
                "[{}] Unhealthy during start period, not counted: {}",
                self.spec.name,
                reason
            );
            return None;
        }

        self.runtime.consecutive_failures += 1;
        let failures = self.runtime.consecutive_failures;
        log::warn!(
            "[{}] Probe failed ({}/{}): {}",
            self.spec.name,
            failures,
            hc.max_consecutive_failures,
            reason
        );

        if self.runtime.state == UnitState::Healthy {
            self.transition(UnitState::Degraded, reason.clone(), false);
        }

        if failures >= hc.max_consecutive_failures {
            return Some(Failure::Unhealthy(format!(
                "{} consecutive failed probes, last: {}",
                failures, reason
            )));
        }
        None
    }

    /// Wait for stop, process exit, or the next probe time
    async fn next_tick(&mut self, interval: Option<Duration>) -> Tick {
        let handle = self.runtime.handle.as_mut();
        tokio::select! {
            biased;
            _ = wait_stopped(&mut self.stop) => Tick::Stop,
            code = wait_exit(handle) => Tick::Exited(code),
            _ = sleep_or_forever(interval) => Tick::Probe,
        }
    }

    fn become_healthy(&mut self, reason: &str) {
        self.runtime.consecutive_failures = 0;
        self.runtime.budget_used = 0;
        self.transition(UnitState::Healthy, reason, false);
    }

    /// Enter `Failed`, then restart if the policy and budget allow
    async fn fail(&mut self, failure: Failure) -> Next {
        let policy = self.spec.restart.policy;
        let (reason, restartable) = match failure {
            Failure::Launch(reason) => (
                format!("launch failed: {}", reason),
                policy != RestartPolicy::Never,
            ),
            Failure::Unhealthy(reason) => (reason, policy != RestartPolicy::Never),
            Failure::Exited(code) => {
                let reason = match code {
                    Some(code) => format!("process exited with code {}", code),
                    None => "process terminated by signal".to_string(),
                };
                let restartable = match policy {
                    RestartPolicy::Never => false,
                    RestartPolicy::OnFailure => code != Some(0),
                    RestartPolicy::Always => true,
                };
                (reason, restartable)
            }
        };

        let max = self.spec.restart.max_retries;
        if !restartable {
            self.transition(UnitState::Failed, reason, true);
            return Next::Done;
        }
        if self.runtime.budget_used >= max {
            self.transition(
                UnitState::Failed,
                format!("{} (restart budget of {} exhausted)", reason, max),
                true,
            );
            return Next::Done;
        }

        self.transition(UnitState::Failed, reason, false);
        self.runtime.budget_used += 1;
        self.runtime.restarts += 1;
        let delay = self.spec.restart.backoff.delay(self.runtime.budget_used);
        self.transition(
            UnitState::Pending,
            format!(
                "restart {} of {} in {}ms",
                self.runtime.budget_used,
                max,
                delay.as_millis()
            ),
            false,
        );

        tokio::select! {
            biased;
            _ = wait_stopped(&mut self.stop) => {
                self.transition(UnitState::Stopped, "stop requested during restart backoff", true);
                Next::Done
            }
            _ = tokio::time::sleep(delay) => Next::Restart,
        }
    }

    /// Stop and drop the launched resource, if any
    async fn release(&mut self) {
        if let Some(mut handle) = self.runtime.handle.take() {
            if let Err(e) = handle.stop(self.spec.stop_timeout).await {
                log::error!("[{}] Error stopping unit: {}", self.spec.name, e);
            }
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    fn transition(&mut self, to: UnitState, reason: impl Into<String>, terminal: bool) {
        let from = self.runtime.state;
        let reason = reason.into();
        debug_assert!(
            from.can_transition_to(to),
            "[{}] invalid transition {} -> {}",
            self.spec.name,
            from,
            to
        );
        self.runtime.state = to;

        match (to, terminal) {
            (UnitState::Failed, true) => {
                log::error!("[{}] {} -> {}: {}", self.spec.name, from, to, reason)
            }
            (UnitState::Failed | UnitState::Degraded, _) => {
                log::warn!("[{}] {} -> {}: {}", self.spec.name, from, to, reason)
            }
            _ => log::info!("[{}] {} -> {}: {}", self.spec.name, from, to, reason),
        }

        // The orchestrator may already be gone during teardown
        let _ = self.events.send(StateTransition::new(
            self.spec.name.clone(),
            from,
            to,
            reason,
            terminal,
        ));
    }
}

/// Resolves once stop is requested or the stop sender is dropped
async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn wait_exit(handle: Option<&mut Box<dyn RunningUnit>>) -> Option<i32> {
    match handle {
        Some(handle) => handle.exited().await,
        None => std::future::pending().await,
    }
}

async fn sleep_or_forever(interval: Option<Duration>) {
    match interval {
        Some(interval) => tokio::time::sleep(interval).await,
        None => std::future::pending().await,
    }
}

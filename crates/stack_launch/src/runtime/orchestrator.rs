//! Stack orchestrator - gates unit starts on dependency health

use crate::runtime::dependency::{ConfigError, DependencyGraph};
use crate::runtime::launcher::UnitLauncher;
use crate::runtime::probe::HealthProbe;
use crate::runtime::state::{StackResult, StackState, StateTransition, UnitState};
use crate::runtime::supervisor::{SupervisorCommand, UnitSummary, UnitSupervisor};
use crate::runtime::unit::{RestartPolicy, UnitSpec};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Buffered transitions per [`Orchestrator::subscribe`] receiver
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
        }
    }
}

/// Drives a whole stack: one supervisor task per unit, started as soon as
/// the unit's dependencies allow it.
pub struct Orchestrator {
    graph: DependencyGraph,
    launcher: Arc<dyn UnitLauncher>,
    probe: Arc<dyn HealthProbe>,
    /// View assembled from transition events only
    state: StackState,
    /// Command channel per supervisor
    commands: HashMap<String, mpsc::UnboundedSender<SupervisorCommand>>,
    /// Pending units that were already told to start or give up
    dispatched: HashSet<String>,
    tasks: Vec<JoinHandle<UnitSummary>>,
    event_tx: mpsc::UnboundedSender<StateTransition>,
    event_rx: mpsc::UnboundedReceiver<StateTransition>,
    stop_tx: watch::Sender<bool>,
    sink: broadcast::Sender<StateTransition>,
    started: bool,
    stopping: bool,
}

impl Orchestrator {
    /// Validate the units and build the dependency graph. Nothing is launched.
    pub fn new(
        units: Vec<UnitSpec>,
        launcher: Arc<dyn UnitLauncher>,
        probe: Arc<dyn HealthProbe>,
        config: OrchestratorConfig,
    ) -> Result<Self, ConfigError> {
        let graph = DependencyGraph::build(units)?;
        let state = StackState::new(graph.start_order().map(|u| u.name.clone()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let (sink, _) = broadcast::channel(config.event_capacity.max(1));

        Ok(Self {
            graph,
            launcher,
            probe,
            state,
            commands: HashMap::new(),
            dispatched: HashSet::new(),
            tasks: Vec::new(),
            event_tx,
            event_rx,
            stop_tx,
            sink,
            started: false,
            stopping: false,
        })
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Current aggregated view of the stack
    pub fn state(&self) -> &StackState {
        &self.state
    }

    /// Receive every state transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.sink.subscribe()
    }

    /// Start the stack and wait until it is up, has failed, or shutdown is requested
    pub async fn run(&mut self, mut shutdown_rx: watch::Receiver<()>) -> StackResult {
        if !self.started {
            log::info!("Starting {} units...", self.graph.len());
            self.spawn_supervisors();
            self.started = true;
            self.schedule();
        }

        loop {
            if let Some(result) = self.state.result() {
                match &result {
                    StackResult::Up => log::info!("All {} units are healthy", self.graph.len()),
                    StackResult::Failed(units) => {
                        log::error!("Stack failed, failed units: {}", units.join(", "))
                    }
                    StackResult::Cancelled => {}
                }
                return result;
            }

            tokio::select! {
                _ = shutdown_requested(&mut shutdown_rx) => {
                    log::info!("Shutdown requested before the stack settled");
                    return StackResult::Cancelled;
                }
                Some(transition) = self.event_rx.recv() => self.observe(transition),
            }
        }
    }

    /// Keep supervising after `run` until shutdown is requested or every unit is terminal
    pub async fn wait(&mut self, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            if self.state.iter().all(|(_, s)| s.terminal) {
                log::info!("All units have terminated");
                break;
            }

            tokio::select! {
                _ = shutdown_requested(&mut shutdown_rx) => {
                    log::info!("Shutdown signal received");
                    break;
                }
                Some(transition) = self.event_rx.recv() => self.observe(transition),
            }
        }
    }

    /// Broadcast stop to every supervisor and wait for all of them to finish
    pub async fn shutdown(&mut self) -> StackState {
        log::info!("Shutting down all units...");
        self.stopping = true;
        let _ = self.stop_tx.send(true);

        let joined = futures::future::join_all(std::mem::take(&mut self.tasks));
        tokio::pin!(joined);

        let summaries = loop {
            tokio::select! {
                summaries = &mut joined => break summaries,
                Some(transition) = self.event_rx.recv() => self.observe(transition),
            }
        };

        while let Ok(transition) = self.event_rx.try_recv() {
            self.observe(transition);
        }

        for summary in summaries {
            match summary {
                Ok(summary) => match &summary.last_probe {
                    Some(probe) => log::debug!(
                        "[{}] Supervisor finished in {} after {} launches, last probe {:?} ({}ms)",
                        summary.name,
                        summary.state,
                        summary.launches,
                        probe.outcome,
                        probe.latency.as_millis()
                    ),
                    None => log::debug!(
                        "[{}] Supervisor finished in {} after {} launches",
                        summary.name,
                        summary.state,
                        summary.launches
                    ),
                },
                Err(e) => log::error!("Supervisor task failed: {}", e),
            }
        }

        log::info!("All units shut down");
        self.state.clone()
    }

    fn spawn_supervisors(&mut self) {
        for unit in self.graph.start_order() {
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let supervisor = UnitSupervisor::new(
                unit.clone(),
                self.launcher.clone(),
                self.probe.clone(),
                self.event_tx.clone(),
                command_rx,
                self.stop_tx.subscribe(),
            );
            self.commands.insert(unit.name.clone(), command_tx);
            self.tasks.push(tokio::spawn(supervisor.run()));
        }
    }

    /// Fold a transition into the view, publish it, and unlock dependents
    fn observe(&mut self, transition: StateTransition) {
        if transition.to == UnitState::Starting {
            self.dispatched.remove(&transition.unit);
        }
        self.state.apply(&transition);

        let unit = transition.unit.clone();
        // No subscribers is fine
        let _ = self.sink.send(transition);

        if !self.stopping {
            log::debug!(
                "[{}] Re-evaluating {} dependents",
                unit,
                self.graph.dependents_of(&unit).len()
            );
            self.schedule();
        }
    }

    /// Start every pending unit whose dependencies are satisfied, and give up
    /// on those whose required dependencies can no longer become healthy
    fn schedule(&mut self) {
        for unit in self.graph.start_order() {
            let Some(status) = self.state.get(&unit.name) else {
                continue;
            };
            if status.state != UnitState::Pending
                || status.terminal
                || self.dispatched.contains(&unit.name)
            {
                continue;
            }

            let command = if let Some(dep) = self.state.blocking_dependency(&unit.dependencies) {
                let dep_state = self
                    .state
                    .state_of(&dep.name)
                    .unwrap_or(UnitState::Failed);
                SupervisorCommand::Abandon {
                    reason: format!("required dependency '{}' is {}", dep.name, dep_state),
                }
            } else if self.state.is_ready(&unit.dependencies) {
                SupervisorCommand::Start
            } else {
                continue;
            };

            if let Some(tx) = self.commands.get(&unit.name) {
                if tx.send(command).is_ok() {
                    self.dispatched.insert(unit.name.clone());
                }
            }
        }
    }
}

/// Resolves when a shutdown is signalled; never if the sender is gone
async fn shutdown_requested(rx: &mut watch::Receiver<()>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Start plan for dry-run mode
#[derive(Debug)]
pub struct StackPlan {
    /// Units in start order
    pub units: Vec<StackPlanUnit>,
}

/// A unit in the start plan
#[derive(Debug)]
pub struct StackPlanUnit {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub hard_dependencies: Vec<String>,
    pub soft_dependencies: Vec<String>,
    pub health_check: Option<String>,
    pub restart: String,
}

impl StackPlan {
    pub fn from_graph(graph: &DependencyGraph) -> Self {
        let units = graph
            .start_order()
            .map(|unit| Self::plan_unit(unit))
            .collect();
        Self { units }
    }

    fn plan_unit(unit: &UnitSpec) -> StackPlanUnit {
        let (hard, soft): (Vec<_>, Vec<_>) = unit.dependencies.iter().partition(|d| d.required);

        let health_check = unit.health_check.as_ref().map(|hc| {
            format!(
                "{} every {}ms, timeout {}ms, {} retries",
                hc.target,
                hc.interval.as_millis(),
                hc.timeout.as_millis(),
                hc.max_consecutive_failures
            )
        });

        let restart = match unit.restart.policy {
            RestartPolicy::Never => "never".to_string(),
            policy => format!(
                "{} (max {} restarts)",
                if policy == RestartPolicy::Always {
                    "always"
                } else {
                    "on-failure"
                },
                unit.restart.max_retries
            ),
        };

        StackPlanUnit {
            name: unit.name.clone(),
            command: unit.launch.command.clone(),
            args: unit.launch.args.clone(),
            hard_dependencies: hard.into_iter().map(|d| d.name.clone()).collect(),
            soft_dependencies: soft.into_iter().map(|d| d.name.clone()).collect(),
            health_check,
            restart,
        }
    }
}

/// Display the start plan in a human-readable format
impl fmt::Display for StackPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stack Plan")?;
        writeln!(f, "==========")?;
        writeln!(f)?;
        writeln!(f, "Units (in start order):")?;

        for (i, unit) in self.units.iter().enumerate() {
            writeln!(f)?;
            writeln!(f, "  {}. {}", i + 1, unit.name)?;
            writeln!(f, "     Command: {} {}", unit.command, unit.args.join(" "))?;

            if !unit.hard_dependencies.is_empty() {
                writeln!(f, "     Requires: {}", unit.hard_dependencies.join(", "))?;
            }
            if !unit.soft_dependencies.is_empty() {
                writeln!(f, "     After: {}", unit.soft_dependencies.join(", "))?;
            }

            match &unit.health_check {
                Some(hc) => writeln!(f, "     Health check: {}", hc)?,
                None => writeln!(f, "     Health check: none (healthy once started)")?,
            }
            writeln!(f, "     Restart: {}", unit.restart)?;
        }

        Ok(())
    }
}

//! Unit lifecycle states, transition events and the aggregated stack view

use crate::runtime::unit::Dependency;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// Lifecycle state of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Waiting for dependencies (or for a restart)
    #[default]
    Pending,
    /// Launch in progress
    Starting,
    /// Launched, no successful probe yet
    WaitingHealthy,
    /// Last probe succeeded
    Healthy,
    /// Was healthy, a later probe failed
    Degraded,
    /// Failed; terminal unless a restart follows
    Failed,
    /// Stopped on request
    Stopped,
}

impl UnitState {
    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Pending, Starting | Failed | Stopped)
                | (Starting, WaitingHealthy | Failed | Stopped)
                | (WaitingHealthy, Healthy | Failed | Stopped)
                | (Healthy, Degraded | Failed | Stopped)
                | (Degraded, Healthy | Failed | Stopped)
                | (Failed, Pending)
        )
    }

    /// States in which the unit owns a launched resource
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            UnitState::WaitingHealthy | UnitState::Healthy | UnitState::Degraded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::Starting => "starting",
            UnitState::WaitingHealthy => "waiting_healthy",
            UnitState::Healthy => "healthy",
            UnitState::Degraded => "degraded",
            UnitState::Failed => "failed",
            UnitState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one state change, emitted by a supervisor
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub unit: String,
    pub from: UnitState,
    pub to: UnitState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    /// No further automatic transition will follow this one
    pub terminal: bool,
}

impl StateTransition {
    pub fn new(
        unit: impl Into<String>,
        from: UnitState,
        to: UnitState,
        reason: impl Into<String>,
        terminal: bool,
    ) -> Self {
        Self {
            unit: unit.into(),
            from,
            to,
            timestamp: Utc::now(),
            reason: reason.into(),
            terminal,
        }
    }
}

/// Last known status of a unit, as seen through its transitions
#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub state: UnitState,
    pub terminal: bool,
    pub since: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub restarts: u32,
}

impl Default for UnitStatus {
    fn default() -> Self {
        Self {
            state: UnitState::Pending,
            terminal: false,
            since: None,
            reason: None,
            restarts: 0,
        }
    }
}

/// Aggregate view of every unit, built only from transition events
#[derive(Debug, Clone, Default, Serialize)]
pub struct StackState {
    units: IndexMap<String, UnitStatus>,
}

impl StackState {
    /// All units `Pending`, kept in the given (start) order
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            units: names
                .into_iter()
                .map(|n| (n.into(), UnitStatus::default()))
                .collect(),
        }
    }

    /// Fold one transition into the view
    pub fn apply(&mut self, transition: &StateTransition) {
        let status = self.units.entry(transition.unit.clone()).or_default();
        if transition.from == UnitState::Failed && transition.to == UnitState::Pending {
            status.restarts += 1;
        }
        status.state = transition.to;
        status.terminal = transition.terminal;
        status.since = Some(transition.timestamp);
        status.reason = Some(transition.reason.clone());
    }

    pub fn get(&self, unit: &str) -> Option<&UnitStatus> {
        self.units.get(unit)
    }

    pub fn state_of(&self, unit: &str) -> Option<UnitState> {
        self.units.get(unit).map(|s| s.state)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &UnitStatus)> {
        self.units.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether `unit` reached a terminal state (stopped, or failed past its restart budget)
    pub fn is_terminal(&self, unit: &str) -> bool {
        self.units.get(unit).is_some_and(|s| s.terminal)
    }

    /// Every unit is `Healthy`
    pub fn is_up(&self) -> bool {
        self.units.values().all(|s| s.state == UnitState::Healthy)
    }

    /// Every unit is either `Healthy` or terminal
    pub fn is_settled(&self) -> bool {
        self.units
            .values()
            .all(|s| s.state == UnitState::Healthy || s.terminal)
    }

    /// Units that failed terminally, in start order
    pub fn failed_units(&self) -> Vec<String> {
        self.units
            .iter()
            .filter(|(_, s)| s.state == UnitState::Failed && s.terminal)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether a single dependency edge is satisfied.
    ///
    /// Hard: the dependency is `Healthy`. Soft: `Healthy` or terminal.
    pub fn dependency_satisfied(&self, dependency: &Dependency) -> bool {
        match self.units.get(&dependency.name) {
            Some(status) if status.state == UnitState::Healthy => true,
            Some(status) => !dependency.required && status.terminal,
            None => false,
        }
    }

    /// Readiness predicate over all dependencies of a unit
    pub fn is_ready(&self, dependencies: &[Dependency]) -> bool {
        dependencies.iter().all(|d| self.dependency_satisfied(d))
    }

    /// First hard dependency that can never become healthy again
    pub fn blocking_dependency<'a>(&self, dependencies: &'a [Dependency]) -> Option<&'a Dependency> {
        dependencies
            .iter()
            .find(|d| d.required && self.is_terminal(&d.name))
    }

    /// Final result once the stack has settled
    pub fn result(&self) -> Option<StackResult> {
        if self.is_up() {
            return Some(StackResult::Up);
        }
        if self.is_settled() {
            return Some(StackResult::Failed(self.failed_units()));
        }
        None
    }
}

/// Outcome of [`crate::runtime::Orchestrator::run`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StackResult {
    /// Every unit reached `Healthy`
    Up,
    /// Units that failed terminally, in start order
    Failed(Vec<String>),
    /// Shutdown was requested before the stack settled
    Cancelled,
}

impl StackResult {
    pub fn is_up(&self) -> bool {
        matches!(self, StackResult::Up)
    }
}

impl fmt::Display for StackResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackResult::Up => write!(f, "up"),
            StackResult::Failed(units) => write!(f, "failed ({})", units.join(", ")),
            StackResult::Cancelled => write!(f, "cancelled"),
        }
    }
}

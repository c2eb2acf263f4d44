//! Dependency graph construction and topological ordering

use crate::config::InterpolationError;
use crate::runtime::unit::{Dependency, UnitSpec};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Validated dependency graph over the units of a stack.
///
/// Built once at load time and read-only afterwards.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Units in start order (every unit after all of its dependencies)
    units: Vec<Arc<UnitSpec>>,
    /// Map from unit name to index in `units`
    index_map: HashMap<String, usize>,
    /// Reverse edges: unit name to the units that depend on it
    dependents: HashMap<String, Vec<String>>,
}

/// DFS visit marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    /// Build and validate the graph.
    ///
    /// Fails without returning a partial graph if any unit is malformed,
    /// names an unknown dependency or itself, or if a cycle exists.
    pub fn build(units: impl IntoIterator<Item = UnitSpec>) -> Result<Self, ConfigError> {
        let mut by_name: HashMap<String, Arc<UnitSpec>> = HashMap::new();
        let mut declared: Vec<String> = Vec::new();

        for unit in units {
            unit.validate()?;
            if by_name.contains_key(&unit.name) {
                return Err(ConfigError::DuplicateUnit(unit.name.clone()));
            }
            declared.push(unit.name.clone());
            by_name.insert(unit.name.clone(), Arc::new(unit));
        }

        for name in &declared {
            let unit = &by_name[name];
            for dep in &unit.dependencies {
                if dep.name == unit.name {
                    return Err(ConfigError::SelfDependency(unit.name.clone()));
                }
                if !by_name.contains_key(&dep.name) {
                    return Err(ConfigError::UnknownDependency {
                        unit: unit.name.clone(),
                        dependency: dep.name.clone(),
                    });
                }
            }
        }

        let order = Self::topological_sort(&declared, &by_name)?;

        let mut dependents: HashMap<String, Vec<String>> = declared
            .iter()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        for name in &order {
            for dep in &by_name[name].dependencies {
                if let Some(list) = dependents.get_mut(&dep.name) {
                    list.push(name.clone());
                }
            }
        }

        let units: Vec<Arc<UnitSpec>> = order.iter().map(|name| by_name[name].clone()).collect();
        let index_map = order
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i))
            .collect();

        Ok(Self {
            units,
            index_map,
            dependents,
        })
    }

    /// Depth-first post-order with three-color marking
    fn topological_sort(
        declared: &[String],
        units: &HashMap<String, Arc<UnitSpec>>,
    ) -> Result<Vec<String>, ConfigError> {
        let mut colors: HashMap<&str, Color> =
            declared.iter().map(|n| (n.as_str(), Color::White)).collect();
        let mut path: Vec<&str> = Vec::new();
        let mut order: Vec<String> = Vec::with_capacity(declared.len());

        for name in declared {
            if colors[name.as_str()] == Color::White {
                Self::visit(name, units, &mut colors, &mut path, &mut order)?;
            }
        }

        Ok(order)
    }

    fn visit<'a>(
        name: &'a str,
        units: &'a HashMap<String, Arc<UnitSpec>>,
        colors: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), ConfigError> {
        colors.insert(name, Color::Gray);
        path.push(name);

        for dep in &units[name].dependencies {
            match colors[dep.name.as_str()] {
                Color::White => Self::visit(&dep.name, units, colors, path, order)?,
                Color::Gray => {
                    // Back edge: the cycle is the path suffix starting at `dep`
                    let start = path.iter().position(|n| *n == dep.name).unwrap_or(0);
                    let cycle = path[start..].iter().map(|n| n.to_string()).collect();
                    return Err(ConfigError::CycleDetected(cycle));
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors.insert(name, Color::Black);
        order.push(name.to_string());
        Ok(())
    }

    /// True iff every dependency of `unit` is in `completed`
    pub fn ready(&self, unit: &str, completed: &HashSet<String>) -> bool {
        self.dependencies(unit)
            .iter()
            .all(|dep| completed.contains(&dep.name))
    }

    /// Units that declare a dependency on `unit`, in start order
    pub fn dependents_of(&self, unit: &str) -> &[String] {
        self.dependents.get(unit).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Declared dependencies of `unit`
    pub fn dependencies(&self, unit: &str) -> &[Dependency] {
        self.unit(unit)
            .map(|u| u.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Look up a unit by name
    pub fn unit(&self, name: &str) -> Option<&Arc<UnitSpec>> {
        self.index_map.get(name).map(|&i| &self.units[i])
    }

    /// Position of `name` in the start order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index_map.get(name).copied()
    }

    /// Units in start order
    pub fn start_order(&self) -> impl Iterator<Item = &Arc<UnitSpec>> {
        self.units.iter()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::new(),
    }
}

/// Fatal configuration errors, surfaced before anything is launched
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cyclic dependency detected: {}", format_cycle(.0))]
    CycleDetected(Vec<String>),

    #[error("Unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },

    #[error("Unit '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Unit '{unit}' depends on disabled unit '{dependency}'")]
    DisabledDependency { unit: String, dependency: String },

    #[error("Duplicate unit name '{0}'")]
    DuplicateUnit(String),

    #[error("Invalid unit '{unit}': {reason}")]
    InvalidUnit { unit: String, reason: String },

    #[error("Interpolation failed in {context}: {source}")]
    Interpolation {
        context: String,
        #[source]
        source: InterpolationError,
    },
}

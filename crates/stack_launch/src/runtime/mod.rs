//! Runtime components: graph, probes, launch, supervision and orchestration

pub mod dependency;
pub mod launcher;
pub mod orchestrator;
pub mod probe;
pub mod state;
pub mod supervisor;
pub mod unit;

pub use dependency::*;
pub use launcher::*;
pub use orchestrator::*;
pub use probe::*;
pub use state::*;
pub use supervisor::*;
pub use unit::*;

//! Stack file configuration parsing and interpolation

mod interpolation;
mod stack_file;

pub use interpolation::*;
pub use stack_file::*;

//! # sr-optimizer
//!
//! Parameter variation and optimization support for Simrun.
//!
//! Provides range expansion and the Cartesian variation grid, the resolver
//! that splits a sample into fixed and varied parameters and materializes
//! input containers, and the bounded minimizers used by optimization runs.

mod grid;
mod resolver;
pub mod solver;

pub use grid::{expand, expand_variable, VariationGrid, MAX_GRID_ROWS};
pub use resolver::{resolve_samples, SampleVariation, VariationResolver};
pub use solver::{
    minimize, minimizer_for, Bounds, MinimizeOptions, MinimizeOutcome, Minimizer, ObjectiveError,
};

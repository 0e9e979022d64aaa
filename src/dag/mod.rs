//! Dependency graph construction and validation for phase templates.

pub mod builder;

pub use builder::{DagBuilder, PhaseGraph, PhaseIndex};

//! Active-learning elastic-band search for minimum-energy transition paths.
//!
//! A cheap surrogate is refined on reference (energy, force) data until a path relaxed
//! entirely under the surrogate agrees with the reference evaluator on validated images.

pub mod analysis;
pub mod core;
pub mod engine;
pub mod interface;
pub mod solvers;

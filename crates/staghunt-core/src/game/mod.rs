//! The stag-hunt game on top of the inference engine.
//!
//! - **grid**: cells and one-step reachability
//! - **config**: model parameters and scenario snapshots
//! - **potentials**: explicit and matrix potential builders
//! - **model**: the orchestrator driving build, inference and moves

pub mod config;
pub mod grid;
pub mod model;
pub mod potentials;

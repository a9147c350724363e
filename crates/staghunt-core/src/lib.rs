//! # Stag Hunt Core
//!
//! Belief propagation over the pairwise MRF of a multi-agent stag hunt on a
//! grid: potential construction, a factor graph container, three
//! interchangeable BP backends and the model orchestrator that turns beliefs
//! into moves.

#![deny(unsafe_code)]

pub mod engine;
pub mod game;

// Re-export commonly used types
pub use engine::belief_propagation::{
    BeliefPropagationConfig, BeliefPropagationDiagnostics, Beliefs, InferenceBackend, RunStatus,
};
pub use engine::errors::ExecError;
pub use engine::explicit::ExplicitBackend;
pub use engine::factor_graph::FactorGraph;
#[cfg(feature = "autodiff")]
pub use engine::tensor::TensorBackend;
pub use engine::variables::{VarKind, Variable};
pub use engine::vectorized::VectorizedBackend;
pub use game::config::{GameConfig, ModelParams};
pub use game::grid::{Grid, Position};
pub use game::model::{ModelKind, ModelPhase, StagHuntModel, TieBreak};
pub use game::potentials::{ExplicitPotentials, MatrixPotentials, PotentialBuilder};

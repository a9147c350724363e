//! Inference engine for pairwise Markov random fields.
//!
//! This module provides:
//! - **errors**: error type shared by every layer
//! - **variables**: variable identities and canonical edge orientation
//! - **factor_graph**: the MRF container with stacked potential views
//! - **belief_propagation**: the BP contract, diagnostics and belief store
//! - **explicit**, **vectorized**, **tensor**: the three backends
//! - **numeric_kernels**: log-space kernels shared by the backends

pub mod belief_propagation;
pub mod errors;
pub mod explicit;
pub mod factor_graph;
pub mod numeric_kernels;
#[cfg(feature = "autodiff")]
pub mod tensor;
pub mod variables;
pub mod vectorized;

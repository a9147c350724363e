//! Differentiable tensor backend on `candle-core`.
//!
//! Same stacked layout as the vectorized backend (unaries `(V, D)`, directed
//! potentials `(2E, D, D)`, messages `(2E, D)`), expressed as candle ops so
//! that every round is recorded when gradients are requested. Beliefs sum a
//! padded table of incoming slots gathered with `index_select`; exclusions
//! select each slot's reverse the same way.
//!
//! Without [`TensorBackend::with_gradients`] the unary is a plain tensor and
//! no graph of ops is retained across rounds.

use std::fmt;

use candle_core::{DType, Device, Tensor, Var};
use ndarray::Array2;

use crate::engine::belief_propagation::{
    run_sweeps, BeliefPropagationConfig, BeliefPropagationDiagnostics, Beliefs, GraphFingerprint,
    InferenceBackend, MessageSweep,
};
use crate::engine::errors::ExecError;
use crate::engine::factor_graph::FactorGraph;
use crate::engine::vectorized::beliefs_from_stacked;

/// `log(sum(exp(t)))` along `dim`, `-inf` for all-impossible lanes.
fn log_sum_exp(t: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
    let max = t.max_keepdim(dim)?;
    let shift = max.ge(f64::MIN)?.where_cond(&max, &max.zeros_like()?)?;
    let sum = t.broadcast_sub(&shift)?.exp()?.sum_keepdim(dim)?;
    sum.log()?.add(&shift)?.squeeze(dim)
}

/// Replaces NaN entries (from `-inf - -inf`) with `-inf`.
fn nan_to_neg_inf(t: &Tensor) -> candle_core::Result<Tensor> {
    let neg_inf = Tensor::full(f64::NEG_INFINITY, t.dims(), t.device())?;
    t.eq(t)?.where_cond(t, &neg_inf)
}

fn to_array2(t: &Tensor) -> Result<Array2<f64>, ExecError> {
    let (rows, cols) = t.dims2()?;
    let data = t.flatten_all()?.to_vec1::<f64>()?;
    Array2::from_shape_vec((rows, cols), data).map_err(|e| ExecError::Tensor(e.to_string()))
}

fn from_ndarray<D: ndarray::Dimension>(
    array: &ndarray::Array<f64, D>,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let data: Vec<f64> = array.iter().copied().collect();
    Tensor::from_vec(data, array.shape(), device)
}

struct TensorState {
    fingerprint: GraphFingerprint,
    num_edges: usize,
    num_variables: usize,
    max_degree: usize,
    /// `(V * max_degree)` slot ids per variable, padded with `2E`.
    incoming: Tensor,
    padding_row: Tensor,
    unary: Tensor,
    unary_var: Option<Var>,
    directed_potentials: Tensor,
    src: Tensor,
    reverse: Tensor,
    messages: Tensor,
}

impl TensorState {
    fn new(graph: &FactorGraph, device: &Device, track_gradients: bool) -> Result<Self, ExecError> {
        let edges = graph.num_edges();
        let d = graph.max_domain();
        let var_index = graph.var_index();

        let unary = from_ndarray(&graph.unary_matrix().t().to_owned(), device)?;
        let (unary, unary_var) = if track_gradients {
            let var = Var::from_tensor(&unary)?;
            (var.as_tensor().clone(), Some(var))
        } else {
            (unary, None)
        };

        let potentials = from_ndarray(graph.edge_tensor(), device)?;
        let directed_potentials = if edges == 0 {
            Tensor::zeros((0, d, d), DType::F64, device)?
        } else {
            let forward = potentials.permute((2, 0, 1))?;
            let reverse = potentials.permute((2, 1, 0))?;
            Tensor::cat(&[&forward, &reverse], 0)?.contiguous()?
        };

        let mut src = Vec::with_capacity(2 * edges);
        let mut dst = Vec::with_capacity(2 * edges);
        for (a, b) in graph.edges() {
            src.push(var_index[a] as u32);
            dst.push(var_index[b] as u32);
        }
        for (a, b) in graph.edges() {
            src.push(var_index[b] as u32);
            dst.push(var_index[a] as u32);
        }
        let reverse: Vec<u32> = (0..2 * edges)
            .map(|k| ((k + edges) % (2 * edges)) as u32)
            .collect();

        let mut slots = vec![Vec::new(); graph.num_variables()];
        for (k, &target) in dst.iter().enumerate() {
            slots[target as usize].push(k as u32);
        }
        let max_degree = slots.iter().map(Vec::len).max().unwrap_or(0);
        let incoming: Vec<u32> = slots
            .iter()
            .flat_map(|list| {
                list.iter()
                    .copied()
                    .chain(std::iter::repeat((2 * edges) as u32))
                    .take(max_degree)
            })
            .collect();

        let domains = graph.domains();
        let mut initial = Array2::from_elem((2 * edges, d), graph.min());
        for (k, &target) in dst.iter().enumerate() {
            let size = domains[target as usize];
            for y in 0..size {
                initial[[k, y]] = -(size as f64).ln();
            }
        }

        Ok(Self {
            fingerprint: GraphFingerprint::of(graph),
            num_edges: edges,
            num_variables: graph.num_variables(),
            max_degree,
            incoming: Tensor::from_vec(incoming, graph.num_variables() * max_degree, device)?,
            padding_row: Tensor::zeros((1, d), DType::F64, device)?,
            unary,
            unary_var,
            directed_potentials,
            src: Tensor::from_vec(src, 2 * edges, device)?,
            reverse: Tensor::from_vec(reverse, 2 * edges, device)?,
            messages: from_ndarray(&initial, device)?,
        })
    }

    fn log_beliefs(&self) -> candle_core::Result<Tensor> {
        if self.max_degree == 0 {
            return Ok(self.unary.clone());
        }
        let (_, d) = self.messages.dims2()?;
        let padded = Tensor::cat(&[&self.messages, &self.padding_row], 0)?;
        let incoming = padded
            .index_select(&self.incoming, 0)?
            .reshape((self.num_variables, self.max_degree, d))?
            .sum(1)?;
        self.unary.add(&incoming)
    }

    fn excluded(&self, beliefs: &Tensor) -> candle_core::Result<Tensor> {
        let source = beliefs.index_select(&self.src, 0)?;
        let reverse = self.messages.index_select(&self.reverse, 0)?;
        nan_to_neg_inf(&source.sub(&reverse)?)
    }
}

impl MessageSweep for TensorState {
    fn sweep(&mut self, _graph: &FactorGraph, damping: f64) -> Result<f64, ExecError> {
        let beliefs = self.log_beliefs()?;
        let excluded = self.excluded(&beliefs)?;

        let terms = self
            .directed_potentials
            .broadcast_add(&excluded.unsqueeze(2)?)?;
        let fresh = log_sum_exp(&terms, 1)?;
        let norms = log_sum_exp(&fresh, 1)?.unsqueeze(1)?;
        let finite = norms.ge(f64::MIN)?;
        let shift = finite.where_cond(&norms, &norms.zeros_like()?)?;
        let mut fresh = fresh.broadcast_sub(&shift)?;

        if damping > 0.0 {
            let mixed = self
                .messages
                .exp()?
                .affine(damping, 0.0)?
                .add(&fresh.exp()?.affine(1.0 - damping, 0.0)?)?;
            fresh = mixed.log()?;
        }

        let max_delta = fresh
            .exp()?
            .sub(&self.messages.exp()?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f64>()?;
        self.messages = fresh;
        Ok(max_delta)
    }
}

/// Loopy BP expressed as tensor ops, optionally differentiable with respect
/// to the unary potentials.
pub struct TensorBackend {
    device: Device,
    track_gradients: bool,
    state: Option<TensorState>,
}

impl fmt::Debug for TensorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorBackend")
            .field("device", &self.device)
            .field("track_gradients", &self.track_gradients)
            .finish_non_exhaustive()
    }
}

impl Default for TensorBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorBackend {
    /// CPU backend without gradient tracking.
    pub fn new() -> Self {
        Self {
            device: Device::Cpu,
            track_gradients: false,
            state: None,
        }
    }

    /// Records the ops of every round so that the log beliefs can be
    /// differentiated with respect to the unary matrix.
    pub fn with_gradients(mut self) -> Self {
        self.track_gradients = true;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The `(V, D)` unary of the last run, when gradients are tracked.
    pub fn unary_var(&self) -> Option<&Var> {
        self.state.as_ref().and_then(|s| s.unary_var.as_ref())
    }

    /// Directed potentials `(2E, D, D)` of the last run.
    pub fn directed_potentials(&self) -> Option<&Tensor> {
        self.state.as_ref().map(|s| &s.directed_potentials)
    }

    /// Messages `(2E, D)` of the last run.
    pub fn messages(&self) -> Option<&Tensor> {
        self.state.as_ref().map(|s| &s.messages)
    }

    /// Unnormalized log beliefs `(V, D)` of the last run.
    pub fn log_beliefs(&self) -> Result<Tensor, ExecError> {
        let state = self.state()?;
        Ok(state.log_beliefs()?)
    }

    fn state(&self) -> Result<&TensorState, ExecError> {
        self.state
            .as_ref()
            .ok_or_else(|| ExecError::InvalidState("tensor backend has not been run".into()))
    }
}

impl InferenceBackend for TensorBackend {
    fn name(&self) -> &'static str {
        "tensor"
    }

    fn infer(
        &mut self,
        graph: &FactorGraph,
        config: &BeliefPropagationConfig,
    ) -> Result<BeliefPropagationDiagnostics, ExecError> {
        let mut state = TensorState::new(graph, &self.device, self.track_gradients)?;
        let diagnostics = run_sweeps(&mut state, graph, config, self.name())?;
        self.state = Some(state);
        Ok(diagnostics)
    }

    fn compute_probabilities(&self, graph: &FactorGraph) -> Result<Beliefs, ExecError> {
        let state = self.state()?;
        state.fingerprint.check(graph)?;
        let log_beliefs = state.log_beliefs()?;
        let excluded = if state.num_edges == 0 {
            Array2::zeros((0, graph.max_domain()))
        } else {
            to_array2(&state.excluded(&log_beliefs)?)?
        };
        Ok(beliefs_from_stacked(
            graph,
            &to_array2(&log_beliefs)?,
            &excluded,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::numeric_kernels::{DEFAULT_ATOL, DEFAULT_RTOL};
    use crate::engine::variables::Variable;
    use crate::engine::vectorized::VectorizedBackend;
    use ndarray::{array, Array1};

    fn chain(min: f64) -> FactorGraph {
        let a = Variable::position(1, 0);
        let b = Variable::position(2, 0);
        let c = Variable::capture(2, 0, 1);
        let mut graph = FactorGraph::new(min);
        graph.add_variables([a, b], 2).unwrap();
        graph.add_variable(c, 3).unwrap();
        graph.set_unary(a, array![0.4, -0.1]).unwrap();
        graph.set_unary(c, array![0.0, 0.7, min]).unwrap();
        graph.set_edge(a, b, array![[0.0, min], [0.3, 0.0]]).unwrap();
        graph
            .set_edge(b, c, array![[0.0, 0.0, min], [0.0, min, 0.2]])
            .unwrap();
        graph
    }

    #[test]
    fn log_sum_exp_handles_impossible_lanes() {
        let t = Tensor::new(
            &[[0.0_f64, 0.0], [f64::NEG_INFINITY, f64::NEG_INFINITY]],
            &Device::Cpu,
        )
        .unwrap();
        let out = log_sum_exp(&t, 1).unwrap().to_vec1::<f64>().unwrap();
        assert!((out[0] - 2.0_f64.ln()).abs() < 1e-12);
        assert_eq!(out[1], f64::NEG_INFINITY);
    }

    #[test]
    fn stacked_potentials_match_graph_exactly() {
        let graph = chain(f64::NEG_INFINITY);
        let mut backend = TensorBackend::new();
        backend
            .infer(&graph, &BeliefPropagationConfig::default())
            .unwrap();
        let directed = backend.directed_potentials().unwrap();
        let values = directed.to_vec3::<f64>().unwrap();
        let tensor = graph.edge_tensor();
        let edges = graph.num_edges();
        for e in 0..edges {
            for x in 0..graph.max_domain() {
                for y in 0..graph.max_domain() {
                    assert_eq!(values[e][x][y], tensor[[x, y, e]]);
                    assert_eq!(values[edges + e][y][x], tensor[[x, y, e]]);
                }
            }
        }
    }

    #[test]
    fn matches_vectorized_backend() {
        for min in [f64::NEG_INFINITY, -1e9] {
            let graph = chain(min);
            let config = BeliefPropagationConfig::default();
            let mut vectorized = VectorizedBackend::new();
            vectorized.infer(&graph, &config).unwrap();
            let mut tensor = TensorBackend::new();
            let diagnostics = tensor.infer(&graph, &config).unwrap();
            assert!(diagnostics.converged);

            let lhs = vectorized.compute_probabilities(&graph).unwrap();
            let rhs = tensor.compute_probabilities(&graph).unwrap();
            assert!(lhs.allclose(&rhs, DEFAULT_RTOL, DEFAULT_ATOL));
            assert!(rhs.allclose(&lhs, DEFAULT_RTOL, DEFAULT_ATOL));
        }
    }

    #[test]
    fn gradient_of_own_belief_is_indicator() {
        let a = Variable::position(1, 0);
        let b = Variable::position(2, 0);
        let mut graph = FactorGraph::new(-1e9);
        graph.add_variables([a, b], 2).unwrap();
        graph.set_unary(a, array![0.1, -0.3]).unwrap();
        graph.set_unary(b, array![0.5, 0.0]).unwrap();
        graph.set_edge(a, b, array![[0.2, -0.1], [0.0, 0.4]]).unwrap();

        let mut backend = TensorBackend::new().with_gradients();
        backend
            .infer(&graph, &BeliefPropagationConfig::default())
            .unwrap();
        let beliefs = backend.log_beliefs().unwrap();
        let loss = beliefs.get(0).unwrap().get(0).unwrap();
        let grads = loss.backward().unwrap();
        let var = backend.unary_var().unwrap();
        let grad = grads.get(var.as_tensor()).unwrap();
        let grad = grad.to_vec2::<f64>().unwrap();

        assert!((grad[0][0] - 1.0).abs() < 1e-9);
        assert!(grad[0][1].abs() < 1e-9);
        assert!(grad[1].iter().all(|g| g.is_finite()));
        assert!(grad[1].iter().any(|g| g.abs() > 1e-6));
    }

    #[test]
    fn isolated_graph_returns_unary_marginals() {
        let a = Variable::position(1, 0);
        let mut graph = FactorGraph::new(f64::NEG_INFINITY);
        graph.add_variable(a, 2).unwrap();
        graph.set_unary(a, Array1::from(vec![0.0, 0.0])).unwrap();
        let mut backend = TensorBackend::new();
        backend
            .infer(&graph, &BeliefPropagationConfig::default())
            .unwrap();
        let beliefs = backend.compute_probabilities(&graph).unwrap();
        assert_eq!(beliefs.marginal(a).unwrap().to_vec(), vec![0.5, 0.5]);
    }
}

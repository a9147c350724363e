//! Vectorized backend over the stacked potentials.
//!
//! Works on the padded views of the factor graph: unaries `(V, D)`, directed
//! edge potentials `(2E, D, D)` and messages `(2E, D)`. Slot `k < E` carries
//! the message along edge `k` in its canonical direction, slot `E + k` the
//! reverse one. A round is:
//!
//! 1. accumulate beliefs `(V, D)` from the unaries and all incoming messages,
//! 2. exclude each message's reverse by subtraction (`-inf - -inf` is
//!    treated as `-inf`),
//! 3. broadcast against the directed potentials and reduce with
//!    log-sum-exp over the source axis,
//! 4. normalize every row.

use ndarray::{s, Array1, Array2, Array3, ArrayView2, Axis, Zip};

use crate::engine::belief_propagation::{
    run_sweeps, BeliefPropagationConfig, BeliefPropagationDiagnostics, Beliefs, GraphFingerprint,
    InferenceBackend, MessageSweep,
};
use crate::engine::errors::ExecError;
use crate::engine::factor_graph::FactorGraph;
use crate::engine::numeric_kernels::{
    damp_log, log_sum_exp_axis, nan_to_neg_inf, probabilities_from_log, probability_delta,
};

#[derive(Debug, Clone)]
struct VectorizedState {
    fingerprint: GraphFingerprint,
    /// Source variable index of every directed slot.
    src: Vec<usize>,
    /// Target variable index of every directed slot.
    dst: Vec<usize>,
    /// `(2E, D, D)`: potential from the source (axis 1) to the target (axis 2).
    directed_potentials: Array3<f64>,
    messages: Array2<f64>,
}

impl VectorizedState {
    fn new(graph: &FactorGraph) -> Self {
        let edges = graph.num_edges();
        let d = graph.max_domain();
        let var_index = graph.var_index();

        let mut src = Vec::with_capacity(2 * edges);
        let mut dst = Vec::with_capacity(2 * edges);
        for (a, b) in graph.edges() {
            src.push(var_index[a]);
            dst.push(var_index[b]);
        }
        for (a, b) in graph.edges() {
            src.push(var_index[b]);
            dst.push(var_index[a]);
        }

        // (D, D, E) -> (E, D, D), then the transposed copy for reverse slots.
        let tensor = graph.edge_tensor();
        let forward = tensor.view().permuted_axes([2, 0, 1]);
        let reverse = tensor.view().permuted_axes([2, 1, 0]);
        let mut directed_potentials = Array3::from_elem((2 * edges, d, d), graph.min());
        directed_potentials
            .slice_mut(s![..edges, .., ..])
            .assign(&forward);
        directed_potentials
            .slice_mut(s![edges.., .., ..])
            .assign(&reverse);

        let domains = graph.domains();
        let mut messages = Array2::from_elem((2 * edges, d), graph.min());
        for (k, mut row) in messages.axis_iter_mut(Axis(0)).enumerate() {
            let size = domains[dst[k]];
            row.slice_mut(s![..size]).fill(-(size as f64).ln());
        }

        Self {
            fingerprint: GraphFingerprint::of(graph),
            src,
            dst,
            directed_potentials,
            messages,
        }
    }

    fn num_edges(&self) -> usize {
        self.src.len() / 2
    }

    /// Log beliefs `(V, D)`: unary plus every incoming message.
    fn log_beliefs(&self, graph: &FactorGraph) -> Array2<f64> {
        let mut beliefs = graph.unary_matrix().t().to_owned();
        for (k, message) in self.messages.axis_iter(Axis(0)).enumerate() {
            let mut row = beliefs.row_mut(self.dst[k]);
            row += &message;
        }
        beliefs
    }

    /// Per-slot source belief with the reverse message removed, `(2E, D)`.
    fn excluded(&self, beliefs: &Array2<f64>) -> Array2<f64> {
        let edges = self.num_edges();
        let source_beliefs = beliefs.select(Axis(0), &self.src);
        let mut reverse = Array2::zeros(self.messages.raw_dim());
        reverse
            .slice_mut(s![..edges, ..])
            .assign(&self.messages.slice(s![edges.., ..]));
        reverse
            .slice_mut(s![edges.., ..])
            .assign(&self.messages.slice(s![..edges, ..]));
        let mut excluded = source_beliefs - reverse;
        nan_to_neg_inf(&mut excluded);
        excluded
    }
}

/// Row-wise normalization in log space; rows with a `-inf` normalizer are
/// left as they are.
fn normalize_rows(values: &mut Array2<f64>) {
    let norms = log_sum_exp_axis(values.view(), Axis(1));
    for (mut row, norm) in values.axis_iter_mut(Axis(0)).zip(norms.iter()) {
        if norm.is_finite() {
            row -= *norm;
        }
    }
}

impl MessageSweep for VectorizedState {
    fn sweep(&mut self, graph: &FactorGraph, damping: f64) -> Result<f64, ExecError> {
        let beliefs = self.log_beliefs(graph);
        let excluded = self.excluded(&beliefs);

        let terms = &self.directed_potentials + &excluded.view().insert_axis(Axis(2));
        let mut fresh = log_sum_exp_axis(terms.view(), Axis(1));
        normalize_rows(&mut fresh);

        let mut max_delta = 0.0_f64;
        Zip::from(&mut fresh)
            .and(&self.messages)
            .for_each(|next, &prev| {
                *next = damp_log(prev, *next, damping);
                max_delta = max_delta.max(probability_delta(prev, *next));
            });
        self.messages = fresh;
        Ok(max_delta)
    }
}

/// Conditionals of one edge from its log joint `(rows, cols)`.
///
/// Returns `(P(col | row), P(row | col))`, each with rows over the
/// conditioning variable.
pub(crate) fn conditionals_from_joint(joint: ArrayView2<'_, f64>) -> (Array2<f64>, Array2<f64>) {
    let row_norms = log_sum_exp_axis(joint, Axis(1));
    let col_norms = log_sum_exp_axis(joint, Axis(0));
    let cols_given_rows = (&joint - &row_norms.view().insert_axis(Axis(1))).mapv(f64::exp);
    let rows_given_cols = (&joint - &col_norms.view().insert_axis(Axis(0)))
        .mapv(f64::exp)
        .reversed_axes();
    (
        cols_given_rows,
        rows_given_cols.as_standard_layout().to_owned(),
    )
}

/// Assembles normalized marginals and conditionals from stacked log
/// beliefs `(V, D)` and per-slot excluded beliefs `(2E, D)`.
pub(crate) fn beliefs_from_stacked(
    graph: &FactorGraph,
    log_beliefs: &Array2<f64>,
    excluded: &Array2<f64>,
) -> Beliefs {
    let domains = graph.domains();
    let var_index = graph.var_index();
    let edges = graph.num_edges();

    let mut beliefs = Beliefs::fresh();
    for (idx, &var) in graph.variables().iter().enumerate() {
        let logical: Vec<f64> = log_beliefs
            .slice(s![idx, ..domains[idx]])
            .iter()
            .copied()
            .collect();
        beliefs.insert_marginal(var, Array1::from(probabilities_from_log(&logical)));
    }

    let tensor = graph.edge_tensor();
    for (e, &(a, b)) in graph.edges().iter().enumerate() {
        let (rows, cols) = (domains[var_index[&a]], domains[var_index[&b]]);
        // Slot e leaves `a`, slot E + e leaves `b`.
        let excluded_a = excluded.slice(s![e, ..]);
        let excluded_b = excluded.slice(s![edges + e, ..]);
        let mut joint = &tensor.index_axis(Axis(2), e)
            + &excluded_a.insert_axis(Axis(1))
            + &excluded_b.insert_axis(Axis(0));
        nan_to_neg_inf(&mut joint);

        let (b_given_a, a_given_b) = conditionals_from_joint(joint.slice(s![..rows, ..cols]));
        beliefs.insert_conditional(a, b, b_given_a);
        beliefs.insert_conditional(b, a, a_given_b);
    }
    beliefs
}

/// Loopy BP by whole-array operations on the stacked potentials.
#[derive(Debug, Clone, Default)]
pub struct VectorizedBackend {
    state: Option<VectorizedState>,
}

impl VectorizedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of the last run, `(2E, D)`.
    pub fn messages(&self) -> Option<&Array2<f64>> {
        self.state.as_ref().map(|s| &s.messages)
    }
}

impl InferenceBackend for VectorizedBackend {
    fn name(&self) -> &'static str {
        "vectorized"
    }

    fn infer(
        &mut self,
        graph: &FactorGraph,
        config: &BeliefPropagationConfig,
    ) -> Result<BeliefPropagationDiagnostics, ExecError> {
        let mut state = VectorizedState::new(graph);
        let diagnostics = run_sweeps(&mut state, graph, config, self.name())?;
        self.state = Some(state);
        Ok(diagnostics)
    }

    fn compute_probabilities(&self, graph: &FactorGraph) -> Result<Beliefs, ExecError> {
        let state = self.state.as_ref().ok_or_else(|| {
            ExecError::InvalidState("compute_probabilities called before infer".into())
        })?;
        state.fingerprint.check(graph)?;

        let log_beliefs = state.log_beliefs(graph);
        let excluded = state.excluded(&log_beliefs);
        Ok(beliefs_from_stacked(graph, &log_beliefs, &excluded))
    }
}

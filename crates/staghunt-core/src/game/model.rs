//! The stag-hunt model orchestrator.
//!
//! A model owns the scenario, the current game state (agent positions, time
//! step and horizon), the factor graph built from them and the beliefs of
//! the last inference. One planning step is
//!
//! ```text
//! build_* -> infer -> compute_probabilities -> move_next -> update_model | advance_model
//! ```
//!
//! and out-of-order calls fail with [`ExecError::InvalidState`].
//!
//! Time steps run `1..=horizon`; the terminal step carries the payoffs. The
//! two ways of moving on are equivalent:
//!
//! - [`StagHuntModel::update_model`] keeps the graph and clamps the new
//!   positions at the next time step;
//! - [`StagHuntModel::advance_model`] shortens the horizon by one and rebuilds
//!   a fresh graph starting from the new positions.

use rand::seq::IndexedRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::engine::belief_propagation::{
    BeliefPropagationConfig, BeliefPropagationDiagnostics, Beliefs, InferenceBackend,
};
use crate::engine::errors::ExecError;
use crate::engine::factor_graph::FactorGraph;
use crate::engine::variables::Variable;
use crate::engine::vectorized::VectorizedBackend;
use crate::game::config::{GameConfig, ModelParams};
use crate::game::grid::Position;
use crate::game::potentials::{DecomposedLayout, MatrixPotentials, PotentialBuilder};

/// Two decision probabilities closer than this are a tie.
pub const TIE_TOLERANCE: f64 = 1e-9;

/// Which factor graph a model builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Full joint model: terminal positions of every agent pair share a
    /// ground interaction edge.
    Ground,
    /// Decomposed model with one capture variable per agent pair.
    Pairwise,
    /// The decomposed model assembled from stacked potentials.
    FastPairwise,
}

/// Lifecycle of a planning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPhase {
    Configured,
    Built,
    Inferred,
    Decided,
}

/// How [`StagHuntModel::move_next`] resolves equally likely moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// Lowest cell index.
    First,
    /// Uniform over the tied cells, drawn from the model's seeded RNG.
    Random,
}

#[derive(Debug)]
pub struct StagHuntModel {
    config: GameConfig,
    params: ModelParams,
    bp_config: BeliefPropagationConfig,
    backend: Box<dyn InferenceBackend>,
    potentials: Box<dyn PotentialBuilder>,
    rng: ChaCha8Rng,

    positions: Vec<Position>,
    time: usize,
    horizon: usize,
    /// Positions at times `1..=time` of the current graph.
    observed: Vec<Vec<Position>>,
    trajectory: Vec<Vec<Position>>,
    decision: Option<Vec<Position>>,

    kind: Option<ModelKind>,
    graph: Option<FactorGraph>,
    beliefs: Beliefs,
    diagnostics: Option<BeliefPropagationDiagnostics>,
    phase: ModelPhase,
}

impl StagHuntModel {
    /// Creates a configured model using the vectorized backend and the
    /// matrix potential builder.
    pub fn new(config: GameConfig, params: ModelParams) -> Result<Self, ExecError> {
        let config = config.validate()?;
        let params = params.validate()?;
        let positions = config.agents.clone();
        Ok(Self {
            horizon: params.horizon,
            config,
            params,
            bp_config: BeliefPropagationConfig::default(),
            backend: Box::new(VectorizedBackend::new()),
            potentials: Box::new(MatrixPotentials),
            rng: ChaCha8Rng::seed_from_u64(0),
            observed: vec![positions.clone()],
            trajectory: vec![positions.clone()],
            positions,
            time: 1,
            decision: None,
            kind: None,
            graph: None,
            beliefs: Beliefs::default(),
            diagnostics: None,
            phase: ModelPhase::Configured,
        })
    }

    pub fn with_backend(mut self, backend: Box<dyn InferenceBackend>) -> Self {
        self.backend = backend;
        self.invalidate();
        self
    }

    pub fn with_potentials(mut self, potentials: Box<dyn PotentialBuilder>) -> Self {
        self.potentials = potentials;
        self
    }

    pub fn with_bp_config(mut self, bp_config: BeliefPropagationConfig) -> Self {
        self.bp_config = bp_config;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Forgets inference results after the graph or the backend changed.
    fn invalidate(&mut self) {
        self.beliefs.mark_stale();
        self.diagnostics = None;
        self.decision = None;
        if self.graph.is_some() {
            self.phase = ModelPhase::Built;
        }
    }

    fn require(&self, allowed: &[ModelPhase], op: &str) -> Result<(), ExecError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(ExecError::InvalidState(format!(
                "{} is not allowed in phase {:?}",
                op, self.phase
            )))
        }
    }

    // ---- building ------------------------------------------------------

    /// Builds the decomposed pairwise model, one potential at a time.
    pub fn build_model(&mut self) -> Result<&FactorGraph, ExecError> {
        self.build(ModelKind::Pairwise)
    }

    /// Builds the ground model with direct terminal interactions.
    pub fn build_ground_model(&mut self) -> Result<&FactorGraph, ExecError> {
        self.build(ModelKind::Ground)
    }

    /// Builds the decomposed model from the stacked unary matrix and
    /// pairwise tensor.
    pub fn fast_build_model(&mut self) -> Result<&FactorGraph, ExecError> {
        self.build(ModelKind::FastPairwise)
    }

    fn build(&mut self, kind: ModelKind) -> Result<&FactorGraph, ExecError> {
        let graph = match kind {
            ModelKind::Ground | ModelKind::Pairwise => self.populate(kind)?,
            ModelKind::FastPairwise => self.assemble_stacked()?,
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            kind = ?kind,
            horizon = self.horizon,
            time = self.time,
            variables = graph.num_variables(),
            edges = graph.num_edges(),
            "built stag hunt model"
        );

        self.kind = Some(kind);
        self.graph = Some(graph);
        self.invalidate();
        self.phase = ModelPhase::Built;
        self.graph
            .as_ref()
            .ok_or_else(|| ExecError::Internal("graph missing after build".into()))
    }

    fn populate(&self, kind: ModelKind) -> Result<FactorGraph, ExecError> {
        let grid = self.config.grid();
        let d = grid.cells();
        let n = self.config.num_agents();
        let terminal = self.horizon;
        let min = self.params.min;

        let mut graph = FactorGraph::new(min);
        for t in 1..=terminal {
            graph.add_variables((0..n).map(|i| Variable::position(t, i)), d)?;
        }

        let hare = self.potentials.build_hare_unary(&self.config, &self.params);
        let transition = self.potentials.build_transition(grid, min);
        for i in 0..n {
            graph.set_unary(Variable::position(terminal, i), hare.clone())?;
            for t in 1..terminal {
                graph.set_edge(
                    Variable::position(t, i),
                    Variable::position(t + 1, i),
                    transition.clone(),
                )?;
            }
        }

        match kind {
            ModelKind::Ground => {
                let interaction = self.potentials.build_interaction(&self.config, &self.params);
                for i in 0..n {
                    for j in i + 1..n {
                        graph.set_edge(
                            Variable::position(terminal, i),
                            Variable::position(terminal, j),
                            interaction.clone(),
                        )?;
                    }
                }
            }
            _ => {
                let phi_q = self.potentials.build_phi_q(grid, min);
                let capture = self.potentials.build_capture_unary(&self.config, &self.params);
                for i in 0..n {
                    for j in i + 1..n {
                        let q = Variable::capture(terminal, i, j);
                        graph.add_variable(q, d + 1)?;
                        graph.set_unary(q, capture.clone())?;
                        graph.set_edge(q, Variable::position(terminal, i), phi_q.clone())?;
                        graph.set_edge(q, Variable::position(terminal, j), phi_q.clone())?;
                    }
                }
            }
        }

        for (t, cells) in self.observed.iter().enumerate() {
            for (i, pos) in cells.iter().enumerate() {
                graph.clamp(Variable::position(t + 1, i), grid.index(*pos))?;
            }
        }
        Ok(graph)
    }

    fn assemble_stacked(&self) -> Result<FactorGraph, ExecError> {
        let grid = self.config.grid();
        let observed = self
            .observed
            .iter()
            .map(|cells| cells.iter().map(|pos| grid.index(*pos)).collect())
            .collect();
        let layout =
            DecomposedLayout::new(grid, self.horizon, self.config.num_agents(), observed);
        let unary = self
            .potentials
            .build_unary(&layout, &self.config, &self.params);
        let pairwise = self.potentials.build_pairwise(&layout, &self.params);
        let edges: Vec<(Variable, Variable)> =
            layout.edges().into_iter().map(|edge| edge.pair).collect();
        FactorGraph::from_stacked(
            self.params.min,
            &layout.variables(),
            unary,
            &edges,
            pairwise,
        )
    }

    // ---- inference -----------------------------------------------------

    /// Runs belief propagation on the current graph with the model's backend.
    pub fn infer(&mut self) -> Result<BeliefPropagationDiagnostics, ExecError> {
        self.require(
            &[ModelPhase::Built, ModelPhase::Inferred, ModelPhase::Decided],
            "infer",
        )?;
        let graph = self
            .graph
            .as_ref()
            .ok_or_else(|| ExecError::InvalidState("infer called before build".into()))?;
        let diagnostics = self.backend.infer(graph, &self.bp_config)?;
        self.beliefs.mark_stale();
        self.decision = None;
        self.diagnostics = Some(diagnostics);
        self.phase = ModelPhase::Inferred;
        Ok(diagnostics)
    }

    /// Computes marginals and conditionals from the last inference.
    pub fn compute_probabilities(&mut self) -> Result<&Beliefs, ExecError> {
        self.require(
            &[ModelPhase::Inferred, ModelPhase::Decided],
            "compute_probabilities",
        )?;
        let graph = self.graph.as_ref().ok_or_else(|| {
            ExecError::InvalidState("compute_probabilities called before build".into())
        })?;
        self.beliefs = self.backend.compute_probabilities(graph)?;
        Ok(&self.beliefs)
    }

    // ---- decisions -----------------------------------------------------

    /// Picks every agent's next cell from `P(x[time + 1, i] | x[time, i])`
    /// evaluated at its current cell.
    pub fn move_next(&mut self, tie_break: TieBreak) -> Result<Vec<Position>, ExecError> {
        self.require(&[ModelPhase::Inferred, ModelPhase::Decided], "move_next")?;
        if self.beliefs.is_stale() {
            return Err(ExecError::InvalidState(
                "move_next needs fresh beliefs; call compute_probabilities first".into(),
            ));
        }
        if self.time >= self.horizon {
            return Err(ExecError::InvalidState(format!(
                "no move left: time {} reached horizon {}",
                self.time, self.horizon
            )));
        }

        let grid = self.config.grid();
        let mut next = Vec::with_capacity(self.positions.len());
        for (agent, pos) in self.positions.iter().enumerate() {
            let current = Variable::position(self.time, agent);
            let following = Variable::position(self.time + 1, agent);
            let conditional = self
                .beliefs
                .conditional(current, following)
                .ok_or(ExecError::UnknownEdge(current, following))?;
            let row = conditional.row(grid.index(*pos));

            let best = row
                .iter()
                .filter(|p| !p.is_nan())
                .fold(f64::NEG_INFINITY, |acc, &p| acc.max(p));
            if best == f64::NEG_INFINITY {
                return Err(ExecError::NoFeasibleAction(following));
            }
            let tied: Vec<usize> = row
                .iter()
                .enumerate()
                .filter(|(_, p)| !p.is_nan() && best - **p <= TIE_TOLERANCE)
                .map(|(cell, _)| cell)
                .collect();
            let cell = match tie_break {
                TieBreak::First => tied.first().copied(),
                TieBreak::Random => tied.choose(&mut self.rng).copied(),
            }
            .ok_or(ExecError::NoFeasibleAction(following))?;

            #[cfg(feature = "tracing")]
            tracing::debug!(
                agent,
                time = self.time,
                from = %pos,
                to = %grid.position(cell),
                probability = row[cell],
                ties = tied.len(),
                "selected move"
            );
            next.push(grid.position(cell));
        }

        self.decision = Some(next.clone());
        self.phase = ModelPhase::Decided;
        Ok(next)
    }

    fn take_decision(&mut self, op: &str) -> Result<Vec<Position>, ExecError> {
        self.require(&[ModelPhase::Decided], op)?;
        self.decision
            .take()
            .ok_or_else(|| ExecError::InvalidState(format!("{} needs a decided move", op)))
    }

    /// Applies the decided move by clamping it at the next time step of the
    /// current graph. The horizon stays fixed.
    pub fn update_model(&mut self) -> Result<(), ExecError> {
        let next = self.take_decision("update_model")?;
        let grid = self.config.grid();
        let time = self.time + 1;
        let graph = self
            .graph
            .as_mut()
            .ok_or_else(|| ExecError::InvalidState("update_model called before build".into()))?;
        for (agent, pos) in next.iter().enumerate() {
            graph.clamp(Variable::position(time, agent), grid.index(*pos))?;
        }

        self.time = time;
        self.observed.push(next.clone());
        self.trajectory.push(next.clone());
        self.positions = next;
        self.invalidate();
        Ok(())
    }

    /// Applies the decided move by shortening the horizon and rebuilding a
    /// model of the same kind that starts at the new positions.
    pub fn advance_model(&mut self) -> Result<&FactorGraph, ExecError> {
        let next = self.take_decision("advance_model")?;
        let kind = self
            .kind
            .ok_or_else(|| ExecError::InvalidState("advance_model called before build".into()))?;

        self.horizon -= 1;
        self.time = 1;
        self.observed = vec![next.clone()];
        self.trajectory.push(next.clone());
        self.positions = next;
        self.build(kind)
    }

    // ---- scenario interchange -------------------------------------------

    /// Snapshot of the scenario with the agents at their current cells.
    pub fn get_game_config(&self) -> GameConfig {
        GameConfig {
            agents: self.positions.clone(),
            ..self.config.clone()
        }
    }

    /// Replaces the scenario and resets the game state to time 1 with the
    /// configured horizon. Any built graph is dropped.
    pub fn set_game_config(&mut self, config: GameConfig) -> Result<(), ExecError> {
        let config = config.validate()?;
        self.positions = config.agents.clone();
        self.observed = vec![self.positions.clone()];
        self.trajectory = vec![self.positions.clone()];
        self.config = config;
        self.time = 1;
        self.horizon = self.params.horizon;
        self.kind = None;
        self.graph = None;
        self.invalidate();
        self.phase = ModelPhase::Configured;
        Ok(())
    }

    // ---- accessors -----------------------------------------------------

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn bp_config(&self) -> &BeliefPropagationConfig {
        &self.bp_config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn potentials_name(&self) -> &'static str {
        self.potentials.name()
    }

    /// Current cell of every agent (`aPos`).
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn time(&self) -> usize {
        self.time
    }

    /// Terminal time step of the current graph.
    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Every agent's positions since the scenario was set, one entry per
    /// step.
    pub fn trajectory(&self) -> &[Vec<Position>] {
        &self.trajectory
    }

    pub fn kind(&self) -> Option<ModelKind> {
        self.kind
    }

    pub fn phase(&self) -> ModelPhase {
        self.phase
    }

    pub fn graph(&self) -> Option<&FactorGraph> {
        self.graph.as_ref()
    }

    pub fn beliefs(&self) -> &Beliefs {
        &self.beliefs
    }

    pub fn diagnostics(&self) -> Option<&BeliefPropagationDiagnostics> {
        self.diagnostics.as_ref()
    }
}

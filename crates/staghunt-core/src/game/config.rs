//! Model parameters and the serializable scenario snapshot.

use rand::seq::index;
use rand::Rng;

use crate::engine::errors::ExecError;
use crate::game::grid::{Grid, Position};

/// Payoff and horizon parameters of a stag-hunt model.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModelParams {
    /// Payoff scale. Rewards enter the potentials as `-r / lambda`.
    pub lambda: f64,
    /// Reward of catching a hare alone (non-positive).
    pub r_h: f64,
    /// Reward of catching a stag together (non-positive).
    pub r_s: f64,
    /// Number of time steps of the trajectory model.
    pub horizon: usize,
    /// Log potential of an impossible state.
    pub min: f64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            lambda: 1.0,
            r_h: -1.0,
            r_s: -5.0,
            horizon: 4,
            min: f64::NEG_INFINITY,
        }
    }
}

impl ModelParams {
    pub fn validate(self) -> Result<Self, ExecError> {
        if !(self.lambda.is_finite() && self.lambda > 0.0) {
            return Err(ExecError::ValidationError(
                "lambda must be finite and > 0".into(),
            ));
        }
        if !(self.r_h.is_finite() && self.r_h <= 0.0) {
            return Err(ExecError::ValidationError(
                "r_h must be finite and <= 0".into(),
            ));
        }
        if !(self.r_s.is_finite() && self.r_s <= 0.0) {
            return Err(ExecError::ValidationError(
                "r_s must be finite and <= 0".into(),
            ));
        }
        if self.horizon == 0 {
            return Err(ExecError::ValidationError("horizon must be >= 1".into()));
        }
        if self.min.is_nan() || self.min >= 0.0 {
            return Err(ExecError::ValidationError(
                "min must be a negative log potential".into(),
            ));
        }
        Ok(self)
    }

    /// Unary reward of standing on a hare cell at the terminal step.
    pub fn hare_reward(&self) -> f64 {
        -self.r_h / self.lambda
    }

    /// Joint reward of two agents standing on the same stag cell at the
    /// terminal step.
    pub fn stag_reward(&self) -> f64 {
        -self.r_s / self.lambda
    }
}

/// Scenario snapshot: grid size, agent and target positions.
///
/// Two models built from equal configs and params produce identical factor
/// graphs.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GameConfig {
    pub rows: usize,
    pub cols: usize,
    pub agents: Vec<Position>,
    pub hares: Vec<Position>,
    pub stags: Vec<Position>,
}

impl GameConfig {
    pub fn grid(&self) -> Grid {
        Grid::new(self.rows, self.cols)
    }

    pub fn num_agents(&self) -> usize {
        self.agents.len()
    }

    pub fn validate(self) -> Result<Self, ExecError> {
        if self.rows == 0 || self.cols == 0 {
            return Err(ExecError::ValidationError(
                "grid must have at least one row and one column".into(),
            ));
        }
        if self.agents.is_empty() {
            return Err(ExecError::ValidationError(
                "scenario needs at least one agent".into(),
            ));
        }
        let grid = self.grid();
        let outside = self
            .agents
            .iter()
            .chain(&self.hares)
            .chain(&self.stags)
            .find(|pos| !grid.contains(**pos));
        if let Some(pos) = outside {
            return Err(ExecError::ValidationError(format!(
                "position {} is outside the {}x{} grid",
                pos, self.rows, self.cols
            )));
        }
        Ok(self)
    }

    /// Samples a scenario with `num_agents` agents, `num_agents` hares and
    /// `max(1, num_agents / 2)` stags on distinct cells.
    pub fn sample<R: Rng + ?Sized>(
        rng: &mut R,
        rows: usize,
        cols: usize,
        num_agents: usize,
    ) -> Result<Self, ExecError> {
        let grid = Grid::new(rows, cols);
        let num_stags = (num_agents / 2).max(1);
        let needed = 2 * num_agents + num_stags;
        if num_agents == 0 || needed > grid.cells() {
            return Err(ExecError::ValidationError(format!(
                "cannot place {} agents and {} targets on a {}x{} grid",
                num_agents,
                needed - num_agents,
                rows,
                cols
            )));
        }

        let cells: Vec<Position> = index::sample(rng, grid.cells(), needed)
            .into_iter()
            .map(|idx| grid.position(idx))
            .collect();
        let (agents, targets) = cells.split_at(num_agents);
        let (hares, stags) = targets.split_at(num_agents);
        Self {
            rows,
            cols,
            agents: agents.to_vec(),
            hares: hares.to_vec(),
            stags: stags.to_vec(),
        }
        .validate()
    }
}

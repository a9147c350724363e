//! Shared fixtures for the stag-hunt consistency tests.
//!
//! Scenarios are drawn from an explicit seeded RNG and handed to both
//! models of a comparison as an immutable [`GameConfig`], so the two models
//! never share hidden random state.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use staghunt_core::engine::numeric_kernels::{allclose, DEFAULT_ATOL, DEFAULT_RTOL};
use staghunt_core::{
    Beliefs, ExecError, GameConfig, ModelParams, Position, StagHuntModel, TieBreak, Variable,
};

/// Seeded RNG for one test case.
pub fn rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Random payoffs, horizon and grid for a scenario with `num_agents` agents
/// (2 or 3 when `None`).
pub fn sample_scenario<R: Rng>(rng: &mut R, num_agents: Option<usize>) -> (GameConfig, ModelParams) {
    let params = ModelParams {
        lambda: rng.random_range(0.1..10.0),
        r_h: f64::from(rng.random_range(-5..=-1)),
        r_s: f64::from(rng.random_range(-10..=-5)),
        horizon: rng.random_range(4..=8),
        ..ModelParams::default()
    };
    let size = rng.random_range(5..=8);
    let num_agents = num_agents.unwrap_or_else(|| rng.random_range(2..=3));
    let config = GameConfig::sample(rng, size, size, num_agents)
        .unwrap_or_else(|e| panic!("scenario sampling failed: {e}"));
    (config, params)
}

/// Two models over the same random scenario. The second one receives the
/// scenario through `set_game_config`.
pub fn setup_two_models(seed: u64, num_agents: Option<usize>) -> (StagHuntModel, StagHuntModel) {
    let mut rng = rng(seed);
    let (config, params) = sample_scenario(&mut rng, num_agents);
    let first = StagHuntModel::new(config.clone(), params).expect("valid scenario");
    let mut second = StagHuntModel::new(config, params).expect("valid scenario");
    second
        .set_game_config(first.get_game_config())
        .expect("valid scenario");
    (first, second)
}

/// Runs inference, reads back beliefs and decides the next move.
pub fn decide(model: &mut StagHuntModel) -> Result<Vec<Position>, ExecError> {
    model.infer()?;
    model.compute_probabilities()?;
    model.move_next(TieBreak::First)
}

/// NaN-aware check of every belief in `lhs` against `rhs`; conditional keys
/// listed in `skip` are ignored.
pub fn compare_beliefs(lhs: &Beliefs, rhs: &Beliefs, skip: &[(Variable, Variable)]) -> bool {
    let marginals = lhs.var_probabilities().iter().all(|(var, p)| {
        rhs.marginal(*var)
            .is_some_and(|q| allclose(&p.view(), &q, DEFAULT_RTOL, DEFAULT_ATOL))
    });
    let conditionals = lhs
        .conditional_probabilities()
        .iter()
        .filter(|(key, _)| !skip.contains(*key))
        .all(|(&(given, target), p)| {
            rhs.conditional(given, target)
                .is_some_and(|q| allclose(&p.view(), &q, DEFAULT_RTOL, DEFAULT_ATOL))
        });
    marginals && conditionals
}

/// The terminal pair of agents 0 and 1, in both orientations. The
/// decomposed model has no direct edge between them.
pub fn terminal_pair(horizon: usize) -> [(Variable, Variable); 2] {
    let a = Variable::position(horizon, 0);
    let b = Variable::position(horizon, 1);
    [(a, b), (b, a)]
}

//! The ground model and the decomposed pairwise model describe the same
//! distribution for two agents, so their beliefs and moves must agree. The
//! only difference is the direct terminal edge of the ground model.

use staghunt_core::{ExplicitBackend, GameConfig, ModelParams, Position, StagHuntModel};
use staghunt_tests::{compare_beliefs, decide, setup_two_models, terminal_pair};

fn explicit(model: StagHuntModel) -> StagHuntModel {
    model.with_backend(Box::new(ExplicitBackend::new()))
}

fn run_side_by_side(mut ground: StagHuntModel, mut pairwise: StagHuntModel, context: &str) {
    ground.build_ground_model().unwrap();
    pairwise.build_model().unwrap();
    let skip = terminal_pair(ground.horizon());

    for step in 1..ground.horizon() {
        let ground_move = decide(&mut ground).unwrap();
        let pairwise_move = decide(&mut pairwise).unwrap();
        assert!(ground.diagnostics().unwrap().converged);
        assert!(
            compare_beliefs(ground.beliefs(), pairwise.beliefs(), &skip),
            "{context}: beliefs differ at step {step}"
        );
        assert_eq!(ground_move, pairwise_move, "{context}: moves differ at step {step}");
        ground.update_model().unwrap();
        pairwise.update_model().unwrap();
    }
    assert_eq!(ground.trajectory(), pairwise.trajectory());
}

#[test]
fn ground_and_pairwise_models_agree_on_random_scenarios() {
    for seed in 0..4 {
        let (ground, pairwise) = setup_two_models(seed, Some(2));
        run_side_by_side(explicit(ground), explicit(pairwise), &format!("seed {seed}"));
    }
}

#[test]
fn terminal_pair_is_the_only_missing_conditional() {
    let (mut ground, mut pairwise) = setup_two_models(11, Some(2));
    ground.build_ground_model().unwrap();
    pairwise.build_model().unwrap();
    decide(&mut ground).unwrap();
    decide(&mut pairwise).unwrap();

    let missing: Vec<_> = ground
        .beliefs()
        .conditional_probabilities()
        .keys()
        .filter(|(a, b)| pairwise.beliefs().conditional(*a, *b).is_none())
        .copied()
        .collect();
    assert_eq!(missing.len(), 2);
    for key in terminal_pair(ground.horizon()) {
        assert!(missing.contains(&key));
    }
}

#[test]
fn eight_by_eight_scenario_trajectories_match() {
    let config = GameConfig {
        rows: 8,
        cols: 8,
        agents: vec![Position::new(0, 0), Position::new(7, 6)],
        hares: vec![Position::new(0, 6), Position::new(6, 1)],
        stags: vec![Position::new(3, 4)],
    };
    let params = ModelParams {
        lambda: 2.0,
        r_h: -2.0,
        r_s: -7.0,
        horizon: 6,
        ..ModelParams::default()
    };
    let ground = StagHuntModel::new(config.clone(), params).unwrap();
    let pairwise = StagHuntModel::new(config, params).unwrap();
    run_side_by_side(explicit(ground), explicit(pairwise), "8x8 scenario");
}

//! The stacked fast build must describe exactly the same potentials as the
//! per-potential build, even though variables and edges are laid out in a
//! different order.

use staghunt_core::{FactorGraph, StagHuntModel, VectorizedBackend};
use staghunt_tests::{compare_beliefs, decide, setup_two_models};

fn assert_same_potentials(slow: &FactorGraph, fast: &FactorGraph) {
    assert_eq!(slow.num_variables(), fast.num_variables());
    assert_eq!(slow.message_index().len(), fast.message_index().len());
    assert_eq!(slow.max_domain(), fast.max_domain());

    let slow_unary = slow.unary_matrix();
    let fast_unary = fast.unary_matrix();
    for (var, &slow_col) in slow.var_index() {
        let fast_col = fast.var_index()[var];
        assert_eq!(
            slow_unary.column(slow_col),
            fast_unary.column(fast_col),
            "unary of {var} differs"
        );
    }

    for &(a, b) in slow.message_index().keys() {
        let expected = slow.get_edge(a, b).unwrap();
        let actual = fast.get_edge(a, b).unwrap();
        assert_eq!(expected.potential, actual.potential, "edge {a} -- {b} differs");
        let reversed = fast.get_edge(b, a).unwrap();
        assert_eq!(reversed.potential, expected.potential.t());
    }
}

fn both_builds(seed: u64, agents: usize) -> (StagHuntModel, StagHuntModel) {
    let (mut slow, mut fast) = setup_two_models(seed, Some(agents));
    slow.build_model().unwrap();
    fast.fast_build_model().unwrap();
    (slow, fast)
}

#[test]
fn fast_build_matches_per_potential_build() {
    for (seed, agents) in [(80, 2), (81, 3), (82, 4)] {
        let (slow, fast) = both_builds(seed, agents);
        assert_same_potentials(slow.graph().unwrap(), fast.graph().unwrap());
    }
}

#[test]
fn fast_build_matches_after_clamping() {
    let (mut model, _) = setup_two_models(83, Some(3));
    model.build_model().unwrap();
    decide(&mut model).unwrap();
    model.update_model().unwrap();
    decide(&mut model).unwrap();
    model.update_model().unwrap();
    let clamped = model.graph().unwrap().clone();

    let rebuilt = model.fast_build_model().unwrap();
    assert_same_potentials(&clamped, rebuilt);
}

#[test]
fn fast_build_gives_the_same_beliefs() {
    let (slow, fast) = both_builds(84, 2);
    let mut slow = slow.with_backend(Box::new(VectorizedBackend::new()));
    let mut fast = fast.with_backend(Box::new(VectorizedBackend::new()));
    // Swapping the backend keeps the built graph.
    let expected = decide(&mut slow).unwrap();
    let actual = decide(&mut fast).unwrap();
    assert_eq!(expected, actual);
    assert!(compare_beliefs(slow.beliefs(), fast.beliefs(), &[]));
    assert!(compare_beliefs(fast.beliefs(), slow.beliefs(), &[]));
}

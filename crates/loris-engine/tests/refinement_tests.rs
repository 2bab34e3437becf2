mod common;

use common::*;
use loris_engine::{run_reachability, VerificationOutcome};
use loris_ir::value_domain::{TrackedVars, ValueState};
use std::sync::Arc;

#[test]
fn spurious_guard_at_main_level_is_refined_to_safe() {
    // With nothing tracked, the guard before the error is undecidable and
    // the first round reaches it; tracking x and y closes it.
    let cfg = diamond_call_cfg(2);
    let mut engine = engine_for(&cfg);
    let (outcome, report) = run_reachability(
        &mut engine,
        ValueState::top(),
        TrackedVars::none(),
        path_refiner(Arc::clone(&cfg)),
        5,
    )
    .unwrap();

    assert!(outcome.is_safe());
    assert_eq!(report.refinements, 1);
    assert_eq!(engine.statistics().full_restarts, 0);
}

#[test]
fn genuine_violation_survives_refinement() {
    let cfg = diamond_call_cfg(5);
    let mut engine = engine_for(&cfg);
    let (outcome, report) = run_reachability(
        &mut engine,
        ValueState::top(),
        TrackedVars::none(),
        path_refiner(Arc::clone(&cfg)),
        5,
    )
    .unwrap();

    let VerificationOutcome::Unsafe { tree } = outcome else {
        panic!("expected an unsafe verdict");
    };
    assert_eq!(tree.node(tree.target()).cfg_node, 7);
    assert_eq!(report.refinements, 0);
}

#[test]
fn violation_inside_a_block_rekeys_and_resumes_its_graph() {
    let cfg = error_in_block_cfg();
    let mut engine = engine_for(&cfg);
    let (outcome, report) = run_reachability(
        &mut engine,
        ValueState::top(),
        TrackedVars::none(),
        path_refiner(Arc::clone(&cfg)),
        5,
    )
    .unwrap();

    assert!(outcome.is_safe());
    assert_eq!(report.refinements, 1);
    let stats = engine.statistics();
    // The first round's graph was cut and rekeyed under the refined
    // precision, then resumed instead of re-explored from scratch.
    assert_eq!(stats.rekeys, 1);
    assert_eq!(stats.partial_hits, 1);
    assert_eq!(stats.full_restarts, 0);
}

#[test]
fn refinement_budget_of_zero_aborts_on_the_first_spurious_path() {
    let cfg = diamond_call_cfg(2);
    let mut engine = engine_for(&cfg);
    let (outcome, _) = run_reachability(
        &mut engine,
        ValueState::top(),
        TrackedVars::none(),
        path_refiner(Arc::clone(&cfg)),
        0,
    )
    .unwrap();
    assert!(matches!(outcome, VerificationOutcome::Aborted { .. }));
}

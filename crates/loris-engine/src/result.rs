//! CEGAR driver loop and its reportable outcome.

use crate::cache::CacheStatistics;
use crate::counterexample::{compute_counterexample_subgraph, rename_path_tree, PathTree};
use crate::explorer::ExploreOutcome;
use crate::refine::CexPathStep;
use crate::transfer::{BamEngine, EngineError};
use loris_ir::abstraction::{AbstractDomain, RelevanceFilter, StateReducer};
use loris_ir::reach_graph::ReachGraph;
use serde::Serialize;
use tracing::info;

/// Final verdict of a verification run.
#[derive(Debug)]
pub enum VerificationOutcome<D: AbstractDomain> {
    /// Exploration closed without reaching a target.
    Safe,
    /// A target is reachable; the tree is the reconstructed and renamed
    /// counterexample.
    Unsafe { tree: PathTree<D> },
    /// The run stopped before reaching a verdict.
    Aborted { reason: String },
}

impl<D: AbstractDomain> VerificationOutcome<D> {
    pub fn is_safe(&self) -> bool {
        matches!(self, VerificationOutcome::Safe)
    }

    pub fn is_unsafe(&self) -> bool {
        matches!(self, VerificationOutcome::Unsafe { .. })
    }
}

/// Machine-readable account of how the run went.
#[derive(Debug, Clone, Serialize)]
pub struct RefinementReport {
    pub refinements: usize,
    pub cache: CacheStatistics,
}

/// A refiner's verdict on a spurious counterexample.
#[derive(Debug, Clone)]
pub struct Refinement<D: AbstractDomain> {
    pub precision: D::Precision,
    /// Index into the tree's primary path of the first node whose state
    /// depends on the refined precision. The path handed to invalidation is
    /// truncated here, so everything above survives refinement untouched.
    /// `None` invalidates down to the target.
    pub pivot: Option<usize>,
}

/// Run the CEGAR loop to a verdict.
///
/// `refine` inspects a renamed counterexample tree: `None` declares it
/// feasible, `Some(refinement)` declares it spurious and supplies the
/// refined precision plus the pivot to invalidate from. The outer graph
/// persists across rounds, so refinement only re-explores what it
/// invalidated.
pub fn run_reachability<D, R, F, Refine>(
    engine: &mut BamEngine<D, R, F>,
    initial_state: D::State,
    initial_precision: D::Precision,
    mut refine: Refine,
    max_refinements: usize,
) -> Result<(VerificationOutcome<D>, RefinementReport), EngineError>
where
    D: AbstractDomain,
    R: StateReducer<D>,
    F: RelevanceFilter<D>,
    Refine: FnMut(&PathTree<D>) -> Option<Refinement<D>>,
{
    let main = engine.partition().main_block();
    let entry = engine.cfg().entry();
    let mut outer = ReachGraph::new(entry, initial_state, initial_precision);
    let mut refinements = 0usize;

    loop {
        let outcome = match engine.explore_block(&mut outer, main) {
            Ok(outcome) => outcome,
            Err(EngineError::Shutdown) => {
                return Ok((
                    VerificationOutcome::Aborted {
                        reason: "shutdown requested".into(),
                    },
                    report(engine, refinements),
                ));
            }
            Err(err) => return Err(err),
        };

        let target = match outcome {
            ExploreOutcome::Closed => {
                info!(refinements, "exploration closed; program is safe");
                return Ok((VerificationOutcome::Safe, report(engine, refinements)));
            }
            ExploreOutcome::TargetFound(target) => target,
        };

        let mut tree = compute_counterexample_subgraph(engine, &outer, target)?;
        rename_path_tree(engine, &mut tree)?;

        let Some(refinement) = refine(&tree) else {
            info!(refinements, "counterexample is feasible; program is unsafe");
            return Ok((
                VerificationOutcome::Unsafe { tree },
                report(engine, refinements),
            ));
        };
        if refinements >= max_refinements {
            return Ok((
                VerificationOutcome::Aborted {
                    reason: format!("refinement budget of {max_refinements} exhausted"),
                },
                report(engine, refinements),
            ));
        }
        refinements += 1;

        let mut path: Vec<CexPathStep<D>> = tree
            .primary_path()
            .into_iter()
            .map(|id| {
                let node = tree.node(id);
                CexPathStep {
                    cfg_node: node.cfg_node,
                    state: node.state.clone(),
                    precision: node.precision.clone(),
                }
            })
            .collect();
        if let Some(pivot) = refinement.pivot {
            path.truncate(pivot.min(path.len().saturating_sub(1)) + 1);
        }
        engine.perform_refinement(&mut outer, Some(&path), &refinement.precision)?;
        info!(round = refinements, "refined; resuming exploration");
    }
}

fn report<D, R, F>(engine: &BamEngine<D, R, F>, refinements: usize) -> RefinementReport
where
    D: AbstractDomain,
    R: StateReducer<D>,
    F: RelevanceFilter<D>,
{
    RefinementReport {
        refinements,
        cache: engine.statistics().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loris_ir::blocks::BlockPartition;
    use loris_ir::cfg::{Cfg, CfgOp, CmpOp, Cond, Expr};
    use loris_ir::value_domain::{
        precision_for_path, refinement_pivot, TrackedVars, ValueAnalysis, ValueRelevance,
        ValueReducer, ValueState,
    };
    use std::sync::Arc;

    /// 0 -x:=3-> 1 -assume x<bound-> 2(error)
    fn guarded_error_cfg(bound: i64) -> Arc<Cfg> {
        let mut cfg = Cfg::new();
        let n0 = cfg.add_node();
        let n1 = cfg.add_node();
        let n2 = cfg.add_node();
        cfg.set_entry(n0);
        cfg.add_edge(
            n0,
            n1,
            CfgOp::Assign {
                var: "x".into(),
                expr: Expr::Const(3),
            },
        );
        cfg.add_edge(
            n1,
            n2,
            CfgOp::Assume {
                cond: Cond {
                    lhs: Expr::var("x"),
                    op: CmpOp::Lt,
                    rhs: Expr::Const(bound),
                },
                polarity: true,
            },
        );
        cfg.mark_error(n2);
        Arc::new(cfg)
    }

    fn engine_for(cfg: &Arc<Cfg>) -> BamEngine<ValueAnalysis, ValueReducer, ValueRelevance> {
        let partition = Arc::new(BlockPartition::from_cfg(cfg).unwrap());
        BamEngine::new(
            ValueAnalysis::new(Arc::clone(cfg)),
            ValueReducer,
            ValueRelevance,
            Arc::clone(cfg),
            partition,
        )
    }

    #[test]
    fn spurious_counterexample_is_refined_away() {
        // The guard is unsatisfiable once "x" is tracked, but the initial
        // precision tracks nothing, so the first round reaches the error.
        let cfg = guarded_error_cfg(2);
        let mut engine = engine_for(&cfg);
        let refine_cfg = Arc::clone(&cfg);
        let (outcome, rep) = run_reachability(
            &mut engine,
            ValueState::top(),
            TrackedVars::none(),
            |tree| {
                let nodes: Vec<_> = tree
                    .primary_path()
                    .into_iter()
                    .map(|id| tree.node(id).cfg_node)
                    .collect();
                let precision = precision_for_path(&refine_cfg, &nodes, &TrackedVars::none());
                let pivot = refinement_pivot(&refine_cfg, &nodes, &precision);
                Some(Refinement {
                    precision,
                    pivot: Some(pivot),
                })
            },
            5,
        )
        .unwrap();
        assert!(outcome.is_safe());
        assert_eq!(rep.refinements, 1);
    }

    #[test]
    fn feasible_counterexample_is_reported_unsafe() {
        let cfg = guarded_error_cfg(5);
        let mut engine = engine_for(&cfg);
        let (outcome, rep) = run_reachability(
            &mut engine,
            ValueState::top(),
            TrackedVars::of(["x"]),
            |_tree| None,
            5,
        )
        .unwrap();
        let VerificationOutcome::Unsafe { tree } = outcome else {
            panic!("expected an unsafe verdict");
        };
        assert_eq!(tree.node(tree.target()).cfg_node, 2);
        assert!(tree.node(tree.target()).renamed.is_some());
        assert_eq!(rep.refinements, 0);
    }

    #[test]
    fn exhausted_budget_aborts() {
        let cfg = guarded_error_cfg(2);
        let mut engine = engine_for(&cfg);
        let (outcome, _rep) = run_reachability(
            &mut engine,
            ValueState::top(),
            TrackedVars::none(),
            |_tree| {
                Some(Refinement {
                    precision: TrackedVars::of(["x"]),
                    pivot: None,
                })
            },
            0,
        )
        .unwrap();
        assert!(matches!(outcome, VerificationOutcome::Aborted { .. }));
    }
}

#![allow(dead_code)]

use loris_engine::{BamEngine, PathTree, Refinement};
use loris_ir::abstraction::AbstractDomain;
use loris_ir::blocks::BlockPartition;
use loris_ir::cfg::{Cfg, CfgOp, CmpOp, Cond, Expr};
use loris_ir::value_domain::{
    precision_for_path, refinement_pivot, TrackedVars, ValueAnalysis, ValueReducer,
    ValueRelevance, ValueState,
};
use std::sync::Arc;

pub type ValueEngine = BamEngine<ValueAnalysis, ValueReducer, ValueRelevance>;

pub fn assign(var: &str, expr: Expr) -> CfgOp {
    CfgOp::Assign {
        var: var.into(),
        expr,
    }
}

pub fn assume_var_lt(var: &str, bound: i64, polarity: bool) -> CfgOp {
    CfgOp::Assume {
        cond: Cond {
            lhs: Expr::var(var),
            op: CmpOp::Lt,
            rhs: Expr::Const(bound),
        },
        polarity,
    }
}

/// Both branches of a diamond call the same function:
///
/// ```text
/// 0 -x:=1-> 1 -z:=1-> 2 -CallEnter(f)-> 4
///           1 -z:=2-> 3 -CallEnter(f)-> 4
/// f: 4 -y:=x+1-> 5, 5 -CallReturn(f)-> 6
/// 6 -[y<bound]-> 7 (error)
/// ```
///
/// The branches differ only in `z`, which `f` never references: with `z`
/// tracked the two caller states stay distinct, yet both reduce to the same
/// block entry and share one cache entry.
pub fn diamond_call_cfg(bound: i64) -> Arc<Cfg> {
    let mut cfg = Cfg::new();
    for _ in 0..8 {
        cfg.add_node();
    }
    cfg.set_entry(0);
    cfg.add_edge(0, 1, assign("x", Expr::Const(1)));
    cfg.add_edge(1, 2, assign("z", Expr::Const(1)));
    cfg.add_edge(1, 3, assign("z", Expr::Const(2)));
    cfg.add_edge(2, 4, CfgOp::CallEnter { callee: "f".into() });
    cfg.add_edge(3, 4, CfgOp::CallEnter { callee: "f".into() });
    cfg.add_edge(
        4,
        5,
        assign("y", Expr::Add(Box::new(Expr::var("x")), Box::new(Expr::Const(1)))),
    );
    cfg.add_edge(5, 6, CfgOp::CallReturn { callee: "f".into() });
    cfg.add_edge(6, 7, assume_var_lt("y", bound, true));
    cfg.mark_error(7);
    Arc::new(cfg)
}

/// A violation inside the called function:
///
/// ```text
/// 0 -CallEnter(f)-> 1
/// f: 1 -y:=3-> 2, 2 -[y<2]-> 4 (error), 2 -skip-> 3, 3 -CallReturn(f)-> 5
/// ```
pub fn error_in_block_cfg() -> Arc<Cfg> {
    let mut cfg = Cfg::new();
    for _ in 0..6 {
        cfg.add_node();
    }
    cfg.set_entry(0);
    cfg.add_edge(0, 1, CfgOp::CallEnter { callee: "f".into() });
    cfg.add_edge(1, 2, assign("y", Expr::Const(3)));
    cfg.add_edge(2, 4, assume_var_lt("y", 2, true));
    cfg.add_edge(2, 3, CfgOp::Skip);
    cfg.add_edge(3, 5, CfgOp::CallReturn { callee: "f".into() });
    cfg.mark_error(4);
    Arc::new(cfg)
}

pub fn engine_for(cfg: &Arc<Cfg>) -> ValueEngine {
    let partition = Arc::new(BlockPartition::from_cfg(cfg).expect("well-formed call structure"));
    BamEngine::new(
        ValueAnalysis::new(Arc::clone(cfg)),
        ValueReducer,
        ValueRelevance,
        Arc::clone(cfg),
        partition,
    )
}

/// Concrete replay of the primary path with every variable tracked. When the
/// replay survives to the end, the counterexample is feasible.
pub fn replay_reaches_target(cfg: &Arc<Cfg>, nodes: &[usize]) -> bool {
    let domain = ValueAnalysis::new(Arc::clone(cfg));
    let mut all_vars = std::collections::BTreeSet::new();
    for edge in cfg.edges() {
        all_vars.extend(edge.op.referenced_vars());
    }
    let precision = TrackedVars(all_vars);
    let mut state = ValueState::top();
    for pair in nodes.windows(2) {
        let Some(edge) = cfg.edge_between(pair[0], pair[1]) else {
            // Seam between scopes; the state carries over unchanged.
            continue;
        };
        match domain.successors(&state, &precision, edge) {
            Ok(mut successors) if !successors.is_empty() => state = successors.remove(0),
            _ => return false,
        }
    }
    true
}

/// The standard test refiner: replay the counterexample, and when it is
/// spurious derive the path precision and the pivot to invalidate from.
pub fn path_refiner(
    cfg: Arc<Cfg>,
) -> impl FnMut(&PathTree<ValueAnalysis>) -> Option<Refinement<ValueAnalysis>> {
    move |tree| {
        let nodes: Vec<usize> = tree
            .primary_path()
            .into_iter()
            .map(|id| tree.node(id).cfg_node)
            .collect();
        if replay_reaches_target(&cfg, &nodes) {
            return None;
        }
        let precision = precision_for_path(&cfg, &nodes, &TrackedVars::none());
        let pivot = refinement_pivot(&cfg, &nodes, &precision);
        Some(Refinement {
            precision,
            pivot: Some(pivot),
        })
    }
}

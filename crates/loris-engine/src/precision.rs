//! Precision trimming and target policy at block boundaries.

use crate::transfer::BamEngine;
use loris_ir::abstraction::{AbstractDomain, RelevanceFilter, StateReducer};
use loris_ir::cfg::NodeId;

impl<D, R, F> BamEngine<D, R, F>
where
    D: AbstractDomain,
    R: StateReducer<D>,
    F: RelevanceFilter<D>,
{
    /// Drop precision components irrelevant to the active block when the
    /// node sits on its boundary. Interior nodes keep the precision as is:
    /// trimming there would make block-local keys unstable.
    pub(crate) fn trim_precision(&self, node: NodeId, precision: &D::Precision) -> D::Precision {
        if let Some(&(top, _)) = self.block_stack.last() {
            let block = self.partition.block(top);
            if block.entry == node || block.is_exit(node) {
                return self.filter.relevant_precision(block, precision);
            }
        }
        precision.clone()
    }

    /// Whether exploration must halt at this node/state pair.
    pub(crate) fn halt_on_target(&self, node: NodeId, state: &D::State) -> bool {
        self.domain.is_target(node, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownCheck;
    use loris_ir::abstraction::IdentityReducer;
    use loris_ir::blocks::BlockPartition;
    use loris_ir::cfg::{Cfg, CfgOp};
    use loris_ir::value_domain::{TrackedVars, ValueAnalysis, ValueRelevance, ValueState};
    use std::sync::Arc;

    fn engine_with_call(
    ) -> BamEngine<ValueAnalysis, IdentityReducer, ValueRelevance> {
        let mut cfg = Cfg::new();
        for _ in 0..5 {
            cfg.add_node();
        }
        cfg.set_entry(0);
        cfg.add_edge(0, 1, CfgOp::CallEnter { callee: "f".into() });
        cfg.add_edge(1, 2, CfgOp::Skip);
        cfg.add_edge(2, 3, CfgOp::Skip);
        cfg.add_edge(3, 4, CfgOp::CallReturn { callee: "f".into() });
        let cfg = Arc::new(cfg);
        let partition = Arc::new(BlockPartition::from_cfg(&cfg).unwrap());
        BamEngine::new(
            ValueAnalysis::new(Arc::clone(&cfg)),
            IdentityReducer,
            ValueRelevance,
            cfg,
            partition,
        )
        .with_shutdown(ShutdownCheck::new())
    }

    #[test]
    fn trims_only_on_block_boundary() {
        let mut engine = engine_with_call();
        let block = engine
            .partition
            .block_for_entry(1)
            .expect("call target is a block entry");
        engine.block_stack.push((block, false));
        let precision = TrackedVars::of(["x", "zz"]);
        let at_entry = engine.trim_precision(1, &precision);
        // Block "f" references no variables, so boundary trimming empties it.
        assert!(at_entry.0.is_empty());
        let interior = engine.trim_precision(2, &precision);
        assert_eq!(interior, precision);
    }

    #[test]
    fn empty_stack_keeps_precision() {
        let engine = engine_with_call();
        let precision = TrackedVars::of(["x"]);
        assert_eq!(engine.trim_precision(1, &precision), precision);
    }

    #[test]
    fn target_policy_matches_domain() {
        let engine = engine_with_call();
        assert!(!engine.halt_on_target(4, &ValueState::top()));
    }
}

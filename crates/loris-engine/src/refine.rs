//! Cache invalidation after a spurious counterexample.
//!
//! A refinement names a spurious path and a refined precision. Every cached
//! block graph the path threads through holds results computed under the old
//! precision, so each one is patched: its subtree below the path is removed
//! and the entry is rekeyed under the refined precision. When no path is
//! available the whole cache is discarded and exploration restarts from the
//! root.

use crate::cache::CacheKey;
use crate::transfer::{BamEngine, EngineError};
use loris_ir::abstraction::{AbstractDomain, RelevanceFilter, StateReducer};
use loris_ir::blocks::BlockId;
use loris_ir::cfg::NodeId;
use loris_ir::reach_graph::ReachGraph;
use std::sync::Arc;
use tracing::{debug, info};

/// One step of a counterexample path, in the scope of the graph that
/// explored it.
#[derive(Debug, Clone)]
pub struct CexPathStep<D: AbstractDomain> {
    pub cfg_node: NodeId,
    pub state: D::State,
    pub precision: D::Precision,
}

impl<D, R, F> BamEngine<D, R, F>
where
    D: AbstractDomain,
    R: StateReducer<D>,
    F: RelevanceFilter<D>,
{
    /// Apply a refinement to the caches and the outer graph.
    ///
    /// `path` is the spurious path from the outer root to the target, in
    /// outer scope. `None` means the refiner could not localize the flaw;
    /// everything is invalidated and exploration restarts from scratch.
    pub fn perform_refinement(
        &mut self,
        outer: &mut ReachGraph<D::State, D::Precision>,
        path: Option<&[CexPathStep<D>]>,
        new_precision: &D::Precision,
    ) -> Result<(), EngineError> {
        let Some(path) = path else {
            return self.full_restart(outer, new_precision);
        };
        let Some(removal_step) = path.last() else {
            return self.full_restart(outer, new_precision);
        };

        // Blocks the path enters but never leaves enclose the target; those
        // are the cache entries the refinement touches, outermost first.
        // Re-entry of the block already on top is the recursion-downgrade
        // case and opens no new scope.
        let mut open: Vec<(BlockId, usize)> = Vec::new();
        for (index, step) in path.iter().enumerate() {
            if let Some(block_id) = self.partition.block_for_entry(step.cfg_node) {
                if block_id != self.partition.main_block()
                    && open.last().map(|&(b, _)| b) != Some(block_id)
                {
                    open.push((block_id, index));
                    continue;
                }
            }
            if let Some(&(top, _)) = open.last() {
                if self.partition.block(top).is_exit(step.cfg_node) {
                    open.pop();
                }
            }
        }

        // Inside each enclosing block the cut point is the next-inner
        // block's entry; inside the innermost it is the removal step.
        for (pos, &(block_id, entry_index)) in open.iter().enumerate() {
            let cut_step = match open.get(pos + 1) {
                Some(&(_, inner_entry)) => &path[inner_entry],
                None => removal_step,
            };
            self.patch_block(block_id, &path[entry_index], cut_step, new_precision)?;
        }

        // The outer graph is cut at the outermost enclosing entry, or at the
        // removal step itself when the path never left the main block. The
        // caller is responsible for choosing a removal step high enough that
        // the surviving states do not depend on the refined precision.
        let outer_cut = match open.first() {
            Some(&(_, entry_index)) => &path[entry_index],
            None => removal_step,
        };
        let cut_node = outer
            .find(|n| n.cfg_node == outer_cut.cfg_node && n.state == outer_cut.state)
            .ok_or_else(|| {
                EngineError::Inconsistency(
                    "refined path step is not present in the outer graph".into(),
                )
            })?;
        if cut_node == outer.root() {
            return self.full_restart(outer, new_precision);
        }
        if !outer.remove_subtree(cut_node, new_precision.clone()) {
            return Err(EngineError::Inconsistency(
                "outer graph refused subtree removal at the refined cut point".into(),
            ));
        }
        info!(blocks = open.len(), "applied refinement patch");
        Ok(())
    }

    /// Patch one cached block along the refined path.
    ///
    /// Three outcomes, depending on how the refined precision relates to the
    /// entry's cache key: same key keeps the entry and drops only the stale
    /// part (summary plus the subtree below the cut); an already-occupied
    /// refined key means the refined exploration exists and the stale entry
    /// is left for its other callers; otherwise the graph is cut and rekeyed
    /// under the refined precision so the surviving prefix is reused.
    fn patch_block(
        &mut self,
        block_id: BlockId,
        entry_step: &CexPathStep<D>,
        cut_step: &CexPathStep<D>,
        new_precision: &D::Precision,
    ) -> Result<(), EngineError> {
        let partition = Arc::clone(&self.partition);
        let block = partition.block(block_id);
        let (old_key, _, _) = self.reduce_and_key(block, &entry_step.state, &entry_step.precision);
        if !self.cache.contains(&old_key) {
            return Err(EngineError::Inconsistency(format!(
                "no cache entry for block '{}' on the refined path",
                block.name
            )));
        }
        let new_rel_precision = self.filter.relevant_precision(block, new_precision);
        let new_key = CacheKey {
            block: block.id,
            state_fp: old_key.state_fp,
            precision_fp: self.filter.relevant_fingerprint(block, new_precision),
        };

        if new_key != old_key && self.cache.contains(&new_key) {
            debug!(block = %block.name, "refined key already explored; stale entry kept");
            return Ok(());
        }

        // Block-local states mention only block-relevant parts, so reducing
        // the outer-scope cut state recovers the in-graph representation.
        let reduced_cut_state = self.reducer.reduce(&cut_step.state, block);
        let (cut_node, cut_is_root) = {
            let graph = self.cache.graph(&old_key).ok_or_else(|| {
                EngineError::Inconsistency(format!(
                    "cache entry for block '{}' has no graph to patch",
                    block.name
                ))
            })?;
            let cut = graph
                .find(|n| n.cfg_node == cut_step.cfg_node && n.state == reduced_cut_state)
                .ok_or_else(|| {
                    EngineError::Inconsistency(format!(
                        "cut point not found in cached graph of block '{}'",
                        block.name
                    ))
                })?;
            (cut, cut == graph.root())
        };

        if cut_is_root {
            // Nothing above the cut survives; a later entry is a fresh miss.
            self.cache.evict(&old_key);
            self.stats.evictions += 1;
            return Ok(());
        }
        if new_key == old_key {
            self.cache.evict_summary(&old_key);
            if let Some(graph) = self.cache.graph_mut(&old_key) {
                graph.remove_subtree(cut_node, new_rel_precision);
            }
            self.stats.evictions += 1;
            return Ok(());
        }
        if let Some(graph) = self.cache.graph_mut(&old_key) {
            graph.remove_subtree(cut_node, new_rel_precision.clone());
        }
        if !self.cache.rekey(&old_key, new_key, new_rel_precision) {
            return Err(EngineError::Inconsistency(format!(
                "rekeying block '{}' under the refined precision failed",
                block.name
            )));
        }
        self.stats.rekeys += 1;
        Ok(())
    }

    /// Discard every cached result and reset the outer graph to its root.
    fn full_restart(
        &mut self,
        outer: &mut ReachGraph<D::State, D::Precision>,
        new_precision: &D::Precision,
    ) -> Result<(), EngineError> {
        self.cache.clear();
        self.stats.full_restarts += 1;
        let root = outer.root();
        let children: Vec<_> = outer
            .node(root)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        for child in children {
            outer.remove_subtree(child, new_precision.clone());
        }
        if let Some(node) = outer.node_mut(root) {
            node.precision = new_precision.clone();
        }
        outer.push_waitlist(root);
        info!("refinement triggered a full restart");
        Ok(())
    }
}

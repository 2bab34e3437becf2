//! Compositional transfer relation.
//!
//! Intercepts block boundaries during exploration: reduces the caller state,
//! consults the block cache, and either replays a cached summary or runs the
//! inner explorer to closure and populates the cache. Everything else is a
//! plain transfer step through the domain.

use crate::cache::{BlockCache, CacheKey, CacheLookup, CacheStatistics, Summary};
use crate::explorer::{self, ExploreOutcome};
use crate::shutdown::ShutdownCheck;
use loris_ir::abstraction::{AbstractDomain, DomainError, RelevanceFilter, StateReducer};
use loris_ir::blocks::{Block, BlockId, BlockPartition};
use loris_ir::cfg::{Cfg, NodeId};
use loris_ir::reach_graph::ReachGraph;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    /// A structural invariant did not hold, e.g. recomputation failed to
    /// relocate a target after invalidation. Fatal to the current
    /// refinement attempt.
    #[error("internal consistency failure: {0}")]
    Inconsistency(String),
    #[error("shutdown requested")]
    Shutdown,
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Result of one exploration step.
///
/// A reached target is not an error: it is a tagged value on the normal
/// return channel that short-circuits local exploration and bubbles to the
/// outermost caller.
#[derive(Debug)]
pub enum StepResult<D: AbstractDomain> {
    /// Successor states, each located at a CFG node.
    Successors(Vec<(NodeId, D::State, D::Precision)>),
    /// A target state was reached, here or inside a summarized block.
    TargetReached {
        cfg_node: NodeId,
        state: D::State,
        precision: D::Precision,
    },
}

/// The block-memoizing exploration engine.
///
/// Owns the block cache and the active-block stack; one instance per
/// verification run, threaded by reference through the exploration call
/// chain. Entering a block synchronously recurses into the inner explorer,
/// so call-stack depth equals block-nesting depth.
pub struct BamEngine<D: AbstractDomain, R, F> {
    pub(crate) domain: D,
    pub(crate) reducer: R,
    pub(crate) filter: F,
    pub(crate) cfg: Arc<Cfg>,
    pub(crate) partition: Arc<BlockPartition>,
    pub(crate) cache: BlockCache<D>,
    /// Active blocks, innermost last; the flag records whether the block's
    /// entry node has already been expanded in the current exploration.
    pub(crate) block_stack: Vec<(BlockId, bool)>,
    pub(crate) shutdown: ShutdownCheck,
    pub(crate) stats: CacheStatistics,
}

impl<D, R, F> BamEngine<D, R, F>
where
    D: AbstractDomain,
    R: StateReducer<D>,
    F: RelevanceFilter<D>,
{
    pub fn new(
        domain: D,
        reducer: R,
        filter: F,
        cfg: Arc<Cfg>,
        partition: Arc<BlockPartition>,
    ) -> Self {
        Self {
            domain,
            reducer,
            filter,
            cfg,
            partition,
            cache: BlockCache::new(),
            block_stack: Vec::new(),
            shutdown: ShutdownCheck::new(),
            stats: CacheStatistics::default(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownCheck) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn domain(&self) -> &D {
        &self.domain
    }

    pub fn cfg(&self) -> &Arc<Cfg> {
        &self.cfg
    }

    pub fn partition(&self) -> &Arc<BlockPartition> {
        &self.partition
    }

    pub fn cache(&self) -> &BlockCache<D> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut BlockCache<D> {
        &mut self.cache
    }

    pub fn statistics(&self) -> &CacheStatistics {
        &self.stats
    }

    /// The exploration step: abstract successors of `state` at `node`.
    ///
    /// Plain step when `node` is not a block entry, when the entered block is
    /// already the top of the active-block stack (same-block recursion is
    /// unsupported and degrades to uncached stepping), or when the entry
    /// belongs to the whole-program main block, which is never memoized.
    pub fn get_abstract_successors(
        &mut self,
        state: &D::State,
        precision: &D::Precision,
        node: NodeId,
    ) -> Result<StepResult<D>, EngineError> {
        if self.domain.is_bottom(state) {
            return Ok(StepResult::Successors(Vec::new()));
        }
        if let Some(block_id) = self.partition.block_for_entry(node) {
            if block_id == self.partition.main_block() {
                return self.plain_step(state, precision, node);
            }
            if self.block_stack.last().map(|&(top, _)| top) == Some(block_id) {
                // The first expansion at the entry is the block's own root;
                // only a later arrival back at the entry is recursion.
                let re_entry = matches!(self.block_stack.last(), Some(&(_, true)));
                if let Some(top) = self.block_stack.last_mut() {
                    top.1 = true;
                }
                if re_entry {
                    self.stats.recursion_downgrades += 1;
                    warn!(
                        block = %self.partition.block(block_id).name,
                        "same-block recursion detected; stepping without memoization"
                    );
                }
                return self.plain_step(state, precision, node);
            }
            return self.block_entry_step(block_id, state, precision, node);
        }
        self.plain_step(state, precision, node)
    }

    /// Uncached transfer through every outgoing edge.
    fn plain_step(
        &self,
        state: &D::State,
        precision: &D::Precision,
        node: NodeId,
    ) -> Result<StepResult<D>, EngineError> {
        let mut successors = Vec::new();
        for edge in self.cfg.successors(node) {
            for succ in self.domain.successors(state, precision, edge)? {
                if self.domain.is_bottom(&succ) {
                    continue;
                }
                if self.domain.is_target(edge.to, &succ) {
                    return Ok(StepResult::TargetReached {
                        cfg_node: edge.to,
                        state: succ,
                        precision: precision.clone(),
                    });
                }
                successors.push((edge.to, succ, precision.clone()));
            }
        }
        Ok(StepResult::Successors(successors))
    }

    fn block_entry_step(
        &mut self,
        block_id: BlockId,
        state: &D::State,
        precision: &D::Precision,
        node: NodeId,
    ) -> Result<StepResult<D>, EngineError> {
        debug_assert_eq!(self.partition.block(block_id).entry, node);
        self.shutdown.check()?;
        let partition = Arc::clone(&self.partition);
        let block = partition.block(block_id);

        let (key, reduced_state, reduced_precision) = self.reduce_and_key(block, state, precision);
        if self.domain.is_bottom(&reduced_state) {
            // Never cache vacuous results.
            debug!(block = %block.name, "infeasible block entry state; no successors");
            return Ok(StepResult::Successors(Vec::new()));
        }

        match self.cache.lookup(&key) {
            CacheLookup::Hit(summary) => {
                self.stats.hits += 1;
                debug!(block = %block.name, key = %key.state_fp, "summary cache hit");
                let summary = summary.clone();
                Ok(self.apply_summary(&summary, state, block, precision))
            }
            CacheLookup::Partial => {
                self.stats.partial_hits += 1;
                debug!(block = %block.name, key = %key.state_fp, "resuming partial block graph");
                self.run_block(key, block, reduced_state, reduced_precision, state, precision)
            }
            CacheLookup::Miss => {
                self.stats.misses += 1;
                debug!(block = %block.name, key = %key.state_fp, "block cache miss");
                self.run_block(key, block, reduced_state, reduced_precision, state, precision)
            }
        }
    }

    /// Reduce a caller-scope state/precision at a block boundary and build
    /// the cache key for the resulting block-local exploration.
    pub(crate) fn reduce_and_key(
        &self,
        block: &Block,
        state: &D::State,
        precision: &D::Precision,
    ) -> (CacheKey, D::State, D::Precision) {
        let reduced_state = self.reducer.reduce(state, block);
        let reduced_precision = self.filter.relevant_precision(block, precision);
        let key = CacheKey {
            block: block.id,
            state_fp: self.domain.state_fingerprint(&reduced_state),
            precision_fp: self.filter.relevant_fingerprint(block, precision),
        };
        (key, reduced_state, reduced_precision)
    }

    /// Replay a summary in caller scope.
    fn apply_summary(
        &self,
        summary: &Summary<D>,
        caller_state: &D::State,
        block: &Block,
        caller_precision: &D::Precision,
    ) -> StepResult<D> {
        match summary {
            Summary::TargetReached { cfg_node, state } => StepResult::TargetReached {
                cfg_node: *cfg_node,
                state: self.reducer.expand(caller_state, block, state),
                precision: caller_precision.clone(),
            },
            Summary::ExitStates(exits) => StepResult::Successors(
                exits
                    .iter()
                    .map(|(cfg_node, inner)| {
                        (
                            *cfg_node,
                            self.reducer.expand(caller_state, block, inner),
                            caller_precision.clone(),
                        )
                    })
                    .collect(),
            ),
        }
    }

    /// Seed or resume the block-local graph, explore to closure, store the
    /// graph and its summary, and replay the summary for the caller.
    fn run_block(
        &mut self,
        key: CacheKey,
        block: &Block,
        reduced_state: D::State,
        reduced_precision: D::Precision,
        caller_state: &D::State,
        caller_precision: &D::Precision,
    ) -> Result<StepResult<D>, EngineError> {
        let mut graph = match self.cache.take_graph(&key) {
            Some(graph) => graph,
            None => {
                self.cache
                    .insert_entry(key, reduced_state.clone(), reduced_precision.clone());
                ReachGraph::new(block.entry, reduced_state, reduced_precision)
            }
        };

        let outcome = self.explore_block(&mut graph, block.id);
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                // An aborted exploration must never commit a summary; the
                // partial graph stays cached and resumable.
                self.cache.store_graph(&key, graph);
                return Err(err);
            }
        };

        let summary = match outcome {
            ExploreOutcome::TargetFound(id) => {
                let node = graph.node(id).ok_or_else(|| {
                    EngineError::Inconsistency(
                        "block exploration reported a target node that is not in its graph".into(),
                    )
                })?;
                Summary::TargetReached {
                    cfg_node: node.cfg_node,
                    state: node.state.clone(),
                }
            }
            ExploreOutcome::Closed => {
                // Only abstraction points may serve as summary boundaries.
                let mut exits = Vec::new();
                for node in graph.nodes() {
                    if block.is_exit(node.cfg_node)
                        && self.partition.is_abstraction_point(node.cfg_node)
                        && !self.domain.is_bottom(&node.state)
                    {
                        exits.push((node.cfg_node, node.state.clone()));
                    }
                }
                Summary::ExitStates(exits)
            }
        };

        self.cache.store_graph(&key, graph);
        if !self.cache.store_summary(&key, summary.clone()) {
            return Err(EngineError::Inconsistency(
                "summary stored for a key with no cache entry".into(),
            ));
        }
        self.stats.summaries_stored += 1;
        Ok(self.apply_summary(&summary, caller_state, block, caller_precision))
    }

    /// Run the inner explorer on `graph` with `block_id` as the active
    /// block. Public so a driver can explore the main block directly.
    pub fn explore_block(
        &mut self,
        graph: &mut ReachGraph<D::State, D::Precision>,
        block_id: BlockId,
    ) -> Result<ExploreOutcome, EngineError> {
        let partition = Arc::clone(&self.partition);
        let block = partition.block(block_id);
        self.block_stack.push((block_id, false));
        let outcome = explorer::explore(self, graph, block);
        self.block_stack.pop();
        outcome
    }
}

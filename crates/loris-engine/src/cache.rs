//! Two-tier cache of block explorations: resumable reach graphs plus
//! summaries derived from closed graphs.
//!
//! Keys are content-addressed on the semantically reduced entry state and
//! the block-relative relevant precision, so differences in predicates a
//! block never mentions do not defeat reuse. There is no eviction policy
//! beyond explicit invalidation: verification runs are batch jobs, not
//! long-lived services.

use indexmap::IndexMap;
use loris_ir::abstraction::{AbstractDomain, Fingerprint};
use loris_ir::blocks::BlockId;
use loris_ir::cfg::NodeId;
use loris_ir::reach_graph::ReachGraph;
use serde::Serialize;

/// Content-addressed key for one block exploration.
///
/// Two keys are equal iff they name the same block, structurally equal
/// reduced entry states, and precisions that agree when restricted to the
/// block's relevant part. Deliberately coarser than full precision equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub block: BlockId,
    pub state_fp: Fingerprint,
    pub precision_fp: Fingerprint,
}

/// The cached net effect of exploring a block.
#[derive(Debug)]
pub enum Summary<D: AbstractDomain> {
    /// Exploration found a target state. Propagated unchanged to every
    /// caller as a first-class "unsafe" signal.
    TargetReached { cfg_node: NodeId, state: D::State },
    /// Block-local states at exit nodes, pre-expansion; one stored summary
    /// serves every caller with the same reduction.
    ExitStates(Vec<(NodeId, D::State)>),
}

// Manual impl: a derive would demand `D: Clone`, but only the states are
// cloned and those are `Clone` through the domain contract.
impl<D: AbstractDomain> Clone for Summary<D> {
    fn clone(&self) -> Self {
        match self {
            Summary::TargetReached { cfg_node, state } => Summary::TargetReached {
                cfg_node: *cfg_node,
                state: state.clone(),
            },
            Summary::ExitStates(exits) => Summary::ExitStates(exits.clone()),
        }
    }
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum CacheLookup<'a, D: AbstractDomain> {
    /// A closed exploration with a summary.
    Hit(&'a Summary<D>),
    /// A reach graph exists but has not been summarized; it can be resumed.
    Partial,
    Miss,
}

#[derive(Debug)]
struct CacheEntry<D: AbstractDomain> {
    /// `None` while the graph is checked out for exploration.
    graph: Option<ReachGraph<D::State, D::Precision>>,
    summary: Option<Summary<D>>,
    /// Reduced entry state and precision the graph was seeded with; needed
    /// to re-seed recomputation during counterexample reconstruction.
    entry_state: D::State,
    entry_precision: D::Precision,
}

/// Counters reported after a run.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheStatistics {
    pub hits: usize,
    pub partial_hits: usize,
    pub misses: usize,
    pub summaries_stored: usize,
    pub evictions: usize,
    pub rekeys: usize,
    pub full_restarts: usize,
    pub recursion_downgrades: usize,
    pub recomputations: usize,
}

/// Key → {in-progress graph | summary} store.
///
/// Invariants: a summary exists only for a key that holds (or held, while
/// checked out) a graph; at most one graph per key; evicting a key drops
/// graph and summary together.
#[derive(Debug)]
pub struct BlockCache<D: AbstractDomain> {
    entries: IndexMap<CacheKey, CacheEntry<D>>,
}

impl<D: AbstractDomain> Default for BlockCache<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: AbstractDomain> BlockCache<D> {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> CacheLookup<'_, D> {
        match self.entries.get(key) {
            Some(entry) => match &entry.summary {
                Some(summary) => CacheLookup::Hit(summary),
                None => CacheLookup::Partial,
            },
            None => CacheLookup::Miss,
        }
    }

    /// Create the entry for a fresh exploration. Replaces any previous
    /// entry state bookkeeping but never an existing graph.
    pub fn insert_entry(&mut self, key: CacheKey, entry_state: D::State, entry_precision: D::Precision) {
        self.entries.entry(key).or_insert(CacheEntry {
            graph: None,
            summary: None,
            entry_state,
            entry_precision,
        });
    }

    /// Check the graph out for (resumed) exploration.
    pub fn take_graph(&mut self, key: &CacheKey) -> Option<ReachGraph<D::State, D::Precision>> {
        self.entries.get_mut(key).and_then(|entry| entry.graph.take())
    }

    /// Check the graph back in. Returns false when the key has no entry.
    pub fn store_graph(
        &mut self,
        key: &CacheKey,
        graph: ReachGraph<D::State, D::Precision>,
    ) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.graph = Some(graph);
                true
            }
            None => false,
        }
    }

    /// Attach a summary to a closed exploration. Returns false when the key
    /// has no entry — a summary must never exist without its graph.
    pub fn store_summary(&mut self, key: &CacheKey, summary: Summary<D>) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.summary = Some(summary);
                true
            }
            None => false,
        }
    }

    /// Drop graph and summary for `key`.
    pub fn evict(&mut self, key: &CacheKey) -> bool {
        self.entries.shift_remove(key).is_some()
    }

    /// Drop only the summary, flagging the graph as stale but resumable.
    pub fn evict_summary(&mut self, key: &CacheKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => entry.summary.take().is_some(),
            None => false,
        }
    }

    /// Re-file an entry under a new key after a refinement-driven patch.
    /// The patched graph stays resumable; the summary does not move. Returns
    /// false when the old key is absent or the new key is already occupied.
    pub fn rekey(&mut self, old: &CacheKey, new: CacheKey, new_entry_precision: D::Precision) -> bool {
        if self.entries.contains_key(&new) {
            return false;
        }
        match self.entries.shift_remove(old) {
            Some(mut entry) => {
                entry.summary = None;
                entry.entry_precision = new_entry_precision;
                self.entries.insert(new, entry);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn has_summary(&self, key: &CacheKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.summary.is_some())
    }

    pub fn graph(&self, key: &CacheKey) -> Option<&ReachGraph<D::State, D::Precision>> {
        self.entries.get(key).and_then(|entry| entry.graph.as_ref())
    }

    pub fn graph_mut(
        &mut self,
        key: &CacheKey,
    ) -> Option<&mut ReachGraph<D::State, D::Precision>> {
        self.entries.get_mut(key).and_then(|entry| entry.graph.as_mut())
    }

    /// The reduced entry state and precision recorded for `key`.
    pub fn entry_seed(&self, key: &CacheKey) -> Option<(&D::State, &D::Precision)> {
        self.entries
            .get(key)
            .map(|entry| (&entry.entry_state, &entry.entry_precision))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.keys()
    }
}

//! Counterexample reconstruction across cached block graphs.
//!
//! The outer graph only contains the main-scope view of a target path; the
//! segments inside blocks live in cached graphs. Reconstruction stitches a
//! single path tree out of them: every summary edge in the outer graph is
//! replaced by the matching slice of the cached inner graph, reparenting the
//! inner root's children onto the caller node and wiring the inner match to
//! the summarized successor. Inner nodes are memoized per scope, so a node
//! shared by several paths becomes one tree node with several parents.
//!
//! A second pass renames the tree: states are recomputed top-down by
//! replaying CFG edges, merging at joins through the domain, so every node
//! ends up with a state in the outermost scope.

use crate::cache::CacheKey;
use crate::transfer::{BamEngine, EngineError};
use indexmap::{IndexMap, IndexSet};
use loris_ir::abstraction::{AbstractDomain, RelevanceFilter, StateReducer};
use loris_ir::blocks::BlockId;
use loris_ir::cfg::NodeId;
use loris_ir::reach_graph::{ReachGraph, ReachNodeId};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// One node of a reconstructed counterexample tree.
#[derive(Debug, Clone)]
pub struct PathTreeNode<D: AbstractDomain> {
    pub id: usize,
    pub cfg_node: NodeId,
    /// State in the scope of the graph the node came from.
    pub state: D::State,
    /// Outermost-scope state, filled in by the renaming pass.
    pub renamed: Option<D::State>,
    pub precision: D::Precision,
    pub parents: Vec<usize>,
    pub children: Vec<usize>,
}

/// The reconstructed slice of the explored state space that leads from the
/// initial state to a target, a DAG rooted at the initial node.
#[derive(Debug, Clone)]
pub struct PathTree<D: AbstractDomain> {
    nodes: Vec<PathTreeNode<D>>,
    root: usize,
    target: usize,
}

impl<D: AbstractDomain> PathTree<D> {
    fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            root: 0,
            target: 0,
        }
    }

    fn add_node(&mut self, cfg_node: NodeId, state: D::State, precision: D::Precision) -> usize {
        let id = self.nodes.len();
        self.nodes.push(PathTreeNode {
            id,
            cfg_node,
            state,
            renamed: None,
            precision,
            parents: Vec::new(),
            children: Vec::new(),
        });
        id
    }

    fn add_edge(&mut self, parent: usize, child: usize) {
        if !self.nodes[parent].children.contains(&child) {
            self.nodes[parent].children.push(child);
        }
        if !self.nodes[child].parents.contains(&parent) {
            self.nodes[child].parents.push(parent);
        }
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn node(&self, id: usize) -> &PathTreeNode<D> {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathTreeNode<D>> {
        self.nodes.iter()
    }

    /// One concrete root-to-target path through the tree, following each
    /// node's first recorded parent.
    pub fn primary_path(&self) -> Vec<usize> {
        let mut path = vec![self.target];
        let mut current = self.target;
        while current != self.root {
            let Some(&parent) = self.nodes[current].parents.first() else {
                break;
            };
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }
}

/// Backward closure over parent edges, including `from` itself.
fn ancestors<S, P>(graph: &ReachGraph<S, P>, from: ReachNodeId) -> IndexSet<ReachNodeId> {
    let mut set = IndexSet::new();
    let mut stack = vec![from];
    while let Some(id) = stack.pop() {
        if !set.insert(id) {
            continue;
        }
        if let Some(node) = graph.node(id) {
            stack.extend(node.parents.iter().copied());
        }
    }
    set
}

/// Reconstruct the path tree for `target` in the outer graph, grafting
/// cached inner graphs across every summary edge.
pub fn compute_counterexample_subgraph<D, R, F>(
    engine: &mut BamEngine<D, R, F>,
    outer: &ReachGraph<D::State, D::Precision>,
    target: ReachNodeId,
) -> Result<PathTree<D>, EngineError>
where
    D: AbstractDomain,
    R: StateReducer<D>,
    F: RelevanceFilter<D>,
{
    let mut tree = PathTree::empty();
    let mut memo: IndexMap<(Option<CacheKey>, ReachNodeId), usize> = IndexMap::new();
    let tree_target = graft_scope(engine, &mut tree, &mut memo, None, outer, target, None)?;
    let tree_root = *memo.get(&(None, outer.root())).ok_or_else(|| {
        EngineError::Inconsistency("outer root is missing from the counterexample subgraph".into())
    })?;
    tree.root = tree_root;
    tree.target = tree_target;
    debug!(nodes = tree.len(), "reconstructed counterexample subgraph");
    Ok(tree)
}

/// Graft the slice of `graph` that reaches `target` into the tree.
///
/// `attach` is the tree node standing in for this graph's root: for an inner
/// graph it is the caller-side block entry node, and the inner root itself is
/// discarded. For the outer graph it is `None` and the root gets its own
/// tree node. Returns the tree node for `target`.
fn graft_scope<D, R, F>(
    engine: &mut BamEngine<D, R, F>,
    tree: &mut PathTree<D>,
    memo: &mut IndexMap<(Option<CacheKey>, ReachNodeId), usize>,
    scope: Option<CacheKey>,
    graph: &ReachGraph<D::State, D::Precision>,
    target: ReachNodeId,
    attach: Option<usize>,
) -> Result<usize, EngineError>
where
    D: AbstractDomain,
    R: StateReducer<D>,
    F: RelevanceFilter<D>,
{
    let root = graph.root();
    let relevant = ancestors(graph, target);

    for &id in &relevant {
        if attach.is_some() && id == root {
            continue;
        }
        if memo.contains_key(&(scope, id)) {
            continue;
        }
        let node = graph.node(id).ok_or_else(|| {
            EngineError::Inconsistency("counterexample subgraph references a removed node".into())
        })?;
        let tree_id = tree.add_node(node.cfg_node, node.state.clone(), node.precision.clone());
        memo.insert((scope, id), tree_id);
    }

    for &id in &relevant {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let tree_parent = match (attach, id == root) {
            (Some(a), true) => a,
            _ => *memo.get(&(scope, id)).ok_or_else(|| {
                EngineError::Inconsistency("unmapped node in counterexample subgraph".into())
            })?,
        };
        let children: Vec<ReachNodeId> = node
            .children
            .iter()
            .copied()
            .filter(|c| relevant.contains(c))
            .collect();
        let (parent_cfg, parent_state, parent_precision) =
            (node.cfg_node, node.state.clone(), node.precision.clone());

        // Children of a block entry outside that block's own scope came
        // from summary expansion, even when the block body happens to have
        // a direct entry-to-exit edge. Only inside the block's own graph
        // (its root, or a recursion-downgraded re-entry) does the entry
        // step plainly.
        let seam_block = engine
            .partition
            .block_for_entry(parent_cfg)
            .filter(|&b| b != engine.partition.main_block())
            .filter(|&b| scope.map_or(true, |key| key.block != b));

        for child_id in children {
            let child = graph.node(child_id).ok_or_else(|| {
                EngineError::Inconsistency(
                    "counterexample subgraph references a removed node".into(),
                )
            })?;
            let tree_child = *memo.get(&(scope, child_id)).ok_or_else(|| {
                EngineError::Inconsistency("unmapped node in counterexample subgraph".into())
            })?;
            let Some(block_id) = seam_block else {
                if engine.cfg.edge_between(parent_cfg, child.cfg_node).is_none() {
                    return Err(EngineError::Inconsistency(
                        "graph edge matches neither a CFG edge nor a summary seam".into(),
                    ));
                }
                tree.add_edge(tree_parent, tree_child);
                continue;
            };

            let (child_cfg, child_state) = (child.cfg_node, child.state.clone());
            let partition = Arc::clone(&engine.partition);
            let block = partition.block(block_id);
            let (key, _, _) = engine.reduce_and_key(block, &parent_state, &parent_precision);
            let inner_graph = match engine.cache.graph(&key) {
                Some(graph) => graph.clone(),
                None => engine.recompute_block_graph(key, block_id)?,
            };
            let inner_match = inner_graph
                .find(|n| {
                    n.cfg_node == child_cfg
                        && engine.reducer.expand(&parent_state, block, &n.state) == child_state
                })
                .ok_or_else(|| {
                    EngineError::Inconsistency(format!(
                        "no state in block '{}' matches the summarized successor",
                        block.name
                    ))
                })?;
            let inner_tree = graft_scope(
                engine,
                tree,
                memo,
                Some(key),
                &inner_graph,
                inner_match,
                Some(tree_parent),
            )?;
            tree.add_edge(inner_tree, tree_child);
        }
    }

    match (attach, target == root) {
        (Some(a), true) => Ok(a),
        _ => memo.get(&(scope, target)).copied().ok_or_else(|| {
            EngineError::Inconsistency("counterexample target was not grafted".into())
        }),
    }
}

impl<D, R, F> BamEngine<D, R, F>
where
    D: AbstractDomain,
    R: StateReducer<D>,
    F: RelevanceFilter<D>,
{
    /// Re-explore a block whose cached graph is gone but whose entry seed
    /// survives, and put the result back in the cache.
    pub(crate) fn recompute_block_graph(
        &mut self,
        key: CacheKey,
        block_id: BlockId,
    ) -> Result<ReachGraph<D::State, D::Precision>, EngineError> {
        let (state, precision) = self
            .cache
            .entry_seed(&key)
            .map(|(s, p)| (s.clone(), p.clone()))
            .ok_or_else(|| {
                EngineError::Inconsistency(
                    "cannot recompute a block graph without its entry seed".into(),
                )
            })?;
        let entry = self.partition.block(block_id).entry;
        let mut graph = ReachGraph::new(entry, state, precision);
        self.explore_block(&mut graph, block_id)?;
        self.stats.recomputations += 1;
        self.cache.store_graph(&key, graph.clone());
        Ok(graph)
    }
}

/// Fill in `renamed` for every node: the root keeps its own state, every
/// other node is recomputed from its parents once all of them are renamed.
/// A parent connected by a CFG edge contributes its replayed successor; a
/// seam parent at the same CFG node passes its state through. Multiple
/// contributions merge through the domain.
pub fn rename_path_tree<D, R, F>(
    engine: &BamEngine<D, R, F>,
    tree: &mut PathTree<D>,
) -> Result<(), EngineError>
where
    D: AbstractDomain,
    R: StateReducer<D>,
    F: RelevanceFilter<D>,
{
    let root = tree.root;
    let root_state = tree.nodes[root].state.clone();
    tree.nodes[root].renamed = Some(root_state);

    let mut pending: Vec<usize> = tree.nodes.iter().map(|n| n.parents.len()).collect();
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        let children = tree.nodes[id].children.clone();
        for child in children {
            pending[child] -= 1;
            if pending[child] != 0 {
                continue;
            }
            let renamed = rename_node(engine, tree, child)?;
            tree.nodes[child].renamed = Some(renamed);
            queue.push_back(child);
        }
    }

    if tree.nodes[tree.target].renamed.is_none() {
        return Err(EngineError::Inconsistency(
            "renaming never reached the target node".into(),
        ));
    }
    Ok(())
}

fn rename_node<D, R, F>(
    engine: &BamEngine<D, R, F>,
    tree: &PathTree<D>,
    id: usize,
) -> Result<D::State, EngineError>
where
    D: AbstractDomain,
    R: StateReducer<D>,
    F: RelevanceFilter<D>,
{
    let node = &tree.nodes[id];
    let mut merged: Option<D::State> = None;
    for &parent_id in &node.parents {
        let parent = &tree.nodes[parent_id];
        let parent_renamed = parent.renamed.clone().ok_or_else(|| {
            EngineError::Inconsistency("renaming visited a node before its parents".into())
        })?;
        let contributions = match engine.cfg.edge_between(parent.cfg_node, node.cfg_node) {
            Some(edge) => {
                let successors =
                    engine
                        .domain
                        .successors(&parent_renamed, &node.precision, edge)?;
                if successors.is_empty() {
                    return Err(EngineError::Inconsistency(
                        "replaying a counterexample edge produced no successor".into(),
                    ));
                }
                successors
            }
            None if parent.cfg_node == node.cfg_node => vec![parent_renamed],
            None => {
                return Err(EngineError::Inconsistency(
                    "counterexample tree edge matches neither a CFG edge nor a seam".into(),
                ))
            }
        };
        for contribution in contributions {
            merged = Some(match merged {
                None => contribution,
                Some(state) => engine.domain.merge(&state, &contribution),
            });
        }
    }
    merged.ok_or_else(|| {
        EngineError::Inconsistency("non-root tree node has no parent contribution".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loris_ir::blocks::BlockPartition;
    use loris_ir::cfg::{Cfg, CfgOp, Expr};
    use loris_ir::value_domain::{TrackedVars, ValueAnalysis, ValueRelevance, ValueReducer, ValueState};

    fn straight_line_engine() -> (BamEngine<ValueAnalysis, ValueReducer, ValueRelevance>, Arc<Cfg>)
    {
        let mut cfg = Cfg::new();
        let n0 = cfg.add_node();
        let n1 = cfg.add_node();
        cfg.set_entry(n0);
        cfg.add_edge(
            n0,
            n1,
            CfgOp::Assign {
                var: "x".into(),
                expr: Expr::Const(3),
            },
        );
        let cfg = Arc::new(cfg);
        let partition = Arc::new(BlockPartition::from_cfg(&cfg).unwrap());
        let engine = BamEngine::new(
            ValueAnalysis::new(Arc::clone(&cfg)),
            ValueReducer,
            ValueRelevance,
            Arc::clone(&cfg),
            partition,
        );
        (engine, cfg)
    }

    #[test]
    fn primary_path_follows_first_parents() {
        let mut tree: PathTree<ValueAnalysis> = PathTree::empty();
        let a = tree.add_node(0, ValueState::top(), TrackedVars::none());
        let b = tree.add_node(1, ValueState::top(), TrackedVars::none());
        let c = tree.add_node(2, ValueState::top(), TrackedVars::none());
        tree.add_edge(a, b);
        tree.add_edge(b, c);
        tree.root = a;
        tree.target = c;
        assert_eq!(tree.primary_path(), vec![a, b, c]);
    }

    #[test]
    fn renaming_replays_cfg_edges_with_node_precision() {
        let (engine, _cfg) = straight_line_engine();
        let mut tree: PathTree<ValueAnalysis> = PathTree::empty();
        let precision = TrackedVars::of(["x"]);
        let a = tree.add_node(0, ValueState::top(), precision.clone());
        // Explored without tracking "x"; renaming under the refined
        // precision recovers the assigned value.
        let b = tree.add_node(1, ValueState::top(), precision);
        tree.add_edge(a, b);
        tree.root = a;
        tree.target = b;

        rename_path_tree(&engine, &mut tree).unwrap();
        let renamed = tree.node(b).renamed.as_ref().unwrap();
        assert_eq!(renamed.get("x"), Some(3));
    }

    #[test]
    fn renaming_passes_seam_parents_through() {
        let (engine, _cfg) = straight_line_engine();
        let mut tree: PathTree<ValueAnalysis> = PathTree::empty();
        let a = tree.add_node(1, ValueState::top().with("x", 3), TrackedVars::of(["x"]));
        let b = tree.add_node(1, ValueState::top(), TrackedVars::of(["x"]));
        tree.add_edge(a, b);
        tree.root = a;
        tree.target = b;

        rename_path_tree(&engine, &mut tree).unwrap();
        assert_eq!(tree.node(b).renamed.as_ref().unwrap().get("x"), Some(3));
    }
}

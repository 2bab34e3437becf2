//! Waitlist-driven reachability exploration of a single block.

use crate::transfer::{BamEngine, EngineError, StepResult};
use indexmap::IndexSet;
use loris_ir::abstraction::{AbstractDomain, RelevanceFilter, StateReducer};
use loris_ir::blocks::Block;
use loris_ir::reach_graph::{ReachGraph, ReachNodeId};

/// How a block exploration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExploreOutcome {
    /// The waitlist drained without reaching a target; the graph is closed
    /// and summarizable.
    Closed,
    /// A target state was reached at this node. Exploration stops at the
    /// first target; unexpanded frontier nodes stay on the waitlist.
    TargetFound(ReachNodeId),
}

/// Drain the graph's waitlist, expanding each frontier node through the
/// engine's transfer relation.
///
/// Nodes at the block's exits are not expanded: continuation past an exit
/// happens in the caller, once the exit state has been replayed through a
/// summary. A node whose state equals an existing node's state at the same
/// CFG location is covered and only contributes an edge.
pub(crate) fn explore<D, R, F>(
    engine: &mut BamEngine<D, R, F>,
    graph: &mut ReachGraph<D::State, D::Precision>,
    block: &Block,
) -> Result<ExploreOutcome, EngineError>
where
    D: AbstractDomain,
    R: StateReducer<D>,
    F: RelevanceFilter<D>,
{
    while let Some(id) = graph.pop_waitlist() {
        engine.shutdown.check()?;
        let (cfg_node, state, precision) = {
            let Some(node) = graph.node(id) else {
                continue;
            };
            (node.cfg_node, node.state.clone(), node.precision.clone())
        };
        if engine.halt_on_target(cfg_node, &state) {
            return Ok(ExploreOutcome::TargetFound(id));
        }
        if block.is_exit(cfg_node) {
            continue;
        }
        let trimmed = engine.trim_precision(cfg_node, &precision);
        match engine.get_abstract_successors(&state, &trimmed, cfg_node)? {
            StepResult::TargetReached {
                cfg_node: target_node,
                state: target_state,
                precision: target_precision,
            } => {
                let target_id = graph.add_node(target_node, target_state, target_precision, Some(id));
                return Ok(ExploreOutcome::TargetFound(target_id));
            }
            StepResult::Successors(successors) => {
                for (succ_node, succ_state, succ_precision) in successors {
                    if engine.domain.is_bottom(&succ_state) {
                        continue;
                    }
                    let covered = graph
                        .find(|n| n.cfg_node == succ_node && n.state == succ_state);
                    match covered {
                        // A covering node on the expanding node's own parent
                        // chain closes a state-preserving loop. The repeat
                        // reaches nothing new, and the edge would make the
                        // graph cyclic, which renaming cannot walk.
                        Some(existing) if is_ancestor(graph, existing, id) => {}
                        Some(existing) => {
                            graph.add_edge(id, existing);
                        }
                        None => {
                            graph.add_node(succ_node, succ_state, succ_precision, Some(id));
                        }
                    }
                }
            }
        }
    }
    Ok(ExploreOutcome::Closed)
}

/// Whether `candidate` is `node` itself or lies on one of its parent chains.
fn is_ancestor<S, P>(
    graph: &ReachGraph<S, P>,
    candidate: ReachNodeId,
    node: ReachNodeId,
) -> bool {
    let mut seen = IndexSet::new();
    let mut stack = vec![node];
    while let Some(id) = stack.pop() {
        if id == candidate {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(current) = graph.node(id) {
            stack.extend(current.parents.iter().copied());
        }
    }
    false
}

use crate::cfg::NodeId;
use std::collections::VecDeque;

/// A unique identifier for a node in a reachability graph.
pub type ReachNodeId = usize;

/// One explored abstract state, located at a CFG node.
#[derive(Debug, Clone)]
pub struct ReachNode<S, P> {
    pub id: ReachNodeId,
    pub cfg_node: NodeId,
    pub state: S,
    pub precision: P,
    pub parents: Vec<ReachNodeId>,
    pub children: Vec<ReachNodeId>,
}

/// The explored portion of the abstract state space, with explicit
/// parent/child structure.
///
/// Nodes live in an arena of slots addressed by index; removal leaves the
/// slot empty so an id is never reassigned to a different node within one
/// graph. The waitlist holds the frontier of nodes still to be expanded,
/// which makes a partially explored graph resumable.
#[derive(Debug, Clone)]
pub struct ReachGraph<S, P> {
    slots: Vec<Option<ReachNode<S, P>>>,
    root: ReachNodeId,
    waitlist: VecDeque<ReachNodeId>,
}

impl<S, P> ReachGraph<S, P> {
    /// Create a graph seeded with a single root node, already on the
    /// waitlist.
    pub fn new(cfg_node: NodeId, state: S, precision: P) -> Self {
        let root = ReachNode {
            id: 0,
            cfg_node,
            state,
            precision,
            parents: Vec::new(),
            children: Vec::new(),
        };
        Self {
            slots: vec![Some(root)],
            root: 0,
            waitlist: VecDeque::from([0]),
        }
    }

    pub fn root(&self) -> ReachNodeId {
        self.root
    }

    pub fn node(&self, id: ReachNodeId) -> Option<&ReachNode<S, P>> {
        self.slots.get(id).and_then(|slot| slot.as_ref())
    }

    pub fn node_mut(&mut self, id: ReachNodeId) -> Option<&mut ReachNode<S, P>> {
        self.slots.get_mut(id).and_then(|slot| slot.as_mut())
    }

    /// Add a node and put it on the waitlist. When `parent` is given, the
    /// edge is wired immediately.
    pub fn add_node(
        &mut self,
        cfg_node: NodeId,
        state: S,
        precision: P,
        parent: Option<ReachNodeId>,
    ) -> ReachNodeId {
        let id = self.slots.len();
        self.slots.push(Some(ReachNode {
            id,
            cfg_node,
            state,
            precision,
            parents: Vec::new(),
            children: Vec::new(),
        }));
        if let Some(parent) = parent {
            self.add_edge(parent, id);
        }
        self.waitlist.push_back(id);
        id
    }

    pub fn add_edge(&mut self, parent: ReachNodeId, child: ReachNodeId) {
        if let Some(node) = self.node_mut(parent) {
            if !node.children.contains(&child) {
                node.children.push(child);
            }
        }
        if let Some(node) = self.node_mut(child) {
            if !node.parents.contains(&parent) {
                node.parents.push(parent);
            }
        }
    }

    /// Pop the next live frontier node. Stale waitlist entries pointing at
    /// removed slots are skipped.
    pub fn pop_waitlist(&mut self) -> Option<ReachNodeId> {
        while let Some(id) = self.waitlist.pop_front() {
            if self.node(id).is_some() {
                return Some(id);
            }
        }
        None
    }

    pub fn push_waitlist(&mut self, id: ReachNodeId) {
        if !self.waitlist.contains(&id) {
            self.waitlist.push_back(id);
        }
    }

    pub fn waitlist_is_empty(&self) -> bool {
        self.waitlist.iter().all(|&id| self.node(id).is_none())
    }

    /// First live node satisfying the predicate, in creation order.
    pub fn find(&self, mut predicate: impl FnMut(&ReachNode<S, P>) -> bool) -> Option<ReachNodeId> {
        self.slots
            .iter()
            .flatten()
            .find(|node| predicate(node))
            .map(|node| node.id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ReachNode<S, P>> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S, P: Clone> ReachGraph<S, P> {
    /// Remove `target` and every descendant, repark the surviving parents on
    /// the waitlist with `new_precision`, and clean their edge lists.
    ///
    /// The root itself is never removed; removing the root is expressed by
    /// the caller as eviction of the whole graph. Returns false when
    /// `target` is the root or is not a live node.
    pub fn remove_subtree(&mut self, target: ReachNodeId, new_precision: P) -> bool {
        if target == self.root || self.node(target).is_none() {
            return false;
        }

        // Children-closure from the removal point.
        let mut doomed = Vec::new();
        let mut seen = vec![false; self.slots.len()];
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if seen[id] {
                continue;
            }
            seen[id] = true;
            doomed.push(id);
            if let Some(node) = self.node(id) {
                stack.extend(node.children.iter().copied());
            }
        }

        for &id in &doomed {
            self.slots[id] = None;
        }

        // Surviving parents lose the removed children and become frontier
        // nodes again, under the refined precision.
        let survivors: Vec<ReachNodeId> = self
            .slots
            .iter()
            .flatten()
            .filter(|node| node.children.iter().any(|&c| seen[c]))
            .map(|node| node.id)
            .collect();
        for id in survivors {
            if let Some(node) = self.node_mut(id) {
                node.children.retain(|&c| !seen[c]);
                node.precision = new_precision.clone();
            }
            self.push_waitlist(id);
        }
        true
    }
}

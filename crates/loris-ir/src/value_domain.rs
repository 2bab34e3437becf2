//! Default explicit-value analysis domain.
//!
//! States are partial maps from variable to known integer value; anything
//! absent is unknown. Precision is the set of tracked variables: assignments
//! to untracked variables fall to unknown, which is what makes the analysis
//! refinable by growing the tracked set after a spurious counterexample.

use crate::abstraction::{
    AbstractDomain, DomainError, Fingerprint, RelevanceFilter, StateReducer,
};
use crate::blocks::Block;
use crate::cfg::{Cfg, CfgEdge, CfgOp, NodeId};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// A partial assignment of integer values to variables.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueState {
    values: IndexMap<String, i64>,
    bottom: bool,
}

impl ValueState {
    /// The empty assignment: everything unknown.
    pub fn top() -> Self {
        Self::default()
    }

    /// The unsatisfiable state.
    pub fn bottom() -> Self {
        Self {
            values: IndexMap::new(),
            bottom: true,
        }
    }

    pub fn with(mut self, var: &str, value: i64) -> Self {
        self.values.insert(var.to_string(), value);
        self
    }

    pub fn get(&self, var: &str) -> Option<i64> {
        if self.bottom {
            return None;
        }
        self.values.get(var).copied()
    }

    pub fn set(&mut self, var: &str, value: i64) {
        self.values.insert(var.to_string(), value);
    }

    pub fn forget(&mut self, var: &str) {
        self.values.shift_remove(var);
    }

    pub fn is_bottom(&self) -> bool {
        self.bottom
    }

    pub fn known_vars(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }
}

impl fmt::Display for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bottom {
            return write!(f, "<bottom>");
        }
        let mut pairs: Vec<(&String, &i64)> = self.values.iter().collect();
        pairs.sort();
        write!(f, "{{")?;
        for (i, (var, value)) in pairs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{var}={value}")?;
        }
        write!(f, "}}")
    }
}

/// The set of variables the analysis currently tracks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackedVars(pub BTreeSet<String>);

impl TrackedVars {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn of<I: IntoIterator<Item = S>, S: Into<String>>(vars: I) -> Self {
        Self(vars.into_iter().map(Into::into).collect())
    }

    pub fn tracks(&self, var: &str) -> bool {
        self.0.contains(var)
    }

    pub fn union(&self, other: &TrackedVars) -> TrackedVars {
        TrackedVars(self.0.union(&other.0).cloned().collect())
    }
}

/// The explicit-value abstract domain over a CFG.
#[derive(Debug, Clone)]
pub struct ValueAnalysis {
    cfg: Arc<Cfg>,
}

impl ValueAnalysis {
    pub fn new(cfg: Arc<Cfg>) -> Self {
        Self { cfg }
    }

    pub fn cfg(&self) -> &Arc<Cfg> {
        &self.cfg
    }
}

impl AbstractDomain for ValueAnalysis {
    type State = ValueState;
    type Precision = TrackedVars;

    fn successors(
        &self,
        state: &ValueState,
        precision: &TrackedVars,
        edge: &CfgEdge,
    ) -> Result<Vec<ValueState>, DomainError> {
        if state.bottom {
            return Ok(Vec::new());
        }
        let lookup = |name: &str| state.get(name);
        match &edge.op {
            CfgOp::Assign { var, expr } => {
                let mut next = state.clone();
                match expr.eval(&lookup) {
                    Some(value) if precision.tracks(var) => next.set(var, value),
                    _ => next.forget(var),
                }
                Ok(vec![next])
            }
            CfgOp::Assume { cond, polarity } => match cond.eval(&lookup) {
                Some(value) if value == *polarity => Ok(vec![state.clone()]),
                Some(_) => Ok(Vec::new()),
                // Undecidable under the current tracking: over-approximate.
                None => Ok(vec![state.clone()]),
            },
            CfgOp::Skip | CfgOp::CallEnter { .. } | CfgOp::CallReturn { .. } => {
                Ok(vec![state.clone()])
            }
        }
    }

    fn merge(&self, a: &ValueState, b: &ValueState) -> ValueState {
        if a.bottom {
            return b.clone();
        }
        if b.bottom {
            return a.clone();
        }
        let mut merged = ValueState::top();
        for (var, &value) in &a.values {
            if b.get(var) == Some(value) {
                merged.set(var, value);
            }
        }
        merged
    }

    fn is_target(&self, node: NodeId, state: &ValueState) -> bool {
        self.cfg.is_error(node) && !state.bottom
    }

    fn is_bottom(&self, state: &ValueState) -> bool {
        state.bottom
    }

    fn state_fingerprint(&self, state: &ValueState) -> Fingerprint {
        let mut builder = Fingerprint::builder().push_u64(u64::from(state.bottom));
        let mut pairs: Vec<(&String, &i64)> = state.values.iter().collect();
        pairs.sort();
        for (var, &value) in pairs {
            builder = builder.push_str(var).push_i64(value);
        }
        builder.finish()
    }
}

/// Reducer for the value domain: a block sees only the variables it
/// references.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueReducer;

impl StateReducer<ValueAnalysis> for ValueReducer {
    fn reduce(&self, state: &ValueState, block: &Block) -> ValueState {
        if state.bottom {
            return ValueState::bottom();
        }
        let mut reduced = ValueState::top();
        for var in &block.referenced_vars {
            if let Some(value) = state.get(var) {
                reduced.set(var, value);
            }
        }
        reduced
    }

    fn expand(&self, root_state: &ValueState, block: &Block, inner: &ValueState) -> ValueState {
        if inner.bottom {
            return ValueState::bottom();
        }
        let mut expanded = root_state.clone();
        for var in &block.referenced_vars {
            match inner.get(var) {
                Some(value) => expanded.set(var, value),
                None => expanded.forget(var),
            }
        }
        expanded
    }
}

/// Relevance filter for the value domain: a block's relevant precision is
/// the tracked set restricted to the block's referenced variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueRelevance;

impl RelevanceFilter<ValueAnalysis> for ValueRelevance {
    fn relevant_precision(&self, block: &Block, precision: &TrackedVars) -> TrackedVars {
        TrackedVars(
            precision
                .0
                .iter()
                .filter(|var| block.referenced_vars.contains(*var))
                .cloned()
                .collect(),
        )
    }

    fn relevant_fingerprint(&self, block: &Block, precision: &TrackedVars) -> Fingerprint {
        let relevant = self.relevant_precision(block, precision);
        let mut builder = Fingerprint::builder().push_u64(block.id as u64);
        for var in &relevant.0 {
            builder = builder.push_str(var);
        }
        builder.finish()
    }
}

/// Pick a refined precision from a spurious path: every variable an assume
/// on the path constrains, plus the variables that feed those through
/// assignments (backward closure along the path).
pub fn precision_for_path(cfg: &Cfg, path: &[NodeId], current: &TrackedVars) -> TrackedVars {
    let mut needed: BTreeSet<String> = BTreeSet::new();
    let edges: Vec<&CfgEdge> = path
        .windows(2)
        .filter_map(|pair| cfg.edge_between(pair[0], pair[1]))
        .collect();
    for edge in edges.iter().rev() {
        match &edge.op {
            CfgOp::Assume { cond, .. } => {
                cond.collect_vars(&mut needed);
            }
            CfgOp::Assign { var, expr } => {
                if needed.contains(var) {
                    expr.collect_vars(&mut needed);
                }
            }
            _ => {}
        }
    }
    TrackedVars(needed).union(current)
}

/// Index of the first path node whose state depends on any of `vars`: the
/// node right after the first edge that touches one of them. Everything
/// above it was explored with states the refinement cannot change, so it is
/// the safe point to restart exploration from.
pub fn refinement_pivot(cfg: &Cfg, path: &[NodeId], vars: &TrackedVars) -> usize {
    for (index, pair) in path.windows(2).enumerate() {
        let Some(edge) = cfg.edge_between(pair[0], pair[1]) else {
            continue;
        };
        if edge.op.referenced_vars().iter().any(|v| vars.tracks(v)) {
            return index + 1;
        }
    }
    path.len().saturating_sub(1)
}

use indexmap::IndexSet;
use std::collections::BTreeSet;
use std::fmt;

/// A unique identifier for a control-flow node.
pub type NodeId = usize;
/// A unique identifier for a control-flow edge.
pub type EdgeId = usize;

/// An integer expression over program variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Const(i64),
    Var(String),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn var(name: &str) -> Self {
        Expr::Var(name.to_string())
    }

    /// Collect every variable read by this expression.
    pub fn collect_vars(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(name) => {
                out.insert(name.clone());
            }
            Expr::Add(lhs, rhs) | Expr::Sub(lhs, rhs) | Expr::Mul(lhs, rhs) => {
                lhs.collect_vars(out);
                rhs.collect_vars(out);
            }
        }
    }

    /// Evaluate under a partial environment. `None` when any read variable
    /// has no known value.
    pub fn eval(&self, lookup: &dyn Fn(&str) -> Option<i64>) -> Option<i64> {
        match self {
            Expr::Const(c) => Some(*c),
            Expr::Var(name) => lookup(name),
            Expr::Add(lhs, rhs) => Some(lhs.eval(lookup)?.wrapping_add(rhs.eval(lookup)?)),
            Expr::Sub(lhs, rhs) => Some(lhs.eval(lookup)?.wrapping_sub(rhs.eval(lookup)?)),
            Expr::Mul(lhs, rhs) => Some(lhs.eval(lookup)?.wrapping_mul(rhs.eval(lookup)?)),
        }
    }
}

/// Comparison operator in an assume condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
}

impl CmpOp {
    pub fn apply(&self, lhs: i64, rhs: i64) -> bool {
        match self {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmpOp::Eq => write!(f, "=="),
            CmpOp::Ne => write!(f, "!="),
            CmpOp::Lt => write!(f, "<"),
            CmpOp::Le => write!(f, "<="),
        }
    }
}

/// A branch condition `lhs op rhs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cond {
    pub lhs: Expr,
    pub op: CmpOp,
    pub rhs: Expr,
}

impl Cond {
    /// Evaluate under a partial environment. `None` when undecidable.
    pub fn eval(&self, lookup: &dyn Fn(&str) -> Option<i64>) -> Option<bool> {
        Some(self.op.apply(self.lhs.eval(lookup)?, self.rhs.eval(lookup)?))
    }

    pub fn collect_vars(&self, out: &mut BTreeSet<String>) {
        self.lhs.collect_vars(out);
        self.rhs.collect_vars(out);
    }
}

/// The operation labelling a control-flow edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfgOp {
    /// `var := expr`.
    Assign { var: String, expr: Expr },
    /// Branch edge: passable iff `cond` evaluates to `polarity`.
    Assume { cond: Cond, polarity: bool },
    /// No-op edge.
    Skip,
    /// Call-site edge into the entry node of `callee`'s body.
    CallEnter { callee: String },
    /// Return edge from an exit node of `callee`'s body to the return site.
    CallReturn { callee: String },
}

impl CfgOp {
    /// Variables read or written by this operation.
    pub fn referenced_vars(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        match self {
            CfgOp::Assign { var, expr } => {
                out.insert(var.clone());
                expr.collect_vars(&mut out);
            }
            CfgOp::Assume { cond, .. } => cond.collect_vars(&mut out),
            CfgOp::Skip | CfgOp::CallEnter { .. } | CfgOp::CallReturn { .. } => {}
        }
        out
    }
}

/// A labelled control-flow edge.
#[derive(Debug, Clone)]
pub struct CfgEdge {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,
    pub op: CfgOp,
}

/// A control-flow graph over numbered nodes with labelled edges.
///
/// Nodes carry no payload of their own; all semantics lives on edges. A
/// distinguished entry node and a set of error nodes mark where analysis
/// starts and what counts as a reached safety violation.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    num_nodes: usize,
    edges: Vec<CfgEdge>,
    succ: Vec<Vec<EdgeId>>,
    pred: Vec<Vec<EdgeId>>,
    entry: NodeId,
    error_nodes: IndexSet<NodeId>,
}

impl Cfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self) -> NodeId {
        let id = self.num_nodes;
        self.num_nodes += 1;
        self.succ.push(Vec::new());
        self.pred.push(Vec::new());
        id
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId, op: CfgOp) -> EdgeId {
        let id = self.edges.len();
        self.edges.push(CfgEdge { id, from, to, op });
        self.succ[from].push(id);
        self.pred[to].push(id);
        id
    }

    pub fn set_entry(&mut self, node: NodeId) {
        self.entry = node;
    }

    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn mark_error(&mut self, node: NodeId) {
        self.error_nodes.insert(node);
    }

    pub fn is_error(&self, node: NodeId) -> bool {
        self.error_nodes.contains(&node)
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn edge(&self, id: EdgeId) -> &CfgEdge {
        &self.edges[id]
    }

    /// Outgoing edges of `node`.
    pub fn successors(&self, node: NodeId) -> impl Iterator<Item = &CfgEdge> {
        self.succ[node].iter().map(move |&id| &self.edges[id])
    }

    /// Incoming edges of `node`.
    pub fn predecessors(&self, node: NodeId) -> impl Iterator<Item = &CfgEdge> {
        self.pred[node].iter().map(move |&id| &self.edges[id])
    }

    /// The edge connecting `from` to `to` directly, if one exists.
    pub fn edge_between(&self, from: NodeId, to: NodeId) -> Option<&CfgEdge> {
        self.succ[from]
            .iter()
            .map(|&id| &self.edges[id])
            .find(|edge| edge.to == to)
    }

    /// Whether `node` has no outgoing edges.
    pub fn is_sink(&self, node: NodeId) -> bool {
        self.succ[node].is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = &CfgEdge> {
        self.edges.iter()
    }
}

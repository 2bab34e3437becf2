use crate::cfg::{Cfg, CfgOp, NodeId};
use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeSet;
use thiserror::Error;

/// A unique identifier for a block.
pub type BlockId = usize;

/// A delimited control-flow region treated as a memoizable analysis unit.
///
/// Blocks have exactly one entry node and a set of exit nodes. They may nest
/// but never partially overlap. Created once per run, immutable afterwards.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    pub entry: NodeId,
    pub exits: IndexSet<NodeId>,
    pub nodes: IndexSet<NodeId>,
    /// Variables read or written anywhere inside the block. Drives state
    /// reduction and precision relevance.
    pub referenced_vars: BTreeSet<String>,
}

impl Block {
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    pub fn is_exit(&self, node: NodeId) -> bool {
        self.exits.contains(&node)
    }
}

/// Error while building the block partition from a CFG.
#[derive(Debug, Error)]
pub enum BlockBuildError {
    #[error("callee '{callee}' has call edges into distinct entry nodes {first} and {second}")]
    AmbiguousEntry {
        callee: String,
        first: NodeId,
        second: NodeId,
    },
    #[error("return edge for callee '{callee}' at node {node} has no matching call edge")]
    UnmatchedReturn { callee: String, node: NodeId },
}

/// Static partition of a CFG into blocks, stable for the whole run.
///
/// One block per function body (the region between `CallEnter` and
/// `CallReturn` markers for a callee) plus the whole-program main block.
#[derive(Debug, Clone)]
pub struct BlockPartition {
    blocks: Vec<Block>,
    entry_to_block: IndexMap<NodeId, BlockId>,
    exit_nodes: IndexSet<NodeId>,
    main: BlockId,
}

impl BlockPartition {
    /// Build the partition by scanning call-marker edges.
    pub fn from_cfg(cfg: &Cfg) -> Result<Self, BlockBuildError> {
        let mut entries: IndexMap<String, NodeId> = IndexMap::new();
        let mut exits: IndexMap<String, IndexSet<NodeId>> = IndexMap::new();

        for edge in cfg.edges() {
            match &edge.op {
                CfgOp::CallEnter { callee } => {
                    if let Some(&existing) = entries.get(callee) {
                        if existing != edge.to {
                            return Err(BlockBuildError::AmbiguousEntry {
                                callee: callee.clone(),
                                first: existing,
                                second: edge.to,
                            });
                        }
                    } else {
                        entries.insert(callee.clone(), edge.to);
                    }
                }
                CfgOp::CallReturn { callee } => {
                    exits.entry(callee.clone()).or_default().insert(edge.from);
                }
                _ => {}
            }
        }
        for (callee, exit_set) in &exits {
            if !entries.contains_key(callee) {
                return Err(BlockBuildError::UnmatchedReturn {
                    callee: callee.clone(),
                    node: *exit_set.first().unwrap_or(&0),
                });
            }
        }

        let mut blocks = Vec::new();
        let mut entry_to_block = IndexMap::new();
        let mut exit_nodes = IndexSet::new();

        for (callee, &entry) in &entries {
            let block_exits = exits.get(callee).cloned().unwrap_or_default();
            let nodes = body_nodes(cfg, entry, callee);
            let referenced_vars = referenced_vars_of(cfg, &nodes, callee);
            let id = blocks.len();
            entry_to_block.insert(entry, id);
            exit_nodes.extend(block_exits.iter().copied());
            blocks.push(Block {
                id,
                name: callee.clone(),
                entry,
                exits: block_exits,
                nodes,
                referenced_vars,
            });
        }

        // The whole-program main block covers everything and exits at sinks.
        let main = blocks.len();
        let all_nodes: IndexSet<NodeId> = (0..cfg.num_nodes()).collect();
        let sinks: IndexSet<NodeId> = (0..cfg.num_nodes()).filter(|&n| cfg.is_sink(n)).collect();
        let mut all_vars = BTreeSet::new();
        for edge in cfg.edges() {
            all_vars.extend(edge.op.referenced_vars());
        }
        entry_to_block.insert(cfg.entry(), main);
        blocks.push(Block {
            id: main,
            name: "main".to_string(),
            entry: cfg.entry(),
            exits: sinks,
            nodes: all_nodes,
            referenced_vars: all_vars,
        });

        Ok(Self {
            blocks,
            entry_to_block,
            exit_nodes,
            main,
        })
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    /// The block whose entry node is `node`, if any.
    pub fn block_for_entry(&self, node: NodeId) -> Option<BlockId> {
        self.entry_to_block.get(&node).copied()
    }

    pub fn is_entry(&self, node: NodeId) -> bool {
        self.entry_to_block.contains_key(&node)
    }

    /// Whether `node` is an exit node of some non-main block.
    pub fn is_exit(&self, node: NodeId) -> bool {
        self.exit_nodes.contains(&node)
    }

    pub fn main_block(&self) -> BlockId {
        self.main
    }

    /// Only abstraction points may serve as interprocedural summary
    /// boundaries.
    pub fn is_abstraction_point(&self, node: NodeId) -> bool {
        self.is_entry(node) || self.is_exit(node)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }
}

/// Nodes of a function body: forward closure from the entry that never leaves
/// through the callee's own return edges. Nested calls are traversed, so
/// nested blocks' nodes are included (blocks nest, never partially overlap).
fn body_nodes(cfg: &Cfg, entry: NodeId, callee: &str) -> IndexSet<NodeId> {
    let mut nodes = IndexSet::new();
    let mut stack = vec![entry];
    while let Some(node) = stack.pop() {
        if !nodes.insert(node) {
            continue;
        }
        for edge in cfg.successors(node) {
            if let CfgOp::CallReturn { callee: c } = &edge.op {
                if c == callee {
                    continue;
                }
            }
            stack.push(edge.to);
        }
    }
    nodes
}

fn referenced_vars_of(cfg: &Cfg, nodes: &IndexSet<NodeId>, callee: &str) -> BTreeSet<String> {
    let mut vars = BTreeSet::new();
    for &node in nodes {
        for edge in cfg.successors(node) {
            if let CfgOp::CallReturn { callee: c } = &edge.op {
                if c == callee {
                    continue;
                }
            }
            vars.extend(edge.op.referenced_vars());
        }
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{CmpOp, Cond, Expr};

    /// main: 0 -CallEnter(f)-> 1, f body: 1 -assign y:=x+1-> 2,
    /// 2 -CallReturn(f)-> 3, main continues 3 -assume y<5-> 4.
    fn call_cfg() -> Cfg {
        let mut cfg = Cfg::new();
        let n0 = cfg.add_node();
        let n1 = cfg.add_node();
        let n2 = cfg.add_node();
        let n3 = cfg.add_node();
        let n4 = cfg.add_node();
        cfg.set_entry(n0);
        cfg.add_edge(n0, n1, CfgOp::CallEnter { callee: "f".into() });
        cfg.add_edge(
            n1,
            n2,
            CfgOp::Assign {
                var: "y".into(),
                expr: Expr::Add(Box::new(Expr::var("x")), Box::new(Expr::Const(1))),
            },
        );
        cfg.add_edge(n2, n3, CfgOp::CallReturn { callee: "f".into() });
        cfg.add_edge(
            n3,
            n4,
            CfgOp::Assume {
                cond: Cond {
                    lhs: Expr::var("y"),
                    op: CmpOp::Lt,
                    rhs: Expr::Const(5),
                },
                polarity: true,
            },
        );
        cfg
    }

    #[test]
    fn function_body_becomes_a_block() {
        let cfg = call_cfg();
        let partition = BlockPartition::from_cfg(&cfg).unwrap();
        let f = partition.block_for_entry(1).expect("f block");
        let block = partition.block(f);
        assert_eq!(block.name, "f");
        assert_eq!(block.entry, 1);
        assert!(block.is_exit(2));
        assert!(block.contains(1) && block.contains(2));
        assert!(!block.contains(0));
        assert!(block.referenced_vars.contains("x"));
        assert!(block.referenced_vars.contains("y"));
    }

    #[test]
    fn main_block_covers_everything() {
        let cfg = call_cfg();
        let partition = BlockPartition::from_cfg(&cfg).unwrap();
        let main = partition.block(partition.main_block());
        assert_eq!(main.entry, 0);
        assert_eq!(main.nodes.len(), 5);
        assert!(main.is_exit(4));
    }

    #[test]
    fn abstraction_points_are_entries_and_exits() {
        let cfg = call_cfg();
        let partition = BlockPartition::from_cfg(&cfg).unwrap();
        assert!(partition.is_abstraction_point(1));
        assert!(partition.is_abstraction_point(2));
        assert!(!partition.is_abstraction_point(3));
    }

    #[test]
    fn ambiguous_entry_is_rejected() {
        let mut cfg = Cfg::new();
        let n0 = cfg.add_node();
        let n1 = cfg.add_node();
        let n2 = cfg.add_node();
        cfg.set_entry(n0);
        cfg.add_edge(n0, n1, CfgOp::CallEnter { callee: "f".into() });
        cfg.add_edge(n0, n2, CfgOp::CallEnter { callee: "f".into() });
        assert!(matches!(
            BlockPartition::from_cfg(&cfg),
            Err(BlockBuildError::AmbiguousEntry { .. })
        ));
    }
}

#![doc = include_str!("../README.md")]

//! Loris block-memoization engine.
//!
//! This crate implements the memoization/refinement core: the two-tier block
//! cache, the compositional transfer relation, boundary precision trimming,
//! the inner fixed-point explorer, refinement-time cache invalidation, and
//! counterexample reconstruction with global renaming.

pub mod cache;
pub mod counterexample;
pub mod explorer;
pub mod precision;
pub mod refine;
pub mod result;
pub mod shutdown;
pub mod transfer;

pub use cache::{BlockCache, CacheKey, CacheLookup, CacheStatistics, Summary};
pub use counterexample::{
    compute_counterexample_subgraph, rename_path_tree, PathTree, PathTreeNode,
};
pub use explorer::ExploreOutcome;
pub use refine::CexPathStep;
pub use result::{run_reachability, Refinement, RefinementReport, VerificationOutcome};
pub use shutdown::ShutdownCheck;
pub use transfer::{BamEngine, EngineError, StepResult};

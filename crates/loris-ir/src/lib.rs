#![doc = include_str!("../README.md")]

//! Loris program model.
//!
//! This crate defines the control-flow graph with its operation language,
//! the block partition that delimits memoizable regions, the arena-based
//! reachability graph with subtree removal, the abstract-domain contract
//! (reduction, expansion, relevance filtering, merge), and a default
//! explicit-value analysis domain.

pub mod abstraction;
pub mod blocks;
pub mod cfg;
pub mod reach_graph;
pub mod value_domain;

use crate::blocks::Block;
use crate::cfg::{CfgEdge, NodeId};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// A 32-byte content fingerprint over a canonical encoding.
///
/// Cache keys compare fingerprints instead of full values, so two precisions
/// that agree on a block's relevant part key identically even when they
/// differ elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn builder() -> FingerprintBuilder {
        FingerprintBuilder(Sha256::new())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Incremental fingerprint construction over typed fields.
pub struct FingerprintBuilder(Sha256);

impl FingerprintBuilder {
    pub fn push_str(mut self, value: &str) -> Self {
        self.0.update((value.len() as u64).to_le_bytes());
        self.0.update(value.as_bytes());
        self
    }

    pub fn push_i64(mut self, value: i64) -> Self {
        self.0.update(value.to_le_bytes());
        self
    }

    pub fn push_u64(mut self, value: u64) -> Self {
        self.0.update(value.to_le_bytes());
        self
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.0.finalize().into())
    }
}

/// Error propagated out of a domain's transfer evaluation.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("domain evaluation failed: {0}")]
    Eval(String),
}

/// The abstract-state lattice the engine explores.
///
/// The engine treats states and precisions as opaque; it only needs the
/// transfer relation, the join used by counterexample renaming, target and
/// bottom tests, and a structural fingerprint for cache keys.
pub trait AbstractDomain {
    type State: Clone + PartialEq + fmt::Debug;
    type Precision: Clone + PartialEq + fmt::Debug;

    /// Abstract post along one CFG edge. An empty result means the edge is
    /// not passable from `state` under `precision`.
    fn successors(
        &self,
        state: &Self::State,
        precision: &Self::Precision,
        edge: &CfgEdge,
    ) -> Result<Vec<Self::State>, DomainError>;

    /// Join of two states at the same location. Used only by counterexample
    /// renaming when a grafted node has several parents.
    fn merge(&self, a: &Self::State, b: &Self::State) -> Self::State;

    /// Whether `state` at `node` signals a reached safety violation.
    fn is_target(&self, node: NodeId, state: &Self::State) -> bool;

    /// Whether `state` is unsatisfiable.
    fn is_bottom(&self, state: &Self::State) -> bool;

    fn state_fingerprint(&self, state: &Self::State) -> Fingerprint;
}

/// Translation between caller-visible and block-local state representations.
///
/// `expand` must reintroduce exactly what `reduce` dropped, using the root
/// (caller) state as the source of truth.
pub trait StateReducer<D: AbstractDomain> {
    fn reduce(&self, state: &D::State, block: &Block) -> D::State;
    fn expand(&self, root_state: &D::State, block: &Block, inner: &D::State) -> D::State;
}

/// Projection of a precision onto the part relevant to a block. Used for
/// cache keys and boundary precision narrowing.
pub trait RelevanceFilter<D: AbstractDomain> {
    fn relevant_precision(&self, block: &Block, precision: &D::Precision) -> D::Precision;
    fn relevant_fingerprint(&self, block: &Block, precision: &D::Precision) -> Fingerprint;
}

/// The trivial reducer: `reduce = id`, `expand` returns the inner state.
///
/// With this reducer, cached block exploration must produce exactly the
/// summaries plain exploration would.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityReducer;

impl<D: AbstractDomain> StateReducer<D> for IdentityReducer {
    fn reduce(&self, state: &D::State, _block: &Block) -> D::State {
        state.clone()
    }

    fn expand(&self, _root_state: &D::State, _block: &Block, inner: &D::State) -> D::State {
        inner.clone()
    }
}

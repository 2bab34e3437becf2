//! Cooperative shutdown for long-running explorations.
//!
//! The engine polls the check at block entries and at every inner-explorer
//! iteration. An abort surfaces as [`EngineError::Shutdown`] and never
//! commits a summary; a partially explored reach graph may remain in the
//! cache, which is exactly the resumable state the partial-hit path expects.

use crate::transfer::EngineError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle over a shared shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCheck {
    requested: Arc<AtomicBool>,
}

impl ShutdownCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this handle to stop at the next poll point.
    pub fn request_shutdown(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Poll point: error out when a shutdown has been requested.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.is_requested() {
            Err(EngineError::Shutdown)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_passes_until_requested() {
        let shutdown = ShutdownCheck::new();
        assert!(shutdown.check().is_ok());
        shutdown.request_shutdown();
        assert!(matches!(shutdown.check(), Err(EngineError::Shutdown)));
    }

    #[test]
    fn clones_share_the_flag() {
        let shutdown = ShutdownCheck::new();
        let other = shutdown.clone();
        other.request_shutdown();
        assert!(shutdown.is_requested());
    }
}

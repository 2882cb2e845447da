use std::collections::TryReserveError;

use thiserror::Error;

/// Errors surfaced by tree construction and reconfiguration.
///
/// Every fallible entry point either succeeds completely or leaves the
/// previous state untouched.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("requested depth {requested} outside the supported range [{min}, {max}]")]
    InvalidDepthRequest { requested: u32, min: u32, max: u32 },

    #[error("failed to allocate {bytes} bytes for the bit heap")]
    AllocationFailure {
        bytes: usize,
        #[source]
        source: TryReserveError,
    },
}

use thiserror::Error;

/// Errors returned by `StreamState`'s public API.
///
/// Only `Closed` is expected in steady-state operation; everything else
/// the state machine can hit (passthrough failures, unknown subscription
/// ids, camera lookup misses) is absorbed internally per §7 and never
/// reaches a caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed,
}

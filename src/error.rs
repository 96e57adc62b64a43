use thiserror::Error;

/// Failures hit while juggling rooms, workers and voice connections.
///
/// None of these are retried: exhaustion degrades, lost races are abandoned,
/// and remote failures abort the current step after cleanup.
#[derive(Debug, Error)]
pub enum OrchestrateError {
    /// A fixed pool (recorder workers, room numbers) is fully allocated.
    #[error("no free {resource}: all {limit} in use")]
    ResourceExhausted {
        resource: &'static str,
        limit: usize,
    },

    /// The member or room vanished between decision and action.
    #[error("{action} lost a race: {detail}")]
    RaceLost {
        action: &'static str,
        detail: String,
    },

    /// A platform call failed outright.
    #[error("remote call failed: {0}")]
    Remote(String),
}

impl OrchestrateError {
    pub fn remote(err: impl std::fmt::Display) -> Self {
        Self::Remote(err.to_string())
    }

    pub fn race(action: &'static str, detail: impl Into<String>) -> Self {
        Self::RaceLost {
            action,
            detail: detail.into(),
        }
    }
}

use trackrelay_common::error::RelayError;

use crate::dispatch::DispatchError;
use crate::traccar::client::TraccarClientError;

/// Failure of one sync cycle (account-level or per-device).
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] RelayError),

    #[error("tracking api: {0}")]
    Upstream(#[from] TraccarClientError),

    #[error("delivery of batch {batch} failed after {attempts} attempts: {reason}")]
    Delivery {
        batch: usize,
        attempts: u32,
        reason: String,
    },

    #[error("dispatch: {0}")]
    Dispatch(#[from] DispatchError),
}

impl SyncError {
    /// Short machine-readable tag for structured failure output.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Store(RelayError::StoreUnavailable(_)) => "store_unavailable",
            SyncError::Store(RelayError::InvalidPersistedState(_)) => "invalid_persisted_state",
            SyncError::Store(_) => "internal",
            SyncError::Upstream(TraccarClientError::Rejected { .. }) => "upstream_rejected",
            SyncError::Upstream(TraccarClientError::Unavailable { .. }) => "upstream_unavailable",
            SyncError::Upstream(_) => "transient_network",
            SyncError::Delivery { .. } => "delivery_error",
            SyncError::Dispatch(_) => "dispatch_error",
        }
    }

    /// Errors that would hit every remaining device the same way.
    pub fn aborts_account(&self) -> bool {
        matches!(self, SyncError::Store(RelayError::StoreUnavailable(_)))
    }
}

//! Shared application state for the HTTP handlers.

use crate::error::ApiError;
use cgs_governance::{GovernanceState, ServiceError};
use std::sync::{Arc, Mutex, MutexGuard};

/// Handler state: the governance ledger behind a lock, mirroring the
/// one-write-at-a-time ordering of the consensus log.
#[derive(Clone)]
pub struct AppState {
    governance: Arc<Mutex<GovernanceState>>,
}

impl AppState {
    pub fn new(governance: GovernanceState) -> Self {
        Self {
            governance: Arc::new(Mutex::new(governance)),
        }
    }

    pub fn ledger(&self) -> Result<MutexGuard<'_, GovernanceState>, ApiError> {
        self.governance
            .lock()
            .map_err(|_| ApiError::from(ServiceError::internal("ledger state lock poisoned")))
    }
}

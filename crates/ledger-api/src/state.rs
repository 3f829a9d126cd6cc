//! Application state.

use std::sync::Arc;

use ledger_firestore::{CouponLedger, DocumentStore, FirestoreClient, FirestoreResult, LedgerConfig};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub store: Arc<dyn DocumentStore>,
    pub ledger: CouponLedger,
}

impl AppState {
    /// Create application state backed by Firestore, configured from the environment.
    pub async fn new(config: ApiConfig) -> FirestoreResult<Self> {
        let client = FirestoreClient::from_env().await?;
        let ledger_config = LedgerConfig::from_env()?;
        Ok(Self::with_store(config, Arc::new(client), ledger_config))
    }

    /// Create application state over any document store.
    pub fn with_store(
        config: ApiConfig,
        store: Arc<dyn DocumentStore>,
        ledger_config: LedgerConfig,
    ) -> Self {
        let ledger = CouponLedger::new(Arc::clone(&store), ledger_config);
        Self {
            config,
            store,
            ledger,
        }
    }
}

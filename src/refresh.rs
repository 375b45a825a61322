// Configuration refresh: fetch, parse, install, persist.
//
// A refresh that fails at any step leaves the installed configuration alone.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::configuration::{Configuration, ConfigurationError};
use crate::context::{InstallOutcome, SharedContext};
use crate::store::{ConfigurationFetcher, FetchError, SnapshotStore, StoreError};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Configuration rejected: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Snapshot store failed: {0}")]
    Store(#[from] StoreError),
}

/// Statistics from a refresh operation.
#[derive(Debug, Clone)]
pub struct RefreshStats {
    pub outcome: InstallOutcome,
    /// `valid_from` of the fetched configuration
    pub valid_from: i64,
    /// Conversion value rules that survived parsing
    pub rules_loaded: usize,
    /// Whether the new state reached the snapshot store
    pub persisted: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

pub struct ConfigurationRefresher {
    fetcher: Arc<dyn ConfigurationFetcher>,
    context: SharedContext,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl ConfigurationRefresher {
    pub fn new(fetcher: Arc<dyn ConfigurationFetcher>, context: SharedContext) -> Self {
        Self {
            fetcher,
            context,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    /// Fetch the latest configuration and offer it to the context.
    ///
    /// A store failure after a successful install is logged and reported via
    /// `persisted = false`; the new configuration stays installed.
    pub fn refresh(&self) -> Result<RefreshStats, RefreshError> {
        let started = Instant::now();

        let payload = self.fetcher.fetch().map_err(|e| {
            warn!("Configuration fetch failed: {}", e);
            e
        })?;

        let factory = self.context.lock().rule_factory().clone();
        let configuration =
            Configuration::from_graph_response_with(&payload, &factory).map_err(|e| {
                error!("Rejected configuration payload: {}", e);
                e
            })?;
        let valid_from = configuration.valid_from();
        let rules_loaded = configuration.conversion_value_rules().len();

        let (outcome, snapshot) = {
            let mut context = self.context.lock();
            let outcome = context.install_configuration(configuration);
            (outcome, context.snapshot())
        };

        let changed = matches!(
            outcome,
            InstallOutcome::Installed | InstallOutcome::Superseded { .. }
        );
        let persisted = match &self.store {
            Some(store) if changed => match store.save(&snapshot) {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to persist attribution snapshot: {}", e);
                    false
                }
            },
            _ => false,
        };

        let stats = RefreshStats {
            outcome,
            valid_from,
            rules_loaded,
            persisted,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        };
        info!(
            "Configuration refresh: {:?} valid_from={} rules={} in {}ms",
            stats.outcome, stats.valid_from, stats.rules_loaded, stats.duration_ms
        );
        Ok(stats)
    }

    /// Restore the context from the snapshot store. Returns false when there
    /// is no store or nothing was saved.
    pub fn restore_from_store(&self) -> Result<bool, RefreshError> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(false),
        };
        match store.load()? {
            Some(snapshot) => {
                self.context.lock().restore(snapshot)?;
                info!("Restored attribution state from snapshot store");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Persist the current context state.
    pub fn persist(&self) -> Result<(), RefreshError> {
        if let Some(store) = &self.store {
            let snapshot = self.context.lock().snapshot();
            store.save(&snapshot)?;
        }
        Ok(())
    }
}

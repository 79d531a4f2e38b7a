//! Shared handles passed to every component at construction.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::channels::ChannelDirectory;
use crate::config::Config;
use crate::ledger::TaskLedger;
use crate::metrics::{new_shared_metrics, SharedMetrics};
use crate::transport::Transport;

#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub transport: Arc<dyn Transport>,
    pub ledger: Arc<dyn TaskLedger>,
    pub catalog: Arc<dyn Catalog>,
    pub channels: Arc<ChannelDirectory>,
    pub metrics: SharedMetrics,
    /// Global stop signal.
    pub stop: CancellationToken,
}

impl Context {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        ledger: Arc<dyn TaskLedger>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            ledger,
            catalog,
            channels: Arc::new(ChannelDirectory::new()),
            metrics: new_shared_metrics(),
            stop: CancellationToken::new(),
        }
    }

    /// Context wired to in-memory collaborators.
    pub fn in_memory(config: Config) -> Self {
        Self::new(
            config,
            Arc::new(crate::transport::MemoryBroker::new()),
            Arc::new(crate::ledger::MemoryLedger::new()),
            Arc::new(crate::catalog::MemoryCatalog::new()),
        )
    }
}

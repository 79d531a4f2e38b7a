//! Daemon assembly and main loop
//!
//! Builds the shared context, the admission pool, the coordinator and the
//! in-process workers, then runs them next to the HTTP server until the stop
//! token fires.

use crate::catalog::{Catalog, MemoryCatalog};
use crate::channels::{ChannelSource, StaticChannels};
use crate::concurrency::{derive_plan, SlotPlan};
use crate::config::{Config, ConfigError};
use crate::context::Context;
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::gates::standard_pool;
use crate::http::{run_server, ServerError};
use crate::ledger::{JsonLedger, LedgerError, TaskLedger};
use crate::startup::StartupError;
use crate::transport::{MemoryBroker, Transport};
use crate::worker::{standard_pipeline, Pipeline, Worker, WorkerError, WorkerSettings};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Ledger rows live under `<state_dir>/tasks`
const LEDGER_DIR: &str = "tasks";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

pub struct Daemon {
    plan: SlotPlan,
    ctx: Context,
    coordinator: Arc<Coordinator>,
    workers: Vec<Arc<Worker>>,
    channel_source: Arc<dyn ChannelSource>,
}

impl Daemon {
    /// Daemon with the JSON ledger under the state directory, an in-process
    /// broker and the Av1an pipeline.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        let ledger = JsonLedger::open(config.coordinator.state_dir.join(LEDGER_DIR))?;
        let plan = derive_plan(&config);
        let pipeline = Arc::new(standard_pipeline(&config, &plan));
        Ok(Self::assemble(
            config,
            Arc::new(MemoryBroker::new()),
            Arc::new(ledger),
            Arc::new(MemoryCatalog::new()),
            pipeline,
        ))
    }

    /// Wire the daemon around the given collaborators.
    pub fn assemble(
        config: Config,
        transport: Arc<dyn Transport>,
        ledger: Arc<dyn TaskLedger>,
        catalog: Arc<dyn Catalog>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        let plan = derive_plan(&config);
        let channel_source: Arc<dyn ChannelSource> =
            Arc::new(StaticChannels::from_config(&config.admission));
        let ctx = Context::new(config, transport, ledger, catalog);

        let pool = standard_pool(&ctx.config.admission, ctx.channels.clone());
        let coordinator = Arc::new(Coordinator::new(ctx.clone(), Arc::new(pool)));

        let workers = (0..ctx.config.worker.local_workers)
            .map(|_| {
                Arc::new(Worker::new(
                    WorkerSettings::from_config(&ctx.config, &plan),
                    ctx.transport.clone(),
                    pipeline.clone(),
                    ctx.stop.clone(),
                ))
            })
            .collect();

        Self {
            plan,
            ctx,
            coordinator,
            workers,
            channel_source,
        }
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn plan(&self) -> &SlotPlan {
        &self.plan
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Cancelling this token shuts the daemon down.
    pub fn stop_token(&self) -> CancellationToken {
        self.ctx.stop.clone()
    }

    /// Run every component until the stop token fires.
    ///
    /// Workers finish the tasks they hold before this returns; the coordinator
    /// writes its final snapshot on the way out.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let stop = self.ctx.stop.clone();
        let refresh = Duration::from_secs(self.ctx.config.admission.channel_refresh_secs.max(1));

        let refresher = tokio::spawn(self.ctx.channels.clone().run_refresher(
            self.channel_source.clone(),
            refresh,
            stop.clone(),
        ));
        let coordinator = tokio::spawn(self.coordinator.clone().run());
        let workers: Vec<_> = self
            .workers
            .iter()
            .map(|worker| tokio::spawn(worker.clone().run()))
            .collect();

        info!(
            workers = self.workers.len(),
            slots = self.plan.worker_slots,
            encoder_workers = self.plan.encoder_workers,
            bind_addr = %self.ctx.config.coordinator.bind_addr,
            "daemon started"
        );

        let served = run_server(
            self.coordinator.clone(),
            &self.ctx.config.coordinator.bind_addr,
            stop.clone(),
        )
        .await;
        if let Err(e) = &served {
            error!(error = %e, "http server stopped");
        }
        stop.cancel();

        let mut outcome: Result<(), DaemonError> = served.map_err(DaemonError::from);
        for handle in workers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "worker failed");
                    if outcome.is_ok() {
                        outcome = Err(e.into());
                    }
                }
                Err(e) => error!(error = %e, "worker panicked"),
            }
        }
        match coordinator.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "coordinator failed");
                if outcome.is_ok() {
                    outcome = Err(e.into());
                }
            }
            Err(e) => error!(error = %e, "coordinator panicked"),
        }
        let _ = refresher.await;

        info!("daemon stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{EncodeError, Encoder};
    use crate::gates::{COMMON_LEVEL, ENABLED_LEVEL, PRIORITY_LEVEL, SUPPORTED_LEVEL};
    use crate::ledger::{LedgerStatus, MemoryLedger};
    use crate::protocol::TranscodeRequest;
    use crate::worker::{CallbackClient, FsObjectStore, HttpFetcher};
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct CopyEncoder;

    #[async_trait]
    impl Encoder for CopyEncoder {
        async fn encode(
            &self,
            input: &Path,
            output: &Path,
            progress: mpsc::Sender<f32>,
        ) -> Result<(), EncodeError> {
            let _ = progress.try_send(50.0);
            tokio::fs::copy(input, output).await?;
            Ok(())
        }
    }

    fn free_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn test_config(dir: &TempDir) -> Config {
        let addr = free_addr();
        let mut config = Config::default();
        config.coordinator.bind_addr = addr.clone();
        config.coordinator.public_url = format!("http://{}", addr);
        config.coordinator.state_dir = dir.path().join("state");
        config.coordinator.sweep_interval_secs = 1;
        config.admission.idle_interval_ms = 10;
        config.admission.normal_channels = vec!["@enabled".to_string()];
        config.worker.concurrency = 2;
        config.worker.local_workers = 2;
        config.worker.status_interval_secs = 1;
        config.worker.work_dir = dir.path().join("work");
        config.worker.storage_dir = dir.path().join("streams");
        config.encoder.logical_cores = Some(8);
        config
    }

    fn assemble(config: Config, ledger: Arc<MemoryLedger>, catalog: Arc<MemoryCatalog>) -> Daemon {
        let pipeline = Pipeline::new(
            Arc::new(HttpFetcher::default()),
            Arc::new(CopyEncoder),
            Arc::new(FsObjectStore::new(config.worker.storage_dir.clone())),
            CallbackClient::default(),
            config.worker.work_dir.join("tasks"),
        );
        Daemon::assemble(
            config,
            Arc::new(MemoryBroker::new()),
            ledger,
            catalog,
            Arc::new(pipeline),
        )
    }

    #[tokio::test]
    async fn test_assembly_follows_config() {
        let dir = TempDir::new().unwrap();
        let daemon = assemble(
            test_config(&dir),
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryCatalog::new()),
        );

        assert_eq!(daemon.workers().len(), 2);
        assert!(daemon.workers().iter().all(|w| w.capacity() == 2));
        assert_ne!(daemon.workers()[0].id(), daemon.workers()[1].id());
        assert_eq!(daemon.plan().worker_slots, 2);

        let levels: Vec<_> = daemon
            .coordinator()
            .pool()
            .levels()
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        assert_eq!(
            levels,
            vec![PRIORITY_LEVEL, ENABLED_LEVEL, SUPPORTED_LEVEL, COMMON_LEVEL]
        );
    }

    #[tokio::test]
    async fn test_new_opens_json_ledger() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(test_config(&dir)).unwrap();
        assert!(dir.path().join("state").join(LEDGER_DIR).is_dir());
        assert_eq!(daemon.workers().len(), 2);
    }

    #[tokio::test]
    async fn test_request_flows_to_catalog() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.ts");
        std::fs::write(&source, b"a short stream").unwrap();

        let config = test_config(&dir);
        let state_dir = config.coordinator.state_dir.clone();
        let ledger = Arc::new(MemoryLedger::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let daemon = Arc::new(assemble(config, ledger.clone(), catalog.clone()));
        let stop = daemon.stop_token();

        let runner = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run().await })
        };

        let request = TranscodeRequest {
            reference: "abc".to_string(),
            url: format!("file://{}", source.display()),
            content_key: "sha-abc".to_string(),
            channel: "@enabled".to_string(),
            support_amount: 0.0,
        };

        // The enabled level only accepts once the channel directory is seeded
        let mut entry = None;
        for _ in 0..500 {
            if entry.is_none() {
                let _ = daemon.coordinator().admit(request.clone()).await.unwrap();
            }
            entry = catalog.lookup("abc").await.unwrap();
            if entry.is_some() && daemon.coordinator().get("abc").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let entry = entry.expect("stream never reached the catalog");
        assert!(entry.result.url.starts_with("file://"));
        assert_eq!(entry.result.size_bytes, 14);
        assert!(dir.path().join("streams/abc").is_dir());

        let records = ledger.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, LedgerStatus::Done);

        stop.cancel();
        runner.await.unwrap().unwrap();
        assert!(state_dir.join("running.json").exists());
    }
}

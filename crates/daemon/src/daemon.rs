//! Daemon startup and run modes for md2pdf
//!
//! Builds every component once (metrics registry, job cache, validator,
//! executor, worker pool, scheduler) and runs one of the three modes:
//! batch, watch, or the long-lived daemon with control API and metrics.

use crate::api::{serve_api, ApiState, ServiceInfo};
use crate::cache::{CacheError, JobCache};
use crate::concurrency::{derive_plan, WorkerPlan};
use crate::config::{Config, ConfigError};
use crate::engine::FallbackChain;
use crate::executor::{ConversionExecutor, ExecutorSettings};
use crate::metrics::{collect_system_metrics, new_shared_metrics, MetricsError, SharedMetrics};
use crate::metrics_server::{bind, serve_metrics, ServerError};
use crate::pool::WorkerPool;
use crate::scheduler::{BatchSummary, Scheduler};
use crate::startup::{run_startup_checks, PidFile, StartupError, ToolchainReport};
use crate::template::TemplateValidator;
use crate::toolchain::{DependencyIndex, SystemIndex};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How often the system gauges are refreshed in daemon mode.
const SYSTEM_METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Job cache could not be opened
    #[error("Job cache error: {0}")]
    Cache(#[from] CacheError),

    /// Server error
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Metrics registry could not be built
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("invalid listen address {0}")]
    InvalidAddress(String),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    config: Config,
    plan: WorkerPlan,
    metrics: SharedMetrics,
    toolchain: ToolchainReport,
    scheduler: Arc<Scheduler>,
}

impl Daemon {
    /// Initialize the daemon from an already-loaded configuration
    ///
    /// Runs the startup checks (directories, output root, disk space and,
    /// unless `skip_checks`, Pandoc) and wires the Pandoc fallback chain.
    pub fn new(config: Config, skip_checks: bool) -> Result<Self, DaemonError> {
        config.validate()?;
        let toolchain = run_startup_checks(&config, skip_checks)?;
        let chain = FallbackChain::pandoc(&config.conversion.pandoc_binary, &config.conversion.pdf_engines);
        Self::build(config, toolchain, Arc::new(SystemIndex::new()), chain)
    }

    /// Wire the components around a given dependency index and engine chain
    pub fn build(
        config: Config,
        toolchain: ToolchainReport,
        index: Arc<dyn DependencyIndex>,
        chain: FallbackChain,
    ) -> Result<Self, DaemonError> {
        let plan = derive_plan(&config);
        let metrics = new_shared_metrics()?;
        let settings = ExecutorSettings::from_config(&config);
        let cache = Arc::new(JobCache::open(settings.logs_dir().join("jobcache"))?);

        info!(
            workers = plan.max_concurrent_jobs,
            cores = plan.total_cores,
            queue_capacity = plan.queue_capacity,
            chain = ?chain.labels(),
            "concurrency plan derived"
        );

        let executor = Arc::new(ConversionExecutor::new(
            chain,
            Arc::new(TemplateValidator::new(index)),
            metrics.clone(),
            settings,
        ));
        let pool = WorkerPool::start(
            plan.clone(),
            executor,
            cache.clone(),
            metrics.clone(),
            config.conversion.cache_failures,
        );
        let scheduler = Arc::new(Scheduler::new(
            pool,
            cache,
            metrics.clone(),
            config.paths.input_dir.clone(),
            config.paths.template.clone(),
        ));

        Ok(Self {
            config,
            plan,
            metrics,
            toolchain,
            scheduler,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn plan(&self) -> &WorkerPlan {
        &self.plan
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn toolchain(&self) -> &ToolchainReport {
        &self.toolchain
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// One sweep; returns once every admitted job has finished.
    pub async fn run_batch(&self, force: bool) -> BatchSummary {
        let summary = self.scheduler.run_batch(force).await;
        self.scheduler.pool().shutdown().await;
        info!(
            files = summary.outcomes.len(),
            failed = summary.has_failures(),
            "batch finished"
        );
        summary
    }

    /// Watch the input directory until `stop` resolves, then drain.
    pub async fn run_watch<F>(&self, force: bool, stop: F)
    where
        F: Future<Output = ()>,
    {
        let (tx, rx) = watch::channel(false);
        let interval = Duration::from_secs(self.config.watch.interval_secs.max(1));
        let watcher = self.scheduler.watch(interval, force, rx);
        let stopper = async move {
            stop.await;
            info!("stop requested; finishing watch pass");
            let _ = tx.send(true);
        };

        tokio::join!(watcher, stopper);
        self.scheduler.pool().shutdown().await;
    }

    /// Full daemon: PID file, control API, metrics server and watch loop
    /// until Ctrl-C or SIGTERM.
    pub async fn run_daemon(&self, force: bool) -> Result<(), DaemonError> {
        self.run_until(force, wait_for_signal()).await
    }

    /// Daemon mode stopped by an arbitrary future.
    ///
    /// Both listeners are bound before anything is spawned, so a port in use
    /// is returned at once rather than after `stop`.
    pub async fn run_until<F>(&self, force: bool, stop: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        let _pidfile = PidFile::acquire(&self.config.paths.pidfile)?;
        let api_addr = listen_addr(&self.config.server.bind_address, self.config.server.api_port)?;
        let metrics_addr = listen_addr(&self.config.server.bind_address, self.config.server.metrics_port)?;

        let api_listener = bind(api_addr).await?;
        let metrics_listener = bind(metrics_addr).await?;
        let api_addr = api_listener.local_addr().unwrap_or(api_addr);
        let metrics_addr = metrics_listener.local_addr().unwrap_or(metrics_addr);

        let (tx, rx) = watch::channel(false);

        let state = ApiState::new(
            self.scheduler.clone(),
            self.metrics.clone(),
            ServiceInfo::new(&self.config, &self.scheduler),
        );
        let api = tokio::spawn(serve_api(api_listener, state.clone(), rx.clone()));
        let metrics_server = tokio::spawn(serve_metrics(metrics_listener, self.metrics.clone(), rx.clone()));
        let updater = tokio::spawn(update_system_metrics(self.metrics.clone(), rx.clone()));

        let interval = Duration::from_secs(self.config.watch.interval_secs.max(1));
        let scheduler = self.scheduler.clone();
        let watcher = tokio::spawn(async move { scheduler.watch(interval, force, rx).await });

        info!(pid = std::process::id(), %api_addr, %metrics_addr, "daemon running");
        stop.await;
        info!("shutdown requested; draining worker pool");
        let _ = tx.send(true);

        if let Err(e) = watcher.await {
            error!(error = %e, "watch task failed");
        }
        state.drain().await;
        self.scheduler.pool().shutdown().await;

        let mut result = Ok(());
        for (name, handle) in [("api", api), ("metrics", metrics_server)] {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(server = name, error = %e, "server failed");
                    result = Err(DaemonError::Server(e));
                }
                Err(e) => error!(server = name, error = %e, "server task failed"),
            }
        }
        if let Err(e) = updater.await {
            warn!(error = %e, "metrics updater failed");
        }
        info!("daemon stopped");
        result
    }
}

/// `bind_address:port` as a socket address.
pub fn listen_addr(bind_address: &str, port: u16) -> Result<SocketAddr, DaemonError> {
    let raw = if bind_address.contains(':') && !bind_address.starts_with('[') {
        format!("[{}]:{}", bind_address, port)
    } else {
        format!("{}:{}", bind_address, port)
    };
    raw.parse().map_err(|_| DaemonError::InvalidAddress(raw))
}

/// Periodically refresh the system gauges until shutdown.
async fn update_system_metrics(metrics: SharedMetrics, mut shutdown: watch::Receiver<bool>) {
    loop {
        match tokio::task::spawn_blocking(collect_system_metrics).await {
            Ok(system) => metrics.set_system(system).await,
            Err(e) => warn!(error = %e, "system metrics collection failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(SYSTEM_METRICS_INTERVAL) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler; waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

use crate::cache::{CacheEngine, CacheEngineConfig};
use crate::collaborators::{ContentScreener, EscrowLedger, LogSink};
use crate::config::Settings;
use crate::infrastructure::{
    AllowAllScreener, BackgroundTasks, LoggingEscrowLedger, StaticOrgDirectory,
    StaticPolicyStore, StaticProviderRegistry, TracingLogSink,
};
use crate::proxy::{
    Finalizer, PipelineDeps, ProviderCaller, ProxyConfig, ProxyService, RequestOrchestrator,
};
use crate::rate_limit::{build_limiter, SystemClock};
use crate::storage::{InMemoryKv, KvStore};
use crate::{Error, Result};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

/// How long shutdown waits for post-response work
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Collaborators the gateway does not own. Defaults are the in-process
/// adapters.
pub struct Collaborators {
    pub screener: Arc<dyn ContentScreener>,
    pub escrow: Arc<dyn EscrowLedger>,
    pub log_sink: Arc<dyn LogSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            screener: Arc::new(AllowAllScreener),
            escrow: Arc::new(LoggingEscrowLedger),
            log_sink: Arc::new(TracingLogSink),
        }
    }
}

/// Main application struct that coordinates all components
pub struct Application {
    settings: Settings,
    router: Router,
    tasks: BackgroundTasks,
}

impl Application {
    #[instrument]
    pub async fn new() -> Result<Self> {
        Self::build(Settings::new()?, Collaborators::default())
    }

    /// Wires the pipeline from `settings` and the given collaborators
    pub fn build(settings: Settings, collaborators: Collaborators) -> Result<Self> {
        let proxy_config = ProxyConfig::from(&settings.proxy);
        let kv: Arc<dyn KvStore> =
            Arc::new(InMemoryKv::with_capacity(settings.storage.max_entries));

        let registry = StaticProviderRegistry::from_settings(&settings.providers)?;
        if registry.is_empty() {
            warn!("No providers configured, every proxied call will be rejected");
        }
        let caller = ProviderCaller::new(Arc::new(registry), proxy_config.clone())
            .map_err(|e| Error::application(e.to_string()))?;

        let limiter = build_limiter(&settings.rate_limit, kv.clone(), Arc::new(SystemClock));
        let cache = Arc::new(CacheEngine::new(
            kv,
            CacheEngineConfig::from(&settings.cache),
        ));
        let finalizer = Arc::new(Finalizer::new(
            cache.clone(),
            limiter.clone(),
            collaborators.log_sink,
            collaborators.escrow,
            proxy_config.stream_timeout,
        ));
        let tasks = BackgroundTasks::new();

        let orchestrator = RequestOrchestrator::new(PipelineDeps {
            org_directory: Arc::new(StaticOrgDirectory::from_settings(&settings.organization)?),
            policy_store: Arc::new(StaticPolicyStore::from_settings(&settings.policies)?),
            screener: collaborators.screener,
            limiter,
            cache,
            caller,
            finalizer,
            tasks: tasks.clone(),
        });
        let router = ProxyService::new(orchestrator, proxy_config).into_router();

        Ok(Self {
            settings,
            router,
            tasks,
        })
    }

    /// Serves on the configured address until Ctrl-C
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.settings.bind_address()).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serves on `listener` until `shutdown` resolves, then drains
    /// background work
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        info!(
            address = %listener.local_addr()?,
            environment = %self.settings.application.environment,
            "LLM Relay listening"
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!(in_flight = self.tasks.in_flight(), "Draining background tasks");
        self.tasks.drain(DRAIN_TIMEOUT).await;
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

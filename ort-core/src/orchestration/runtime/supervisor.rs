use std::{
    any::type_name_of_val,
    fmt,
    sync::Arc,
    time::Duration,
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use ort_model::Endpoint;

use crate::error::{OrchestratorError, Result};
use crate::orchestration::{
    config::OrchestratorConfig,
    maintenance::{JobTimeoutSweep, MaintenanceRegistry, MaintenanceService, StuckRunSweep},
    orchestrator::Orchestrator,
    store::{MaintenanceClaims, OrchestrationStore},
    transport::{MessageHandler, MessagePublisher, Transport},
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Supervises the orchestrator subscription and the maintenance loops of a
/// single process. Several runtimes may share one store.
pub struct OrchestratorRuntime {
    config: OrchestratorConfig,
    store: Arc<dyn OrchestrationStore>,
    transport: Arc<dyn Transport>,
    orchestrator: Arc<Orchestrator>,
    maintenance: MaintenanceService,
    shutdown_token: CancellationToken,
    subscriptions: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for OrchestratorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        let subscription_count = self
            .subscriptions
            .try_lock()
            .map(|subscriptions| subscriptions.len())
            .unwrap_or_default();

        f.debug_struct("OrchestratorRuntime")
            .field("config", &self.config)
            .field("store_type", &type_name_of_val(self.store.as_ref()))
            .field("transport_type", &type_name_of_val(self.transport.as_ref()))
            .field("maintenance", &self.maintenance)
            .field("subscription_count", &subscription_count)
            .field("handle_count", &handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl OrchestratorRuntime {
    /// Settings the runtime was built with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Store shared by the orchestrator and the sweeps.
    pub fn store(&self) -> Arc<dyn OrchestrationStore> {
        Arc::clone(&self.store)
    }

    /// Transport the orchestrator consumes from.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// The message handler.
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// Publisher over the runtime transport.
    pub fn publisher(&self) -> MessagePublisher {
        MessagePublisher::new(self.transport())
    }

    /// Subscribes the orchestrator and spawns the enabled maintenance loops.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(OrchestratorError::Cancelled(
                "runtime already shut down".into(),
            ));
        }

        let handler: Arc<dyn MessageHandler> = self.orchestrator();
        let subscription = self
            .transport
            .subscribe(Endpoint::Orchestrator, handler)
            .await?;

        self.subscriptions.lock().await.push(subscription);
        self.handles
            .lock()
            .await
            .extend(self.maintenance.spawn(self.shutdown_token.clone()));

        tracing::info!(
            maintenance = ?self.maintenance,
            "orchestrator runtime started"
        );
        Ok(())
    }

    /// Stops consuming, cancels the maintenance loops and waits for them.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown of orchestrator runtime");

        self.shutdown_token.cancel();

        // Stop consuming first. Unhandled messages stay queued on their
        // endpoint; handlers already running are detached and finish on
        // their own.
        let subscriptions = {
            let mut guard = self.subscriptions.lock().await;
            std::mem::take(&mut *guard)
        };
        for subscription in &subscriptions {
            subscription.abort();
        }

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in subscriptions.into_iter().chain(handles) {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => tracing::warn!("Runtime task failed: {:?}", e),
                Err(_) => tracing::warn!("Runtime task timed out during shutdown"),
            }
        }

        tracing::info!("Orchestrator runtime shutdown complete");
        Ok(())
    }
}

/// Helper for constructing a runtime with explicit dependencies.
pub struct OrchestratorRuntimeBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn OrchestrationStore>>,
    transport: Option<Arc<dyn Transport>>,
    claims: Option<Arc<dyn MaintenanceClaims>>,
    maintenance: Option<MaintenanceRegistry>,
}

impl fmt::Debug for OrchestratorRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorRuntimeBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("transport_set", &self.transport.is_some())
            .field("claims_set", &self.claims.is_some())
            .field("maintenance", &self.maintenance)
            .finish()
    }
}

impl OrchestratorRuntimeBuilder {
    /// Starts a builder; store, transport and claims are required.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            claims: None,
            maintenance: None,
        }
    }

    /// Required.
    pub fn with_store(mut self, store: Arc<dyn OrchestrationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Required.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Claims that keep a sweep from running on two replicas at once.
    pub fn with_claims(mut self, claims: Arc<dyn MaintenanceClaims>) -> Self {
        self.claims = Some(claims);
        self
    }

    /// Replaces the maintenance jobs derived from the config.
    pub fn with_maintenance(mut self, registry: MaintenanceRegistry) -> Self {
        self.maintenance = Some(registry);
        self
    }

    /// Fails when the store, transport or claims are missing or the config is invalid.
    pub fn build(self) -> Result<OrchestratorRuntime> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| OrchestratorError::Internal("store dependency missing".into()))?;
        let transport = self
            .transport
            .ok_or_else(|| OrchestratorError::Internal("transport dependency missing".into()))?;
        let claims = self
            .claims
            .ok_or_else(|| OrchestratorError::Internal("claims dependency missing".into()))?;

        let publisher = MessagePublisher::new(Arc::clone(&transport));
        let registry = match self.maintenance {
            Some(registry) => registry,
            None => default_registry(&self.config, &store, &publisher)?,
        };
        let maintenance = MaintenanceService::new(
            registry,
            claims,
            self.config.maintenance.claim_stale_after(),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            publisher,
            self.config.clone(),
        ));

        Ok(OrchestratorRuntime {
            config: self.config,
            store,
            transport,
            orchestrator,
            maintenance,
            shutdown_token: CancellationToken::new(),
            subscriptions: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        })
    }
}

/// The sweeps enabled in `config`.
pub fn default_registry(
    config: &OrchestratorConfig,
    store: &Arc<dyn OrchestrationStore>,
    publisher: &MessagePublisher,
) -> Result<MaintenanceRegistry> {
    let mut builder = MaintenanceRegistry::builder();
    if config.monitor.stuck_runs.enabled {
        builder = builder.register(Arc::new(StuckRunSweep::new(
            Arc::clone(store),
            publisher.clone(),
            config.monitor.stuck_runs,
        )));
    }
    if config.monitor.job_timeouts.enabled {
        builder = builder.register(Arc::new(JobTimeoutSweep::new(
            Arc::clone(store),
            publisher.clone(),
            config.monitor.job_timeouts,
            config.config_worker,
        )));
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::messages::{Message, MessageHeader, OrchestratorMessage};
    use crate::orchestration::runtime::InMemoryTransport;
    use crate::orchestration::store::InMemoryStore;

    #[test]
    fn missing_dependencies_are_reported() {
        let err = OrchestratorRuntimeBuilder::new(OrchestratorConfig::default())
            .with_transport(Arc::new(InMemoryTransport::new()))
            .build()
            .expect_err("store is missing");
        assert!(matches!(err, OrchestratorError::Internal(msg) if msg.contains("store")));
    }

    #[test]
    fn default_registry_follows_the_monitor_config() {
        let store: Arc<dyn OrchestrationStore> = Arc::new(InMemoryStore::new());
        let publisher = MessagePublisher::new(Arc::new(InMemoryTransport::new()));

        let mut config = OrchestratorConfig::default();
        let registry = default_registry(&config, &store, &publisher).expect("registry");
        assert_eq!(registry.names(), vec!["stuck-run-sweep", "job-timeout-sweep"]);

        config.monitor.job_timeouts.enabled = false;
        let registry = default_registry(&config, &store, &publisher).expect("registry");
        assert_eq!(registry.names(), vec!["stuck-run-sweep"]);
    }

    #[tokio::test]
    async fn started_runtime_consumes_orchestrator_messages() {
        let store = InMemoryStore::new();
        let transport = Arc::new(InMemoryTransport::new());
        let runtime = OrchestratorRuntimeBuilder::new(OrchestratorConfig::default())
            .with_store(Arc::new(store.clone()))
            .with_transport(transport.clone())
            .with_claims(Arc::new(store.clone()))
            .with_maintenance(MaintenanceRegistry::default())
            .build()
            .expect("runtime");
        runtime.start().await.expect("start");

        let message = Message::new(
            MessageHeader::new(ort_model::RunId(404)),
            OrchestratorMessage::ConfigWorkerError {
                ort_run_id: ort_model::RunId(404),
            },
        );
        runtime
            .publisher()
            .publish(Endpoint::Orchestrator, &message)
            .await
            .expect("publish");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.try_receive(Endpoint::Orchestrator).await.is_none());

        runtime.shutdown().await.expect("shutdown");
        assert!(runtime.start().await.is_err());
    }
}

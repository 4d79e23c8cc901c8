//! Server-side wiring of the orchestrator runtime.
//!
//! Binds the configured store (PostgreSQL, or in-memory for local runs) and
//! the in-process transport to a runtime.

use std::{fmt, sync::Arc};

use ort_core::{
    OrchestratorError, Result,
    orchestration::{
        InMemoryStore, InMemoryTransport, MaintenanceClaims, OrchestrationStore,
        OrchestratorConfig, OrchestratorRuntime, OrchestratorRuntimeBuilder,
        PostgresStore, Transport,
    },
};
use tracing::info;

use crate::infra::config::Config;

/// Which store backs the runtime.
#[derive(Clone)]
pub enum StoreBackend {
    Postgres(PostgresStore),
    InMemory(InMemoryStore),
}

impl fmt::Debug for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl StoreBackend {
    /// Connects to the configured database and applies pending migrations.
    pub async fn connect(config: &Config) -> Result<Self> {
        let url = config.database.url.as_deref().ok_or_else(|| {
            OrchestratorError::Configuration(
                "DATABASE_URL is required unless --in-memory is passed".into(),
            )
        })?;
        info!(
            url = %config.database.redacted_url().unwrap_or_default(),
            max_connections = config.database.max_connections,
            "connecting to PostgreSQL"
        );

        let store = PostgresStore::connect(url, config.database.max_connections).await?;
        store.migrate().await?;
        Ok(Self::Postgres(store))
    }

    pub fn in_memory() -> Self {
        Self::InMemory(InMemoryStore::new())
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Postgres(_) => "postgres",
            StoreBackend::InMemory(_) => "in-memory",
        }
    }

    fn store(&self) -> Arc<dyn OrchestrationStore> {
        match self {
            StoreBackend::Postgres(store) => Arc::new(store.clone()),
            StoreBackend::InMemory(store) => Arc::new(store.clone()),
        }
    }

    fn claims(&self) -> Arc<dyn MaintenanceClaims> {
        match self {
            StoreBackend::Postgres(store) => Arc::new(store.clone()),
            StoreBackend::InMemory(store) => Arc::new(store.clone()),
        }
    }
}

/// The orchestrator runtime of this process together with its backends.
pub struct OrchestratorService {
    runtime: Arc<OrchestratorRuntime>,
    backend: StoreBackend,
    transport: Arc<InMemoryTransport>,
}

impl fmt::Debug for OrchestratorService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorService")
            .field("backend", &self.backend)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl OrchestratorService {
    pub fn new(config: OrchestratorConfig, backend: StoreBackend) -> Result<Self> {
        let transport = Arc::new(InMemoryTransport::new());
        let runtime = OrchestratorRuntimeBuilder::new(config)
            .with_store(backend.store())
            .with_claims(backend.claims())
            .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
            .build()?;

        Ok(Self {
            runtime: Arc::new(runtime),
            backend,
            transport,
        })
    }

    pub fn runtime(&self) -> Arc<OrchestratorRuntime> {
        Arc::clone(&self.runtime)
    }

    pub fn backend(&self) -> &StoreBackend {
        &self.backend
    }

    pub fn transport(&self) -> Arc<InMemoryTransport> {
        Arc::clone(&self.transport)
    }

    pub async fn start(&self) -> Result<()> {
        self.runtime.start().await?;
        info!(backend = self.backend.name(), "orchestrator started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.runtime.shutdown().await?;
        self.transport.close();
        Ok(())
    }
}

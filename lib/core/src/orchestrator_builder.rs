use crate::error::OrchestratorError;
use crate::events::{EventEmitter, EventListener};
use crate::models::Config;
use crate::persist::sqlite::SqliteStorage;
use crate::persist::{MappingStore, PaymentRepository};
use crate::provider::ProviderEntry;
use crate::PaymentOrchestrator;
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

const DATABASE_FILE_NAME: &str = "payorch.db";

/// Builder for creating and configuring a PaymentOrchestrator instance
pub struct OrchestratorBuilder {
    config: Config,
    providers: Vec<ProviderEntry>,
    mapping_store: Option<Arc<dyn MappingStore>>,
    repository: Option<Arc<dyn PaymentRepository>>,
    listeners: Vec<Box<dyn EventListener>>,
}

impl OrchestratorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            providers: Vec::new(),
            mapping_store: None,
            repository: None,
            listeners: Vec::new(),
        }
    }

    /// Adds a provider. Providers are probed in the order they were added
    /// when the routed provider is unavailable.
    pub fn provider(mut self, entry: ProviderEntry) -> Self {
        self.providers.push(entry);
        self
    }

    pub fn providers(mut self, entries: impl IntoIterator<Item = ProviderEntry>) -> Self {
        self.providers.extend(entries);
        self
    }

    /// Sets a custom store for entity to provider mappings
    pub fn mapping_store(mut self, store: Arc<dyn MappingStore>) -> Self {
        self.mapping_store = Some(store);
        self
    }

    /// Sets a custom repository for payments and refunds
    pub fn repository(mut self, repository: Arc<dyn PaymentRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Registers a listener before any event can be emitted
    pub fn event_listener(mut self, listener: Box<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Builds the orchestrator
    ///
    /// Stores that were not provided share one SQLite database at
    /// `<data_dir>/payorch.db`.
    pub fn build(self) -> Result<PaymentOrchestrator, OrchestratorError> {
        let (mapping_store, repository) = match (self.mapping_store, self.repository) {
            (Some(mappings), Some(repository)) => (mappings, repository),
            (mappings, repository) => {
                let path = PathBuf::from(&self.config.data_dir);
                fs::create_dir_all(&path)?;
                let db_path = path.join(DATABASE_FILE_NAME);
                info!("Opening database at {}", db_path.display());
                let storage = Arc::new(SqliteStorage::new(&db_path)?);
                let default_mappings: Arc<dyn MappingStore> = storage.clone();
                let default_repository: Arc<dyn PaymentRepository> = storage;
                (
                    mappings.unwrap_or(default_mappings),
                    repository.unwrap_or(default_repository),
                )
            }
        };

        let event_emitter = Arc::new(EventEmitter::new());
        for listener in self.listeners {
            event_emitter.add_listener(listener);
        }

        PaymentOrchestrator::new(
            self.config,
            self.providers,
            mapping_store,
            repository,
            event_emitter,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::events::tests::RecordingListener;
    use crate::events::OrchestratorEvent;
    use crate::models::ChargeRequest;
    use crate::selector::tests::Sandboxes;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("payorch-builder-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_default_storage_is_created_in_data_dir() {
        let dir = temp_dir();
        let config = Config::default_config(dir.to_string_lossy().to_string());
        let listener = RecordingListener::default();

        let orchestrator = OrchestratorBuilder::new(config)
            .providers(Sandboxes::new().entries())
            .event_listener(Box::new(listener.clone()))
            .build()
            .unwrap();
        assert!(dir.join(DATABASE_FILE_NAME).exists());

        orchestrator
            .create_charge(
                &Context::background(),
                ChargeRequest::new(2500, "USD", "pm_card_visa", "cus_1"),
            )
            .await
            .unwrap();
        assert!(listener
            .events()
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::ChargeSucceeded { .. })));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_custom_stores_skip_default_database() {
        let dir = temp_dir();
        let storage = Arc::new(SqliteStorage::new_in_memory().unwrap());
        let result = OrchestratorBuilder::new(Config::default_config(
            dir.to_string_lossy().to_string(),
        ))
        .providers(Sandboxes::new().entries())
        .mapping_store(storage.clone())
        .repository(storage)
        .build();
        assert!(result.is_ok());
        assert!(!dir.exists());
    }

    #[test]
    fn test_build_without_providers_fails() {
        let storage = Arc::new(SqliteStorage::new_in_memory().unwrap());
        let result = OrchestratorBuilder::new(Config::default_config("unused".to_string()))
            .mapping_store(storage.clone())
            .repository(storage)
            .build();
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }
}

//! Ingestion tier: provider scheduling and the queue → store consumer.

pub mod orchestrator;
pub mod provider;
pub mod storage_consumer;

pub use orchestrator::{FetchReport, Orchestrator, OrchestratorConfig, OrchestratorError};
pub use provider::{
    NewsProvider, ProviderFetchError, ProviderRegistry, ProviderRegistryBuilder,
    RegisteredProvider, RegistryError,
};
pub use storage_consumer::{ConsumeOutcome, ConsumerConfig, ConsumerStats, StorageConsumer};

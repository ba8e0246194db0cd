//! News provider capability and the immutable provider registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Failure of one provider's fetch. Isolated to that provider for that tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderFetchError {
    #[error("fetch failed: {0}")]
    Failed(String),

    #[error("fetch timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
}

/// A news feed. `fetch` pushes zero or more articles onto the ingest queue and
/// returns how many it pushed.
#[async_trait]
pub trait NewsProvider: Send + Sync + 'static {
    async fn fetch(&self) -> Result<usize, ProviderFetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("provider {name} already registered as {existing}")]
    AlreadyRegistered { name: String, existing: String },
}

/// A provider with its stable name and fetch interval.
#[derive(Clone)]
pub struct RegisteredProvider {
    name: String,
    interval: Duration,
    provider: Arc<dyn NewsProvider>,
}

impl RegisteredProvider {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn provider(&self) -> &Arc<dyn NewsProvider> {
        &self.provider
    }
}

impl std::fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Name → provider mapping, fixed once built.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    pub fn providers(&self) -> &[RegisteredProvider] {
        &self.providers
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredProvider> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Collects providers before the orchestrator starts.
#[derive(Debug, Default)]
pub struct ProviderRegistryBuilder {
    providers: Vec<RegisteredProvider>,
}

impl ProviderRegistryBuilder {
    /// Register `provider` under `name`.
    ///
    /// Rejects a name that is already taken and a provider instance that is
    /// already registered under another name.
    pub fn register(
        mut self,
        name: impl Into<String>,
        interval: Duration,
        provider: Arc<dyn NewsProvider>,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        if let Some(existing) = self.providers.iter().find(|p| {
            p.name == name || std::ptr::addr_eq(Arc::as_ptr(&p.provider), Arc::as_ptr(&provider))
        }) {
            return Err(RegistryError::AlreadyRegistered {
                name,
                existing: existing.name.clone(),
            });
        }

        self.providers.push(RegisteredProvider {
            name,
            interval,
            provider,
        });
        Ok(self)
    }

    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry {
            providers: self.providers,
        }
    }
}

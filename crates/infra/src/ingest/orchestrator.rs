//! Interval-driven fetch scheduling.
//!
//! Every tick the orchestrator computes the due providers
//! (`now - last_fetch >= interval`, never-fetched providers are due), fans out one
//! task per due provider and waits for all of them. A provider's error, timeout
//! or panic is confined to that provider. `last_fetch` is stamped for every
//! dispatched provider whatever the outcome, so a failing feed is retried on its
//! own interval rather than every tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use super::provider::{ProviderFetchError, ProviderRegistry, RegisteredProvider};
use crate::workers::{ShutdownSignal, WorkerHandle, shutdown_channel};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Due-check period
    pub tick: Duration,
    /// Pause after a systemic loop error
    pub error_pause: Duration,
    /// Upper bound on a single provider fetch
    pub fetch_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            error_pause: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("orchestrator is already running")]
    AlreadyRunning,

    #[error("orchestrator loop error: {0}")]
    Systemic(String),
}

/// Outcome of one provider fetch within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub provider: String,
    pub outcome: Result<usize, ProviderFetchError>,
}

/// Scheduler driving all registered providers.
#[derive(Debug)]
pub struct Orchestrator {
    registry: ProviderRegistry,
    last_fetch: Mutex<HashMap<String, Instant>>,
    config: OrchestratorConfig,
    running: AtomicBool,
    span: Span,
}

impl Orchestrator {
    pub fn new(registry: ProviderRegistry, config: OrchestratorConfig) -> Self {
        let span = info_span!("orchestrator", providers = registry.len());
        Self {
            registry,
            last_fetch: Mutex::new(HashMap::new()),
            config,
            running: AtomicBool::new(false),
            span,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Providers due at `now`.
    pub fn due_providers(&self, now: Instant) -> Result<Vec<RegisteredProvider>, OrchestratorError> {
        let last_fetch = self.last_fetch()?;
        Ok(self
            .registry
            .providers()
            .iter()
            .filter(|p| match last_fetch.get(p.name()) {
                Some(last) => now.saturating_duration_since(*last) >= p.interval(),
                None => true,
            })
            .cloned()
            .collect())
    }

    /// One pass over every provider, ignoring intervals. Does not touch `last_fetch`.
    pub async fn fetch_all(&self) -> Result<Vec<FetchReport>, OrchestratorError> {
        let providers = self.registry.providers().to_vec();
        self.dispatch(providers).instrument(self.span.clone()).await
    }

    /// One scheduler tick: dispatch due providers and wait for all of them.
    pub async fn run_cycle(&self) -> Result<Vec<FetchReport>, OrchestratorError> {
        async {
            let now = Instant::now();
            let due = self.due_providers(now)?;
            if due.is_empty() {
                return Ok(Vec::new());
            }

            {
                let mut last_fetch = self.last_fetch()?;
                for provider in &due {
                    last_fetch.insert(provider.name().to_string(), now);
                }
            }

            self.dispatch(due).await
        }
        .instrument(self.span.clone())
        .await
    }

    /// Start the continuous loop. Stop it with [`WorkerHandle::shutdown`].
    pub fn start(self: &Arc<Self>) -> Result<WorkerHandle, OrchestratorError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(OrchestratorError::AlreadyRunning);
        }

        if self.registry.is_empty() {
            warn!(parent: &self.span, "starting with no registered providers");
        }

        let (tx, signal) = shutdown_channel();
        let this = Arc::clone(self);
        let join = tokio::spawn(async move {
            let span = this.span.clone();
            this.run(signal).instrument(span).await;
            this.running.store(false, Ordering::SeqCst);
        });
        Ok(WorkerHandle::new(tx, join))
    }

    async fn run(&self, mut shutdown: ShutdownSignal) {
        info!(tick_secs = self.config.tick.as_secs_f64(), "orchestrator started");

        while !shutdown.is_shutdown() {
            let pause = match self.run_cycle().await {
                Ok(reports) => {
                    if !reports.is_empty() {
                        debug!(dispatched = reports.len(), "cycle finished");
                    }
                    self.config.tick
                }
                Err(e) => {
                    error!(error = %e, pause_secs = self.config.error_pause.as_secs_f64(), "orchestrator loop error");
                    self.config.error_pause
                }
            };

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("orchestrator stopped");
    }

    /// Fan out one task per provider, then fan in. Reports keep dispatch order.
    async fn dispatch(
        &self,
        providers: Vec<RegisteredProvider>,
    ) -> Result<Vec<FetchReport>, OrchestratorError> {
        let timeout = self.config.fetch_timeout;
        let tasks: Vec<_> = providers
            .into_iter()
            .map(|registered| {
                let name = registered.name().to_string();
                let provider = Arc::clone(registered.provider());
                let span = info_span!("fetch", provider = %name);
                let join = tokio::spawn(
                    async move {
                        match tokio::time::timeout(timeout, provider.fetch()).await {
                            Ok(result) => result,
                            Err(_) => Err(ProviderFetchError::Timeout(timeout)),
                        }
                    }
                    .instrument(span),
                );
                (name, join)
            })
            .collect();

        let mut reports = Vec::with_capacity(tasks.len());
        let mut systemic = None;
        for (name, join) in tasks {
            let outcome = match join.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(ProviderFetchError::Failed("provider panicked".to_string())),
                Err(e) => {
                    systemic = Some(format!("fetch task for {name} was cancelled: {e}"));
                    continue;
                }
            };

            match &outcome {
                Ok(pushed) => info!(provider = %name, pushed, "fetch completed"),
                Err(e) => warn!(provider = %name, error = %e, "fetch failed"),
            }
            reports.push(FetchReport {
                provider: name,
                outcome,
            });
        }

        match systemic {
            Some(message) => Err(OrchestratorError::Systemic(message)),
            None => Ok(reports),
        }
    }

    fn last_fetch(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Instant>>, OrchestratorError> {
        self.last_fetch
            .lock()
            .map_err(|_| OrchestratorError::Systemic("last_fetch lock poisoned".to_string()))
    }
}

//! Shared state handed to every reconcile
//!
//! Use [`ContextBuilder`] to construct instances:
//!
//! ```text
//! let ctx = Context::builder(backends)
//!     .kube_client(client)
//!     .settings(settings)
//!     .build();
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::Client;
use tokio_util::sync::CancellationToken;

use cirrus_backend::BackendProvider;
use cirrus_common::crd::{ComputeCluster, ComputeInstance};
use cirrus_common::retry::{backoff_delay, RetryConfig};
use cirrus_common::store::{KubeStore, MemoryStore, ObjectStore};

/// Timing of reconcile passes
#[derive(Clone, Debug)]
pub struct ReconcileSettings {
    /// Deadline for one pass; the pass is cancelled when it expires
    pub pass_timeout: Duration,
    /// Requeue delays for consecutive yields of one object
    pub yield_backoff: RetryConfig,
    /// Requeue delay after a retryable failure
    pub error_requeue: Duration,
    /// Requeue delay after a validation failure
    pub validation_requeue: Duration,
    /// Requeue delay for a converged object
    pub resync_interval: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            pass_timeout: Duration::from_secs(120),
            yield_backoff: RetryConfig::for_yield(Duration::from_secs(2), Duration::from_secs(60)),
            error_requeue: Duration::from_secs(10),
            validation_requeue: Duration::from_secs(300),
            resync_interval: Duration::from_secs(300),
        }
    }
}

/// Consecutive yields per object
///
/// The count picks the next requeue delay and resets once a pass completes.
#[derive(Debug, Default)]
pub struct YieldTracker {
    counts: DashMap<String, u32>,
}

impl YieldTracker {
    /// Record a yield of `key` and return the delay before the next pass
    pub fn next_delay(&self, key: &str, config: &RetryConfig) -> Duration {
        let mut count = self.counts.entry(key.to_string()).or_insert(0);
        let delay = backoff_delay(config, *count);
        *count = count.saturating_add(1);
        delay
    }

    /// Forget the yields of `key`
    pub fn reset(&self, key: &str) {
        self.counts.remove(key);
    }

    /// Consecutive yields recorded for `key`
    pub fn count(&self, key: &str) -> u32 {
        self.counts.get(key).map(|c| *c).unwrap_or(0)
    }
}

/// Controller context
pub struct Context {
    /// Cluster storage
    pub clusters: Arc<dyn ObjectStore<ComputeCluster>>,
    /// Instance storage
    pub instances: Arc<dyn ObjectStore<ComputeInstance>>,
    /// Source of backend clients, acquired once per pass
    pub backends: Arc<dyn BackendProvider>,
    /// Pass timing
    pub settings: ReconcileSettings,
    /// Yield counters
    pub yields: YieldTracker,
    /// Parent of every pass's cancellation token
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(backends: Arc<dyn BackendProvider>) -> ContextBuilder {
        ContextBuilder::new(backends)
    }
}

/// Builder for constructing [`Context`] instances
///
/// Without a Kubernetes client or explicit stores, objects live in memory.
pub struct ContextBuilder {
    backends: Arc<dyn BackendProvider>,
    client: Option<Client>,
    clusters: Option<Arc<dyn ObjectStore<ComputeCluster>>>,
    instances: Option<Arc<dyn ObjectStore<ComputeInstance>>>,
    settings: ReconcileSettings,
    shutdown: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(backends: Arc<dyn BackendProvider>) -> Self {
        Self {
            backends,
            client: None,
            clusters: None,
            instances: None,
            settings: ReconcileSettings::default(),
            shutdown: None,
        }
    }

    /// Store objects in the Kubernetes API
    pub fn kube_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Override cluster storage
    pub fn cluster_store(mut self, store: Arc<dyn ObjectStore<ComputeCluster>>) -> Self {
        self.clusters = Some(store);
        self
    }

    /// Override instance storage
    pub fn instance_store(mut self, store: Arc<dyn ObjectStore<ComputeInstance>>) -> Self {
        self.instances = Some(store);
        self
    }

    /// Set pass timing
    pub fn settings(mut self, settings: ReconcileSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Cancel in-flight passes when `token` fires
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let clusters: Arc<dyn ObjectStore<ComputeCluster>> = match (self.clusters, &self.client) {
            (Some(store), _) => store,
            (None, Some(client)) => Arc::new(KubeStore::<ComputeCluster>::new(client.clone())),
            (None, None) => Arc::new(MemoryStore::<ComputeCluster>::new()),
        };
        let instances: Arc<dyn ObjectStore<ComputeInstance>> = match (self.instances, &self.client) {
            (Some(store), _) => store,
            (None, Some(client)) => Arc::new(KubeStore::<ComputeInstance>::new(client.clone())),
            (None, None) => Arc::new(MemoryStore::<ComputeInstance>::new()),
        };

        Context {
            clusters,
            instances,
            backends: self.backends,
            settings: self.settings,
            yields: YieldTracker::default(),
            shutdown: self.shutdown.unwrap_or_default(),
        }
    }
}

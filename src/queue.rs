//! The queue component: every configured endpoint behind one appender.

use crate::appender::{Appender, FanoutAppender};
use crate::clock::Clock;
use crate::config::{EndpointConfig, QueueConfig, SerializerConfig};
use crate::endpoint::Endpoint;
use crate::stats::{StatsCounters, StatsSinks};
use crate::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub struct Queue {
    base_dir: PathBuf,
    clock: Arc<dyn Clock>,
    counters: Option<Arc<StatsCounters>>,
    state: RwLock<State>,
}

struct State {
    config: QueueConfig,
    endpoints: BTreeMap<String, Arc<Endpoint>>,
    started: bool,
}

impl Queue {
    /// Builds one endpoint per configured destination. Nothing runs until
    /// [`Queue::start`].
    pub fn new(
        base_dir: impl Into<PathBuf>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        counters: Option<Arc<StatsCounters>>,
    ) -> Result<Self> {
        config.validate()?;
        let mut queue = Self {
            base_dir: base_dir.into(),
            clock,
            counters,
            state: RwLock::new(State {
                config: QueueConfig::default(),
                endpoints: BTreeMap::new(),
                started: false,
            }),
        };
        let mut endpoints = BTreeMap::new();
        let serializer_config = SerializerConfig::new(&config.persistence, config.ttl);
        for ep in &config.endpoints {
            endpoints.insert(
                ep.name.clone(),
                Arc::new(queue.build_endpoint(ep, serializer_config)?),
            );
        }
        {
            let state = queue.state.get_mut();
            state.config = config;
            state.endpoints = endpoints;
        }
        Ok(queue)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn build_endpoint(
        &self,
        config: &EndpointConfig,
        serializer_config: SerializerConfig,
    ) -> Result<Endpoint> {
        let sinks = match &self.counters {
            Some(counters) => StatsSinks::with_counters(&config.name, counters.clone()),
            None => StatsSinks::telemetry(&config.name),
        };
        Endpoint::new(
            &self.base_dir,
            config,
            serializer_config,
            self.clock.clone(),
            sinks,
        )
    }

    pub async fn start(&self) {
        let mut state = self.state.write().await;
        for endpoint in state.endpoints.values() {
            endpoint.start();
        }
        state.started = true;
    }

    /// Stops every endpoint, letting each flush its pending batch to disk.
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        for endpoint in state.endpoints.values() {
            endpoint.shutdown().await;
        }
        state.started = false;
    }

    pub async fn endpoint_names(&self) -> Vec<String> {
        self.state.read().await.endpoints.keys().cloned().collect()
    }

    pub async fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.state.read().await.endpoints.get(name).cloned()
    }

    /// An appender writing to every endpoint.
    pub async fn appender(&self) -> FanoutAppender {
        let state = self.state.read().await;
        FanoutAppender::new(
            state
                .endpoints
                .values()
                .map(|e| Box::new(e.appender()) as Box<dyn Appender>)
                .collect(),
        )
    }

    /// Applies a new configuration: removed endpoints are stopped, added ones
    /// are created, and the rest are updated in place. An invalid
    /// configuration changes nothing.
    pub async fn update(&self, config: QueueConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.state.write().await;
        let serializer_config = SerializerConfig::new(&config.persistence, config.ttl);

        let wanted: BTreeMap<&str, _> = config
            .endpoints
            .iter()
            .map(|e| (e.name.as_str(), e))
            .collect();

        let removed: Vec<String> = state
            .endpoints
            .keys()
            .filter(|name| !wanted.contains_key(name.as_str()))
            .cloned()
            .collect();
        for name in removed {
            if let Some(endpoint) = state.endpoints.remove(&name) {
                info!(endpoint = %name, "Removing endpoint");
                endpoint.shutdown().await;
            }
        }

        for (name, ep) in wanted {
            match state.endpoints.get(name).cloned() {
                Some(existing) => {
                    existing.update_config(ep, serializer_config).await?;
                }
                None => {
                    info!(endpoint = %name, url = %ep.url, "Adding endpoint");
                    let endpoint = Arc::new(self.build_endpoint(ep, serializer_config)?);
                    if state.started {
                        endpoint.start();
                    }
                    state.endpoints.insert(name.to_string(), endpoint);
                }
            }
        }
        state.config = config;
        Ok(())
    }

    pub async fn config(&self) -> QueueConfig {
        self.state.read().await.config.clone()
    }
}

//! Upstream publisher: the callback surface discovery plugins talk to.
//!
//! The publisher hosts the discovery plugin managers and funnels their
//! callbacks into the bus. All four operations are serialized under a single
//! mutex so the published order matches the applied order. Only id sets are
//! kept here; the matcher and balancer are the sources of truth for
//! attributes.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    core::{
        bus::EventBus,
        error::GatewayError,
        event::Event,
        upstream::{BackendId, BackendSpec, UpstreamId, UpstreamSpec},
    },
    plugin::{manager::PluginManager, rpc::CallbackHandler},
};

#[derive(Default)]
struct PublisherState {
    upstreams: HashSet<UpstreamId>,
    /// Backend id -> parent upstream id, so implicit removals can be
    /// forgotten when the parent goes away.
    backends: HashMap<BackendId, UpstreamId>,
}

/// Hosts discovery plugins and publishes their membership changes.
pub struct UpstreamPublisher {
    bus: Arc<EventBus>,
    state: Mutex<PublisherState>,
    managers: Mutex<Vec<Arc<PluginManager>>>,
}

impl UpstreamPublisher {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            state: Mutex::new(PublisherState::default()),
            managers: Mutex::new(Vec::new()),
        })
    }

    /// Attach a discovery plugin manager. Called during wiring, before
    /// `start`.
    pub fn attach_manager(&self, manager: Arc<PluginManager>) {
        self.managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(manager);
    }

    /// Start every discovery plugin manager.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let managers: Vec<_> = self
            .managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for manager in managers {
            manager.start().await?;
        }
        Ok(())
    }

    /// Stop every discovery plugin manager, bounded by `timeout` each.
    pub async fn stop(&self, timeout: Duration) {
        let managers: Vec<_> = self
            .managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for manager in managers {
            manager.stop(timeout).await;
        }
    }

    /// Record an upstream and publish `UpstreamAdded`. Mints an id when the
    /// plugin supplied none.
    pub fn add_upstream(&self, spec: UpstreamSpec) -> Result<UpstreamId, GatewayError> {
        let upstream = spec.into_upstream()?;
        let id = upstream.id;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.upstreams.insert(id);
        self.bus.publish(Event::UpstreamAdded(Arc::new(upstream)));
        tracing::info!(upstream = %id, "upstream added");
        Ok(id)
    }

    /// Forget an upstream (and its backends) and publish `UpstreamRemoved`.
    pub fn remove_upstream(&self, id: UpstreamId) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.upstreams.remove(&id) {
            return Err(GatewayError::UpstreamUnknown(id));
        }
        state.backends.retain(|_, parent| *parent != id);
        self.bus.publish(Event::UpstreamRemoved(id));
        tracing::info!(upstream = %id, "upstream removed");
        Ok(())
    }

    /// Record a backend under a known upstream and publish `BackendAdded`.
    pub fn add_backend(
        &self,
        upstream_id: UpstreamId,
        spec: BackendSpec,
    ) -> Result<BackendId, GatewayError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.upstreams.contains(&upstream_id) {
            return Err(GatewayError::UpstreamUnknown(upstream_id));
        }
        let backend = spec.into_backend(upstream_id)?;
        let id = backend.id;
        state.backends.insert(id, upstream_id);
        self.bus.publish(Event::BackendAdded {
            upstream_id,
            backend: Arc::new(backend),
        });
        tracing::info!(upstream = %upstream_id, backend = %id, "backend added");
        Ok(id)
    }

    /// Forget a backend and publish `BackendRemoved`.
    pub fn remove_backend(&self, id: BackendId) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.backends.remove(&id).is_none() {
            return Err(GatewayError::BackendUnknown(id));
        }
        self.bus.publish(Event::BackendRemoved(id));
        tracing::info!(backend = %id, "backend removed");
        Ok(())
    }
}

#[derive(Deserialize)]
struct AddUpstreamParams {
    upstream: UpstreamSpec,
}

#[derive(Deserialize)]
struct RemoveUpstreamParams {
    upstream_id: UpstreamId,
}

#[derive(Deserialize)]
struct AddBackendParams {
    upstream_id: UpstreamId,
    backend: BackendSpec,
}

#[derive(Deserialize)]
struct RemoveBackendParams {
    backend_id: BackendId,
}

/// The capability exported to discovery plugins over the RPC boundary.
#[async_trait]
impl CallbackHandler for UpstreamPublisher {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let invalid = |e: serde_json::Error| GatewayError::InvalidDefinition(e.to_string());
        match method {
            "add_upstream" => {
                let p: AddUpstreamParams = serde_json::from_value(params).map_err(invalid)?;
                let id = self.add_upstream(p.upstream)?;
                Ok(json!({ "upstream_id": id }))
            }
            "remove_upstream" => {
                let p: RemoveUpstreamParams = serde_json::from_value(params).map_err(invalid)?;
                self.remove_upstream(p.upstream_id)?;
                Ok(Value::Null)
            }
            "add_backend" => {
                let p: AddBackendParams = serde_json::from_value(params).map_err(invalid)?;
                let id = self.add_backend(p.upstream_id, p.backend)?;
                Ok(json!({ "backend_id": id }))
            }
            "remove_backend" => {
                let p: RemoveBackendParams = serde_json::from_value(params).map_err(invalid)?;
                self.remove_backend(p.backend_id)?;
                Ok(Value::Null)
            }
            other => Err(GatewayError::Internal(format!(
                "unknown publisher callback: {other}"
            ))),
        }
    }
}

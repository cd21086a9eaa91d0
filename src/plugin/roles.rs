//! Typed clients for each plugin role.
//!
//! These adapt the generic [`PluginManager`] call surface to the trait seams
//! the core components consume: the load-balancer plugin becomes a
//! [`BalancerPolicy`], modifier plugins become [`RequestModifier`]s and the
//! metric plugins together become one [`MetricExporter`].
use std::sync::Arc;

use async_trait::async_trait;
use eyre::WrapErr;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::{
    core::{
        balancer::BalancerPolicy,
        bus::{BusError, EventBus, ListenerId},
        error::GatewayError,
        event::{Event, EventKind},
        metrics::{EventMetric, MetricExporter, RequestMetric},
        modifier::{ModifyOutcome, RequestModifier},
        request::{GatewayRequest, GatewayResponse},
        upstream::{Backend, BackendId, UpstreamId},
    },
    plugin::manager::PluginManager,
};

/// Client for the load-balancer plugin role.
#[derive(Clone)]
pub struct BalancerClient {
    manager: Arc<PluginManager>,
}

#[derive(Deserialize)]
struct GetBackendResult {
    backend_id: BackendId,
}

impl BalancerClient {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }

    pub async fn add_backend(&self, backend: &Backend) -> eyre::Result<()> {
        self.manager
            .call(
                "add_backend",
                json!({ "upstream_id": backend.upstream_id, "backend": backend }),
            )
            .await
            .wrap_err("load-balancer plugin add_backend failed")?;
        Ok(())
    }

    pub async fn remove_backend(&self, backend_id: BackendId) -> eyre::Result<()> {
        self.manager
            .call("remove_backend", json!({ "backend_id": backend_id }))
            .await
            .wrap_err("load-balancer plugin remove_backend failed")?;
        Ok(())
    }

    /// Mirror backend membership events from the bus into the plugin's own
    /// pool. Runs on a queued bus listener so plugin latency never touches
    /// the publisher.
    pub fn spawn_pool_mirror(self, bus: &EventBus) -> Result<ListenerId, BusError> {
        let (tx, mut rx) = mpsc::channel::<Event>(64);
        let id = bus.add_listener(tx, &[EventKind::BackendAdded, EventKind::BackendRemoved])?;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let outcome = match &event {
                    Event::BackendAdded { backend, .. } => self.add_backend(backend).await,
                    Event::BackendRemoved(backend_id) => self.remove_backend(*backend_id).await,
                    _ => Ok(()),
                };
                if let Err(err) = outcome {
                    tracing::warn!(error = %err, "failed to mirror pool change into balancer plugin");
                }
            }
        });
        Ok(id)
    }
}

#[async_trait]
impl BalancerPolicy for BalancerClient {
    async fn select(&self, upstream_id: UpstreamId) -> eyre::Result<BackendId> {
        let result = self
            .manager
            .call("get_backend", json!({ "upstream_id": upstream_id }))
            .await
            .wrap_err("load-balancer plugin get_backend failed")?;
        let parsed: GetBackendResult =
            serde_json::from_value(result).wrap_err("malformed get_backend result")?;
        Ok(parsed.backend_id)
    }
}

/// Client for one modifier plugin manager.
#[derive(Clone)]
pub struct ModifierClient {
    manager: Arc<PluginManager>,
}

#[derive(Deserialize)]
struct ModifyRequestResult {
    #[serde(default)]
    request: Option<GatewayRequest>,
    #[serde(default)]
    response: Option<GatewayResponse>,
}

impl ModifierClient {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl RequestModifier for ModifierClient {
    async fn modify_request(&self, req: GatewayRequest) -> eyre::Result<ModifyOutcome> {
        let result = self
            .manager
            .call("modify_request", json!({ "request": &req }))
            .await
            .wrap_err("modifier plugin modify_request failed")?;
        let parsed: ModifyRequestResult =
            serde_json::from_value(result).wrap_err("malformed modify_request result")?;
        if let Some(response) = parsed.response {
            return Ok(ModifyOutcome::Respond(response));
        }
        Ok(ModifyOutcome::Continue(parsed.request.unwrap_or(req)))
    }

    async fn modify_error_response(
        &self,
        error: &GatewayError,
        req: &GatewayRequest,
        resp: GatewayResponse,
    ) -> eyre::Result<GatewayResponse> {
        let result = self
            .manager
            .call(
                "modify_error_response",
                json!({
                    "error": { "kind": error.kind(), "message": error.to_string() },
                    "request": req,
                    "response": &resp,
                }),
            )
            .await
            .wrap_err("modifier plugin modify_error_response failed")?;
        if result.is_null() {
            return Ok(resp);
        }
        serde_json::from_value(result).wrap_err("malformed modify_error_response result")
    }
}

/// Fans metric batches out to every configured metric plugin manager.
pub struct MetricFanout {
    managers: Vec<Arc<PluginManager>>,
}

impl MetricFanout {
    pub fn new(managers: Vec<Arc<PluginManager>>) -> Self {
        Self { managers }
    }
}

#[async_trait]
impl MetricExporter for MetricFanout {
    async fn export_request_metrics(&self, batch: &[RequestMetric]) -> eyre::Result<()> {
        for manager in &self.managers {
            if let Err(err) = manager
                .call("request_metrics", json!({ "metrics": batch }))
                .await
            {
                tracing::warn!(error = %err, "metric plugin rejected a request-metric batch");
            }
        }
        Ok(())
    }

    async fn export_event_metrics(&self, batch: &[EventMetric]) -> eyre::Result<()> {
        for manager in &self.managers {
            if let Err(err) = manager
                .call("event_metrics", json!({ "metrics": batch }))
                .await
            {
                tracing::warn!(error = %err, "metric plugin rejected an event-metric batch");
            }
        }
        Ok(())
    }
}

//! Per-upstream backend pools and request-time backend selection.
//!
//! Pools are derived from membership events: created empty on
//! `UpstreamAdded`, filled by `BackendAdded`, cleared on `UpstreamRemoved`.
//! Selection delegates to a policy (normally the load-balancer plugin); when
//! the policy fails the balancer falls back to uniform-random selection so
//! the request path stays live.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use rand::Rng;

use crate::core::{
    bus::InlineConsumer,
    error::GatewayError,
    event::Event,
    upstream::{Backend, BackendId, UpstreamId},
};

/// A backend-selection policy. The production implementation lives in the
/// load-balancer plugin; tests supply their own.
#[async_trait]
pub trait BalancerPolicy: Send + Sync {
    /// Select one backend id for the upstream. Returning an id that is not
    /// in the current pool counts as a policy failure.
    async fn select(&self, upstream_id: UpstreamId) -> eyre::Result<BackendId>;
}

/// Keeps backend pools in sync with the bus and answers `pick` per request.
pub struct LoadBalancer {
    pools: RwLock<HashMap<UpstreamId, Vec<Arc<Backend>>>>,
    policy: Option<Arc<dyn BalancerPolicy>>,
}

impl LoadBalancer {
    pub fn new(policy: Option<Arc<dyn BalancerPolicy>>) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Select a backend for the upstream.
    pub async fn pick(&self, upstream_id: UpstreamId) -> Result<Arc<Backend>, GatewayError> {
        let backends = {
            let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
            pools
                .get(&upstream_id)
                .cloned()
                .ok_or(GatewayError::UpstreamUnknown(upstream_id))?
        };
        if backends.is_empty() {
            return Err(GatewayError::NoBackendsAvailable(upstream_id));
        }

        if let Some(policy) = &self.policy {
            match policy.select(upstream_id).await {
                Ok(id) => {
                    if let Some(backend) = backends.iter().find(|b| b.id == id) {
                        return Ok(backend.clone());
                    }
                    tracing::warn!(
                        upstream = %upstream_id,
                        backend = %id,
                        "policy selected a backend not in the pool, falling back"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        upstream = %upstream_id,
                        error = %err,
                        "balancer policy failed, falling back to uniform-random"
                    );
                }
            }
        }

        let idx = rand::rng().random_range(0..backends.len());
        Ok(backends[idx].clone())
    }

    /// Current pool size for an upstream, `None` when unknown.
    pub fn pool_size(&self, upstream_id: UpstreamId) -> Option<usize> {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&upstream_id)
            .map(|pool| pool.len())
    }

    fn apply_upstream_added(&self, upstream_id: UpstreamId) {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        pools.entry(upstream_id).or_default();
    }

    fn apply_upstream_removed(&self, upstream_id: UpstreamId) {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        pools.remove(&upstream_id);
    }

    fn apply_backend_added(&self, upstream_id: UpstreamId, backend: Arc<Backend>) {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        let Some(pool) = pools.get_mut(&upstream_id) else {
            tracing::error!(
                upstream = %upstream_id,
                backend = %backend.id,
                "backend added for an unknown upstream"
            );
            return;
        };
        // Duplicate adds for the same backend id are idempotent.
        if !pool.iter().any(|b| b.id == backend.id) {
            pool.push(backend);
        }
    }

    fn apply_backend_removed(&self, backend_id: BackendId) {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        for pool in pools.values_mut() {
            pool.retain(|b| b.id != backend_id);
        }
    }
}

impl InlineConsumer for LoadBalancer {
    fn on_event(&self, event: &Event) {
        match event {
            Event::UpstreamAdded(upstream) => self.apply_upstream_added(upstream.id),
            Event::UpstreamRemoved(id) => self.apply_upstream_removed(*id),
            Event::BackendAdded {
                upstream_id,
                backend,
            } => self.apply_backend_added(*upstream_id, backend.clone()),
            Event::BackendRemoved(id) => self.apply_backend_removed(*id),
            other => {
                tracing::error!(kind = ?other.kind(), "balancer received an unexpected event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::upstream::BackendSpec;

    fn backend(upstream_id: UpstreamId, addr: &str) -> Arc<Backend> {
        Arc::new(
            BackendSpec {
                id: None,
                address: addr.into(),
                weight: 1,
            }
            .into_backend(upstream_id)
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn unknown_upstream_and_empty_pool_errors() {
        let lb = LoadBalancer::new(None);
        let id = UpstreamId::new();

        assert!(matches!(
            lb.pick(id).await,
            Err(GatewayError::UpstreamUnknown(_))
        ));

        lb.apply_upstream_added(id);
        assert!(matches!(
            lb.pick(id).await,
            Err(GatewayError::NoBackendsAvailable(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_backend_add_is_idempotent() {
        let lb = LoadBalancer::new(None);
        let id = UpstreamId::new();
        lb.apply_upstream_added(id);

        let b = backend(id, "http://127.0.0.1:9001");
        lb.apply_backend_added(id, b.clone());
        lb.apply_backend_added(id, b.clone());
        assert_eq!(lb.pool_size(id), Some(1));
    }

    #[tokio::test]
    async fn upstream_removal_clears_pool() {
        let lb = LoadBalancer::new(None);
        let id = UpstreamId::new();
        lb.apply_upstream_added(id);
        lb.apply_backend_added(id, backend(id, "http://127.0.0.1:9001"));

        lb.apply_upstream_removed(id);
        assert_eq!(lb.pool_size(id), None);
        assert!(matches!(
            lb.pick(id).await,
            Err(GatewayError::UpstreamUnknown(_))
        ));
    }

    #[tokio::test]
    async fn backend_removal_by_id() {
        let lb = LoadBalancer::new(None);
        let id = UpstreamId::new();
        lb.apply_upstream_added(id);
        let b1 = backend(id, "http://127.0.0.1:9001");
        let b2 = backend(id, "http://127.0.0.1:9002");
        lb.apply_backend_added(id, b1.clone());
        lb.apply_backend_added(id, b2.clone());

        lb.apply_backend_removed(b1.id);
        assert_eq!(lb.pool_size(id), Some(1));
        let picked = lb.pick(id).await.unwrap();
        assert_eq!(picked.id, b2.id);
    }

    struct FailingPolicy;

    #[async_trait]
    impl BalancerPolicy for FailingPolicy {
        async fn select(&self, _upstream_id: UpstreamId) -> eyre::Result<BackendId> {
            Err(eyre::eyre!("plugin transport down"))
        }
    }

    #[tokio::test]
    async fn policy_failure_falls_back_to_random_member() {
        let lb = LoadBalancer::new(Some(Arc::new(FailingPolicy)));
        let id = UpstreamId::new();
        lb.apply_upstream_added(id);
        let b1 = backend(id, "http://127.0.0.1:9001");
        let b2 = backend(id, "http://127.0.0.1:9002");
        lb.apply_backend_added(id, b1.clone());
        lb.apply_backend_added(id, b2.clone());

        let picked = lb.pick(id).await.unwrap();
        assert!(picked.id == b1.id || picked.id == b2.id);
    }

    struct FixedPolicy(BackendId);

    #[async_trait]
    impl BalancerPolicy for FixedPolicy {
        async fn select(&self, _upstream_id: UpstreamId) -> eyre::Result<BackendId> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn policy_choice_is_validated_against_the_pool() {
        let id = UpstreamId::new();
        let b1 = backend(id, "http://127.0.0.1:9001");

        // A policy returning a member id is honored.
        let lb = LoadBalancer::new(Some(Arc::new(FixedPolicy(b1.id))));
        lb.apply_upstream_added(id);
        lb.apply_backend_added(id, b1.clone());
        assert_eq!(lb.pick(id).await.unwrap().id, b1.id);

        // A policy returning a stale id falls back to a live member.
        let lb = LoadBalancer::new(Some(Arc::new(FixedPolicy(BackendId::new()))));
        lb.apply_upstream_added(id);
        lb.apply_backend_added(id, b1.clone());
        assert_eq!(lb.pick(id).await.unwrap().id, b1.id);
    }
}

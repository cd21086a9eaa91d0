//! Request and error-response modification.
//!
//! Modifiers are applied in registration order. A modifier may rewrite the
//! request descriptor, answer with an early response (which short-circuits
//! balancing and proxying), or fail, which skips the remaining modifiers.
//! Error-response modification is best-effort: if it fails, the client gets
//! a generic 500 carrying the original error text.
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{
    error::GatewayError,
    request::{GatewayRequest, GatewayResponse},
};

/// Outcome of a single `modify_request` step.
#[derive(Debug, Clone)]
pub enum ModifyOutcome {
    /// Continue down the pipeline with the (possibly rewritten) request.
    Continue(GatewayRequest),
    /// Short-circuit: skip balancing and proxying, write this response.
    Respond(GatewayResponse),
}

/// One request/response modifier. The production implementation delegates to
/// a modifier plugin.
#[async_trait]
pub trait RequestModifier: Send + Sync {
    async fn modify_request(&self, req: GatewayRequest) -> eyre::Result<ModifyOutcome>;

    async fn modify_error_response(
        &self,
        error: &GatewayError,
        req: &GatewayRequest,
        resp: GatewayResponse,
    ) -> eyre::Result<GatewayResponse>;
}

/// Applies a sequence of modifiers in registration order. An empty chain is
/// the identity.
#[derive(Default)]
pub struct ModifierChain {
    modifiers: Vec<Arc<dyn RequestModifier>>,
}

impl ModifierChain {
    pub fn new(modifiers: Vec<Arc<dyn RequestModifier>>) -> Self {
        Self { modifiers }
    }

    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }

    /// Run the request through every modifier. The first early response or
    /// error stops the chain.
    pub async fn modify_request(
        &self,
        mut req: GatewayRequest,
    ) -> Result<ModifyOutcome, GatewayError> {
        for modifier in &self.modifiers {
            match modifier.modify_request(req).await {
                Ok(ModifyOutcome::Continue(next)) => req = next,
                Ok(ModifyOutcome::Respond(resp)) => return Ok(ModifyOutcome::Respond(resp)),
                Err(err) => return Err(GatewayError::ModifierFailed(err.to_string())),
            }
        }
        Ok(ModifyOutcome::Continue(req))
    }

    /// Run an error response through every modifier. Never fails: a modifier
    /// failure yields a generic 500 carrying the original error text.
    pub async fn modify_error_response(
        &self,
        error: &GatewayError,
        req: &GatewayRequest,
        mut resp: GatewayResponse,
    ) -> GatewayResponse {
        for modifier in &self.modifiers {
            match modifier.modify_error_response(error, req, resp.clone()).await {
                Ok(next) => resp = next,
                Err(err) => {
                    tracing::warn!(error = %err, "error-response modifier failed");
                    return GatewayResponse {
                        status: 500,
                        headers: Default::default(),
                        body: error.to_string(),
                    };
                }
            }
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::Protocol;

    struct PathPrepender(&'static str);

    #[async_trait]
    impl RequestModifier for PathPrepender {
        async fn modify_request(&self, mut req: GatewayRequest) -> eyre::Result<ModifyOutcome> {
            req.path = format!("{}{}", self.0, req.path);
            Ok(ModifyOutcome::Continue(req))
        }

        async fn modify_error_response(
            &self,
            _error: &GatewayError,
            _req: &GatewayRequest,
            mut resp: GatewayResponse,
        ) -> eyre::Result<GatewayResponse> {
            resp.body = format!("{}: {}", self.0, resp.body);
            Ok(resp)
        }
    }

    struct EarlyResponder;

    #[async_trait]
    impl RequestModifier for EarlyResponder {
        async fn modify_request(&self, _req: GatewayRequest) -> eyre::Result<ModifyOutcome> {
            Ok(ModifyOutcome::Respond(GatewayResponse {
                status: 204,
                headers: Default::default(),
                body: String::new(),
            }))
        }

        async fn modify_error_response(
            &self,
            _error: &GatewayError,
            _req: &GatewayRequest,
            resp: GatewayResponse,
        ) -> eyre::Result<GatewayResponse> {
            Ok(resp)
        }
    }

    struct Failing;

    #[async_trait]
    impl RequestModifier for Failing {
        async fn modify_request(&self, _req: GatewayRequest) -> eyre::Result<ModifyOutcome> {
            Err(eyre::eyre!("plugin rejected the request"))
        }

        async fn modify_error_response(
            &self,
            _error: &GatewayError,
            _req: &GatewayRequest,
            _resp: GatewayResponse,
        ) -> eyre::Result<GatewayResponse> {
            Err(eyre::eyre!("plugin rejected the response"))
        }
    }

    fn req() -> GatewayRequest {
        GatewayRequest::new("GET", "api.test", "/x", Protocol::HttpPublic)
    }

    #[tokio::test]
    async fn empty_chain_is_identity() {
        let chain = ModifierChain::default();
        match chain.modify_request(req()).await.unwrap() {
            ModifyOutcome::Continue(out) => assert_eq!(out.path, "/x"),
            ModifyOutcome::Respond(_) => panic!("unexpected early response"),
        }
    }

    #[tokio::test]
    async fn modifiers_apply_in_registration_order() {
        let chain = ModifierChain::new(vec![
            Arc::new(PathPrepender("/a")),
            Arc::new(PathPrepender("/b")),
        ]);
        match chain.modify_request(req()).await.unwrap() {
            ModifyOutcome::Continue(out) => assert_eq!(out.path, "/b/a/x"),
            ModifyOutcome::Respond(_) => panic!("unexpected early response"),
        }
    }

    #[tokio::test]
    async fn early_response_short_circuits() {
        let chain = ModifierChain::new(vec![
            Arc::new(EarlyResponder),
            Arc::new(Failing), // must never run
        ]);
        match chain.modify_request(req()).await.unwrap() {
            ModifyOutcome::Respond(resp) => assert_eq!(resp.status, 204),
            ModifyOutcome::Continue(_) => panic!("expected early response"),
        }
    }

    #[tokio::test]
    async fn request_modifier_failure_propagates() {
        let chain = ModifierChain::new(vec![Arc::new(Failing)]);
        assert!(matches!(
            chain.modify_request(req()).await,
            Err(GatewayError::ModifierFailed(_))
        ));
    }

    #[tokio::test]
    async fn error_modifier_failure_falls_back_to_generic_500() {
        let chain = ModifierChain::new(vec![Arc::new(Failing)]);
        let error = GatewayError::UpstreamNotFound;
        let resp = chain
            .modify_error_response(&error, &req(), GatewayResponse::from_error(&error))
            .await;
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body, error.to_string());
    }

    #[tokio::test]
    async fn error_modifiers_may_rewrite_the_response() {
        let chain = ModifierChain::new(vec![Arc::new(PathPrepender("custom"))]);
        let error = GatewayError::UpstreamNotFound;
        let resp = chain
            .modify_error_response(&error, &req(), GatewayResponse::from_error(&error))
            .await;
        assert_eq!(resp.status, 400);
        assert!(resp.body.starts_with("custom: "));
    }
}

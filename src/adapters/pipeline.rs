//! Per-request orchestration: route, balance, modify, proxy, respond.
//!
//! The pipeline is a linear state machine; each transition records its
//! duration into the request metric. Any error short-circuits into the
//! error path: the mapped response runs through the error-response
//! modifiers, a `RequestError` event is published, and the metric is
//! emitted. The metric is emitted exactly once per request, on scope exit:
//! a guard travels with the response body so proxied transfers are measured
//! to the end of the body copy.
use std::{
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Instant,
};

use axum::body::{Body as AxumBody, Bytes};
use chrono::Utc;
use http_body::Frame;
use hyper::{header, Request, Response, StatusCode};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    adapters::proxier::Proxier,
    core::{
        balancer::LoadBalancer,
        bus::EventBus,
        error::GatewayError,
        event::{Event, EventKind},
        matcher::UpstreamMatcher,
        metrics::{MetricError, MetricSink, RequestMetric},
        modifier::{ModifierChain, ModifyOutcome},
        request::{GatewayRequest, GatewayResponse, Protocol},
        upstream::strip_prefix_path,
    },
    utils::connection_tracker::{ConnectionInfo, ConnectionTracker},
};

/// The per-request pipeline shared by every listener.
pub struct RequestPipeline {
    matcher: Arc<UpstreamMatcher>,
    balancer: Arc<LoadBalancer>,
    modifiers: Arc<ModifierChain>,
    proxier: Arc<Proxier>,
    sink: Arc<MetricSink>,
    bus: Arc<EventBus>,
    tracker: Arc<ConnectionTracker>,
    draining: Arc<AtomicBool>,
}

impl RequestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        matcher: Arc<UpstreamMatcher>,
        balancer: Arc<LoadBalancer>,
        modifiers: Arc<ModifierChain>,
        proxier: Arc<Proxier>,
        sink: Arc<MetricSink>,
        bus: Arc<EventBus>,
        tracker: Arc<ConnectionTracker>,
        draining: Arc<AtomicBool>,
    ) -> Self {
        Self {
            matcher,
            balancer,
            modifiers,
            proxier,
            sink,
            bus,
            tracker,
            draining,
        }
    }

    /// Handle one request end to end. Infallible: every failure becomes an
    /// error response.
    pub async fn handle(
        &self,
        req: Request<AxumBody>,
        protocol: Protocol,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let start = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let (parts, body) = req.into_parts();

        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| parts.uri.host())
            .unwrap_or_default();
        let mut gw_req =
            GatewayRequest::new(parts.method.as_str(), host, parts.uri.path(), protocol);
        for (name, value) in &parts.headers {
            if let Ok(value) = value.to_str() {
                gw_req
                    .headers
                    .insert(name.as_str().to_string(), value.to_string());
            }
        }

        let span = tracing::info_span!(
            "request",
            %request_id,
            http.method = %gw_req.method,
            http.host = %gw_req.host,
            http.path = %gw_req.path,
            client.addr = ?client_addr,
        );

        let metric = RequestMetric::new(&gw_req.method, &gw_req.host, &gw_req.path, protocol);
        let conn = client_addr.map(|addr| {
            let conn = self.tracker.register(addr);
            conn.increment_requests();
            conn
        });
        let guard = RequestGuard {
            sink: self.sink.clone(),
            tracker: self.tracker.clone(),
            conn,
            metric: Some(metric),
            start,
        };

        self.run(gw_req, parts.uri.query(), body, client_addr, guard)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        mut gw_req: GatewayRequest,
        query: Option<&str>,
        body: AxumBody,
        client_addr: Option<SocketAddr>,
        mut guard: RequestGuard,
    ) -> Response<AxumBody> {
        self.bus
            .publish(Event::lifecycle(EventKind::RequestAccepted));

        if self.draining.load(Ordering::Acquire) {
            return self
                .error_response(GatewayError::Draining, &gw_req, guard)
                .await;
        }

        // Route.
        let step = Instant::now();
        let matched = match self.matcher.match_request(&gw_req.host, &gw_req.path) {
            Ok(matched) => matched,
            Err(err) => return self.error_response(err, &gw_req, guard).await,
        };
        {
            let metric = guard.metric_mut();
            metric.router_latency = step.elapsed();
            metric.upstream_id = Some(matched.upstream.id);
        }
        if let Some(prefix) = &matched.prefix {
            gw_req.path = strip_prefix_path(prefix, &gw_req.path);
            gw_req.prefix = Some(prefix.clone());
            guard.metric_mut().prefix = Some(prefix.clone());
        }
        let upstream = matched.upstream;

        // Balance.
        let step = Instant::now();
        let backend = match self.balancer.pick(upstream.id).await {
            Ok(backend) => backend,
            Err(err) => return self.error_response(err, &gw_req, guard).await,
        };
        {
            let metric = guard.metric_mut();
            metric.balancer_latency = step.elapsed();
            metric.backend_id = Some(backend.id);
        }
        tracing::debug!(upstream = %upstream.id, backend = %backend.address, "request routed");

        // Modify.
        let step = Instant::now();
        match self.modifiers.modify_request(gw_req).await {
            Ok(ModifyOutcome::Continue(next)) => {
                gw_req = next;
                guard.metric_mut().modifier_latency = step.elapsed();
            }
            Ok(ModifyOutcome::Respond(resp)) => {
                // Early response: skip the proxy entirely.
                guard.metric_mut().modifier_latency = step.elapsed();
                guard.metric_mut().set_status(resp.status);
                self.bus
                    .publish(Event::lifecycle(EventKind::RequestSuccess));
                return render(resp);
            }
            Err(err) => {
                // The descriptor was consumed by the chain; rebuild enough
                // of it for the error modifiers and the metric.
                let fallback = {
                    let metric = guard.metric_mut();
                    GatewayRequest::new(
                        &metric.method.clone(),
                        &metric.host.clone(),
                        &metric.path.clone(),
                        metric.protocol,
                    )
                };
                return self.error_response(err, &fallback, guard).await;
            }
        }

        // Proxy.
        let proxy_start = Instant::now();
        match self
            .proxier
            .proxy(
                &gw_req,
                body,
                query,
                client_addr,
                &upstream,
                &backend,
                guard.metric_mut(),
            )
            .await
        {
            Ok(response) => {
                self.bus
                    .publish(Event::lifecycle(EventKind::RequestSuccess));
                let (parts, body) = response.into_parts();
                let metered = MeteredBody {
                    inner: body,
                    guard: Some(guard),
                    proxy_start,
                };
                Response::from_parts(parts, AxumBody::new(metered))
            }
            Err(err) => {
                guard.metric_mut().proxy_latency = proxy_start.elapsed();
                self.error_response(err, &gw_req, guard).await
            }
        }
    }

    /// The shared error path: map, modify, publish, respond. The metric is
    /// emitted when `guard` drops at the end of this scope.
    async fn error_response(
        &self,
        err: GatewayError,
        gw_req: &GatewayRequest,
        mut guard: RequestGuard,
    ) -> Response<AxumBody> {
        tracing::warn!(kind = err.kind(), error = %err, "request failed");
        guard.metric_mut().error = Some(MetricError {
            kind: err.kind().to_string(),
            message: err.to_string(),
        });

        let resp = GatewayResponse::from_error(&err);
        let resp = self
            .modifiers
            .modify_error_response(&err, gw_req, resp)
            .await;
        guard.metric_mut().set_status(resp.status);

        self.bus.publish(Event::lifecycle(EventKind::RequestError));
        render(resp)
    }
}

/// Materialize a [`GatewayResponse`] as an HTTP response.
fn render(resp: GatewayResponse) -> Response<AxumBody> {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &resp.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(AxumBody::from(resp.body))
        .unwrap_or_else(|_| Response::new(AxumBody::from("internal error")))
}

/// Emits the request metric exactly once, on drop, and releases the
/// connection-tracker registration.
struct RequestGuard {
    sink: Arc<MetricSink>,
    tracker: Arc<ConnectionTracker>,
    conn: Option<Arc<ConnectionInfo>>,
    metric: Option<RequestMetric>,
    start: Instant,
}

impl RequestGuard {
    fn metric_mut(&mut self) -> &mut RequestMetric {
        self.metric.as_mut().expect("metric emitted twice")
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if let Some(mut metric) = self.metric.take() {
            metric.timestamp = Utc::now();
            metric.total_latency = self.start.elapsed();
            metric.internal_latency = metric.total_latency.saturating_sub(metric.proxy_latency);
            self.sink.write_request(metric);
        }
        if let Some(conn) = self.conn.take() {
            conn.decrement_requests();
            self.tracker.unregister(conn.id);
        }
    }
}

/// Streams the backend body to the client while extending the proxy latency
/// to the end of the body copy. Dropping mid-stream (client disconnect)
/// still emits the metric through the guard.
struct MeteredBody {
    inner: AxumBody,
    guard: Option<RequestGuard>,
    proxy_start: Instant,
}

impl MeteredBody {
    fn finish(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            if let Some(metric) = guard.metric.as_mut() {
                metric.proxy_latency = self.proxy_start.elapsed();
            }
            // Dropping the guard emits the metric with final latencies.
        }
    }
}

impl http_body::Body for MeteredBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        adapters::proxy_client::PooledProxyClient,
        core::upstream::{BackendSpec, UpstreamSpec, UpstreamTimeouts},
    };

    fn pipeline() -> (RequestPipeline, Arc<EventBus>, Arc<MetricSink>) {
        let bus = Arc::new(EventBus::new());
        let matcher = Arc::new(UpstreamMatcher::new());
        let balancer = Arc::new(LoadBalancer::new(None));
        bus.add_inline(
            matcher.clone(),
            &[EventKind::UpstreamAdded, EventKind::UpstreamRemoved],
        )
        .unwrap();
        bus.add_inline(balancer.clone(), &crate::core::event::MEMBERSHIP_KINDS)
            .unwrap();

        let sink = MetricSink::new(1024, Duration::from_secs(3600));
        let client = Arc::new(PooledProxyClient::new(Duration::from_millis(200)).unwrap());
        let proxier = Arc::new(Proxier::new(client, Duration::from_secs(1)));
        let pipeline = RequestPipeline::new(
            matcher,
            balancer,
            Arc::new(ModifierChain::default()),
            proxier,
            sink.clone(),
            bus.clone(),
            Arc::new(ConnectionTracker::new()),
            Arc::new(AtomicBool::new(false)),
        );
        (pipeline, bus, sink)
    }

    fn get(host: &str, path: &str) -> Request<AxumBody> {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(AxumBody::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn unmatched_request_gets_400() {
        let (pipeline, _bus, _sink) = pipeline();
        let resp = pipeline
            .handle(get("nowhere.test", "/x"), Protocol::HttpPublic, None)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn matched_upstream_without_backends_gets_502() {
        let (pipeline, bus, _sink) = pipeline();
        let upstream = UpstreamSpec {
            id: None,
            name: "svc".into(),
            hostnames: vec!["api.test".into()],
            prefixes: vec![],
            timeouts: UpstreamTimeouts::default(),
        }
        .into_upstream()
        .unwrap();
        bus.publish(Event::UpstreamAdded(Arc::new(upstream)));

        let resp = pipeline
            .handle(get("api.test", "/x"), Protocol::HttpPublic, None)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn unreachable_backend_gets_504() {
        let (pipeline, bus, _sink) = pipeline();
        let upstream = UpstreamSpec {
            id: None,
            name: "svc".into(),
            hostnames: vec!["api.test".into()],
            prefixes: vec![],
            timeouts: UpstreamTimeouts::default(),
        }
        .into_upstream()
        .unwrap();
        let uid = upstream.id;
        bus.publish(Event::UpstreamAdded(Arc::new(upstream)));
        let backend = BackendSpec {
            id: None,
            // TEST-NET-1: never routable.
            address: "http://192.0.2.1:9".into(),
            weight: 1,
        }
        .into_backend(uid)
        .unwrap();
        bus.publish(Event::BackendAdded {
            upstream_id: uid,
            backend: Arc::new(backend),
        });

        let resp = pipeline
            .handle(get("api.test", "/x"), Protocol::HttpPublic, None)
            .await;
        // Connect timeout surfaces as unreachable (504) or, if the deadline
        // fires first, as a timeout (502).
        assert!(
            resp.status() == StatusCode::GATEWAY_TIMEOUT
                || resp.status() == StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn draining_rejects_with_503() {
        let (mut pipeline, _bus, _sink) = pipeline();
        pipeline.draining = Arc::new(AtomicBool::new(true));
        let resp = pipeline
            .handle(get("api.test", "/x"), Protocol::HttpPublic, None)
            .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn every_request_emits_exactly_one_metric() {
        let (pipeline, _bus, sink) = pipeline();
        for _ in 0..3 {
            pipeline
                .handle(get("nowhere.test", "/x"), Protocol::HttpPublic, None)
                .await;
        }

        struct Probe(std::sync::Mutex<usize>);
        #[async_trait::async_trait]
        impl crate::core::metrics::MetricExporter for Probe {
            async fn export_request_metrics(&self, batch: &[RequestMetric]) -> eyre::Result<()> {
                *self.0.lock().unwrap() += batch.len();
                Ok(())
            }
            async fn export_event_metrics(
                &self,
                _batch: &[crate::core::metrics::EventMetric],
            ) -> eyre::Result<()> {
                Ok(())
            }
        }
        let probe = Arc::new(Probe(std::sync::Mutex::new(0)));
        sink.start(probe.clone());
        sink.stop().await;
        assert_eq!(*probe.0.lock().unwrap(), 3);
    }
}

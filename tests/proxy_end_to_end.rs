// End-to-end tests: a real backend, a wired gateway, real sockets.
use std::{net::SocketAddr, time::Duration};

use axum::{body::Body, extract::Request, routing::any, Router};
use dendrite::{
    config::{GatewayConfig, TimeoutConfig},
    core::upstream::{BackendSpec, UpstreamSpec},
    Gateway,
};
use http_body_util::BodyExt;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;

/// A backend that answers every request with its method and path.
async fn spawn_backend() -> SocketAddr {
    let app = Router::new().fallback(any(|req: Request| async move {
        format!("hello {} {}", req.method(), req.uri().path())
    }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A backend that sleeps before answering, for drain tests.
async fn spawn_slow_backend(delay: Duration) -> SocketAddr {
    let app = Router::new().fallback(any(move || async move {
        tokio::time::sleep(delay).await;
        "slow hello"
    }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn_gateway(drain_ms: u64) -> (Gateway, u16) {
    let port = free_port();
    let config = GatewayConfig::builder()
        .http_public_port(port)
        .timeouts(TimeoutConfig {
            drain_ms,
            ..Default::default()
        })
        .build();
    let gateway = Gateway::new(config).unwrap();
    gateway.start().await.unwrap();
    // Give the listener task a beat to enter its accept loop.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (gateway, port)
}

fn client() -> Client<HttpConnector, Body> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn get(
    client: &Client<HttpConnector, Body>,
    port: u16,
    host: &str,
    path: &str,
) -> (hyper::StatusCode, String) {
    let req = Request::builder()
        .uri(format!("http://127.0.0.1:{port}{path}"))
        .header(hyper::header::HOST, host)
        .body(Body::empty())
        .unwrap();
    let resp = client.request(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).to_string())
}

fn hostname_upstream(hostname: &str) -> UpstreamSpec {
    UpstreamSpec {
        id: None,
        name: hostname.into(),
        hostnames: vec![hostname.into()],
        prefixes: vec![],
        timeouts: Default::default(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn routes_by_hostname() {
    let backend_addr = spawn_backend().await;
    let (gateway, port) = spawn_gateway(5_000).await;

    let publisher = gateway.publisher();
    let uid = publisher.add_upstream(hostname_upstream("api.test")).unwrap();
    publisher
        .add_backend(
            uid,
            BackendSpec {
                id: None,
                address: format!("http://{backend_addr}"),
                weight: 1,
            },
        )
        .unwrap();

    let client = client();
    let (status, body) = get(&client, port, "api.test", "/foo").await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(body, "hello GET /foo");

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn routes_by_prefix_and_strips_it() {
    let backend_addr = spawn_backend().await;
    let (gateway, port) = spawn_gateway(5_000).await;

    let publisher = gateway.publisher();
    let uid = publisher
        .add_upstream(UpstreamSpec {
            id: None,
            name: "api".into(),
            hostnames: vec![],
            prefixes: vec!["/api".into()],
            timeouts: Default::default(),
        })
        .unwrap();
    publisher
        .add_backend(
            uid,
            BackendSpec {
                id: None,
                address: format!("http://{backend_addr}"),
                weight: 1,
            },
        )
        .unwrap();

    let client = client();
    let (status, body) = get(&client, port, "anything.test", "/api/v1/x").await;
    assert_eq!(status, hyper::StatusCode::OK);
    // The matched prefix is stripped before the request reaches the backend.
    assert_eq!(body, "hello GET /v1/x");

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unmatched_requests_get_400() {
    let (gateway, port) = spawn_gateway(5_000).await;

    let client = client();
    let (status, _) = get(&client, port, "unknown.test", "/x").await;
    assert_eq!(status, hyper::StatusCode::BAD_REQUEST);

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_without_backends_gets_502() {
    let (gateway, port) = spawn_gateway(5_000).await;
    gateway
        .publisher()
        .add_upstream(hostname_upstream("api.test"))
        .unwrap();

    let client = client();
    let (status, _) = get(&client, port, "api.test", "/x").await;
    assert_eq!(status, hyper::StatusCode::BAD_GATEWAY);

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_upstream_stops_routing() {
    let backend_addr = spawn_backend().await;
    let (gateway, port) = spawn_gateway(5_000).await;

    let publisher = gateway.publisher();
    let uid = publisher.add_upstream(hostname_upstream("api.test")).unwrap();
    publisher
        .add_backend(
            uid,
            BackendSpec {
                id: None,
                address: format!("http://{backend_addr}"),
                weight: 1,
            },
        )
        .unwrap();

    let client = client();
    let (status, _) = get(&client, port, "api.test", "/x").await;
    assert_eq!(status, hyper::StatusCode::OK);

    publisher.remove_upstream(uid).unwrap();
    let (status, _) = get(&client, port, "api.test", "/x").await;
    assert_eq!(status, hyper::StatusCode::BAD_REQUEST);

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_completes_in_flight_requests() {
    let backend_addr = spawn_slow_backend(Duration::from_secs(1)).await;
    let (gateway, port) = spawn_gateway(5_000).await;

    let publisher = gateway.publisher();
    let uid = publisher.add_upstream(hostname_upstream("api.test")).unwrap();
    publisher
        .add_backend(
            uid,
            BackendSpec {
                id: None,
                address: format!("http://{backend_addr}"),
                weight: 1,
            },
        )
        .unwrap();

    // Start a slow request, then stop the gateway while it is in flight.
    let in_flight = {
        let client = client();
        tokio::spawn(async move { get(&client, port, "api.test", "/slow").await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stop_started = std::time::Instant::now();
    gateway.stop().await;
    let stop_elapsed = stop_started.elapsed();

    // The in-flight request completed normally and stop returned within the
    // drain deadline.
    let (status, body) = in_flight.await.unwrap();
    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(body, "slow hello");
    assert!(stop_elapsed < Duration::from_secs(5));

    // New connections are refused after shutdown.
    let client = client();
    let req = Request::builder()
        .uri(format!("http://127.0.0.1:{port}/x"))
        .header(hyper::header::HOST, "api.test")
        .body(Body::empty())
        .unwrap();
    assert!(client.request(req).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn two_gateways_coexist_in_one_process() {
    let backend_addr = spawn_backend().await;
    let (gateway_a, port_a) = spawn_gateway(5_000).await;
    let (gateway_b, port_b) = spawn_gateway(5_000).await;

    // Only gateway A learns about the upstream.
    let publisher = gateway_a.publisher();
    let uid = publisher.add_upstream(hostname_upstream("api.test")).unwrap();
    publisher
        .add_backend(
            uid,
            BackendSpec {
                id: None,
                address: format!("http://{backend_addr}"),
                weight: 1,
            },
        )
        .unwrap();

    let client = client();
    let (status_a, _) = get(&client, port_a, "api.test", "/x").await;
    let (status_b, _) = get(&client, port_b, "api.test", "/x").await;
    assert_eq!(status_a, hyper::StatusCode::OK);
    assert_eq!(status_b, hyper::StatusCode::BAD_REQUEST);

    gateway_a.stop().await;
    gateway_b.stop().await;
}

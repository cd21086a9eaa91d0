//! Listener sockets and the drain protocol.
//!
//! Up to four listeners run concurrently, one per enabled protocol. Each
//! serves the shared request pipeline. `stop` flips the draining flag (new
//! requests get 503), publishes `ServerStopped`, closes the accept loops,
//! waits up to the drain deadline for in-flight requests and then
//! force-closes whatever remains.
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::{ConnectInfo, Request},
    routing::any,
    serve::{Listener, ListenerExt},
    Router,
};
use eyre::{eyre, Context as _, Result};
use futures_util::StreamExt;
use tls_listener::TlsListener;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::watch,
};

use crate::{
    adapters::pipeline::RequestPipeline,
    core::{
        bus::EventBus,
        event::{Event, EventKind},
        request::Protocol,
    },
    utils::connection_tracker::ConnectionTracker,
};

/// One listening socket to bring up.
#[derive(Debug, Clone, Copy)]
pub struct ListenerSpec {
    pub protocol: Protocol,
    pub port: u16,
}

/// Runs the enabled listeners against the shared pipeline.
pub struct GatewayServer {
    pipeline: Arc<RequestPipeline>,
    bus: Arc<EventBus>,
    tracker: Arc<ConnectionTracker>,
    draining: Arc<AtomicBool>,
    tls: Option<Arc<rustls::ServerConfig>>,
    listeners: Vec<ListenerSpec>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl GatewayServer {
    pub fn new(
        pipeline: Arc<RequestPipeline>,
        bus: Arc<EventBus>,
        tracker: Arc<ConnectionTracker>,
        draining: Arc<AtomicBool>,
        tls: Option<Arc<rustls::ServerConfig>>,
        listeners: Vec<ListenerSpec>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            pipeline,
            bus,
            tracker,
            draining,
            tls,
            listeners,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Bind and serve every enabled listener, then publish `ServerStarted`.
    pub async fn start(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(eyre!("at least one listener must be enabled"));
        }

        for spec in &self.listeners {
            let addr: SocketAddr = ([0, 0, 0, 0], spec.port).into();
            let listener = TcpListener::bind(addr)
                .await
                .wrap_err_with(|| format!("failed to bind {} on {addr}", spec.protocol))?;
            tracing::info!(protocol = %spec.protocol, %addr, "listening");

            let app = make_app(self.pipeline.clone(), spec.protocol);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let shutdown = async move {
                let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
            };

            let handle = if spec.protocol.is_secure() {
                let tls = self
                    .tls
                    .clone()
                    .ok_or_else(|| eyre!("{} requires TLS configuration", spec.protocol))?;
                let local_addr = listener.local_addr().wrap_err("failed to get local addr")?;
                let acceptor = tokio_rustls::TlsAcceptor::from(tls);
                let stream = TlsListener::new(acceptor, listener);
                let tls_listener = StreamListener { stream, local_addr }.tap_io(|_io| {});
                tokio::spawn(async move {
                    let serve = axum::serve(
                        tls_listener,
                        app.into_make_service_with_connect_info::<SocketAddr>(),
                    )
                    .with_graceful_shutdown(shutdown);
                    if let Err(err) = serve.await {
                        tracing::error!(error = %err, "listener terminated with an error");
                    }
                })
            } else {
                tokio::spawn(async move {
                    let serve = axum::serve(
                        listener,
                        app.into_make_service_with_connect_info::<SocketAddr>(),
                    )
                    .with_graceful_shutdown(shutdown);
                    if let Err(err) = serve.await {
                        tracing::error!(error = %err, "listener terminated with an error");
                    }
                })
            };
            self.handles
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle);
        }

        self.bus.publish(Event::lifecycle(EventKind::ServerStarted));
        Ok(())
    }

    /// Drain and shut down: reject new requests, close the accept loops,
    /// wait for in-flight requests up to `drain`, then force-close.
    pub async fn stop(&self, drain: Duration) {
        self.draining.store(true, Ordering::Release);
        self.bus.publish(Event::lifecycle(EventKind::ServerStopped));
        let _ = self.shutdown_tx.send(true);

        let started = std::time::Instant::now();
        let drained = self.tracker.wait_for_drain(drain).await;
        if !drained {
            tracing::warn!("force-closing remaining connections");
        }

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        // Give the serve tasks what is left of the deadline to close their
        // connections, then force-close.
        let remaining = drain
            .saturating_sub(started.elapsed())
            .min(Duration::from_secs(1));
        for mut handle in handles {
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        tracing::info!("all listeners stopped");
    }
}

fn make_app(pipeline: Arc<RequestPipeline>, protocol: Protocol) -> Router {
    let handler = move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
        let pipeline = pipeline.clone();
        async move { pipeline.handle(req, protocol, Some(client_addr)).await }
    };
    Router::new()
        .route("/{*path}", any(handler.clone()))
        .route("/", any(handler))
}

/// Adapts a TLS accept stream to axum's `Listener`.
struct StreamListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for StreamListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!("TLS accept error: {}", e),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

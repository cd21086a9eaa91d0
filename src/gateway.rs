//! Gateway assembly: wires the bus, publisher, matcher, balancer, modifier
//! chain, metric sink, plugin managers and listeners into one runnable unit.
//!
//! Nothing here is global; two gateways can coexist in one process, which
//! the integration tests rely on.
use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use eyre::Result;
use tokio::sync::{mpsc, Mutex as TokioMutex};

use crate::{
    adapters::{
        pipeline::RequestPipeline,
        proxier::Proxier,
        proxy_client::PooledProxyClient,
        server::{GatewayServer, ListenerSpec},
        tls,
    },
    config::models::GatewayConfig,
    core::{
        balancer::{BalancerPolicy, LoadBalancer},
        bus::EventBus,
        error::GatewayError,
        event::{EventKind, MEMBERSHIP_KINDS},
        matcher::UpstreamMatcher,
        metrics::MetricSink,
        modifier::{ModifierChain, RequestModifier},
        publisher::UpstreamPublisher,
        request::Protocol,
    },
    plugin::{
        manager::PluginManager,
        roles::{BalancerClient, MetricFanout, ModifierClient},
        rpc::{CallbackHandler, NoCallbacks},
        PluginRole,
    },
    utils::connection_tracker::ConnectionTracker,
};

/// A fully wired gateway instance.
pub struct Gateway {
    bus: Arc<EventBus>,
    publisher: Arc<UpstreamPublisher>,
    sink: Arc<MetricSink>,
    server: GatewayServer,
    /// Load-balancer, modifier and metric managers (discovery managers are
    /// owned by the publisher).
    managers: Vec<Arc<PluginManager>>,
    metric_managers: Vec<Arc<PluginManager>>,
    balancer_client: Option<BalancerClient>,
    drain_timeout: Duration,
    fatal_rx: TokioMutex<mpsc::Receiver<GatewayError>>,
}

impl Gateway {
    /// Build a gateway from a validated configuration. Must run inside a
    /// tokio runtime: bus listeners spawn their delivery workers here.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let (fatal_tx, fatal_rx) = mpsc::channel(8);
        let call_timeout = config.timeouts.plugin_call();

        let matcher = Arc::new(UpstreamMatcher::new());
        bus.add_inline(
            matcher.clone(),
            &[EventKind::UpstreamAdded, EventKind::UpstreamRemoved],
        )?;

        let mut managers: Vec<Arc<PluginManager>> = Vec::new();

        let balancer_client = config.plugins.load_balancer.as_ref().map(|spec| {
            let manager = PluginManager::new(
                PluginRole::LoadBalancer,
                spec.command.clone(),
                spec.options.clone(),
                spec.instances,
                call_timeout,
                Arc::new(NoCallbacks),
                fatal_tx.clone(),
            );
            managers.push(manager.clone());
            BalancerClient::new(manager)
        });
        let policy = balancer_client
            .clone()
            .map(|client| Arc::new(client) as Arc<dyn BalancerPolicy>);
        let balancer = Arc::new(LoadBalancer::new(policy));
        bus.add_inline(balancer.clone(), &MEMBERSHIP_KINDS)?;

        let publisher = UpstreamPublisher::new(bus.clone());
        for spec in &config.plugins.discovery {
            let manager = PluginManager::new(
                PluginRole::Discovery,
                spec.command.clone(),
                spec.options.clone(),
                spec.instances,
                call_timeout,
                publisher.clone() as Arc<dyn CallbackHandler>,
                fatal_tx.clone(),
            );
            publisher.attach_manager(manager);
        }

        let mut modifier_clients: Vec<Arc<dyn RequestModifier>> = Vec::new();
        for spec in &config.plugins.modifiers {
            let manager = PluginManager::new(
                PluginRole::Modifier,
                spec.command.clone(),
                spec.options.clone(),
                spec.instances,
                call_timeout,
                Arc::new(NoCallbacks),
                fatal_tx.clone(),
            );
            modifier_clients.push(Arc::new(ModifierClient::new(manager.clone())));
            managers.push(manager);
        }
        let modifiers = Arc::new(ModifierChain::new(modifier_clients));

        let mut metric_managers: Vec<Arc<PluginManager>> = Vec::new();
        for spec in &config.plugins.metrics {
            let manager = PluginManager::new(
                PluginRole::Metric,
                spec.command.clone(),
                spec.options.clone(),
                spec.instances,
                call_timeout,
                Arc::new(NoCallbacks),
                fatal_tx.clone(),
            );
            metric_managers.push(manager.clone());
            managers.push(manager);
        }

        let sink = MetricSink::new(config.metrics.buffer_size, config.metrics.flush_interval());

        let client = Arc::new(PooledProxyClient::new(config.timeouts.dial())?);
        let proxier = Arc::new(Proxier::new(client, config.timeouts.proxy()));
        let tracker = Arc::new(ConnectionTracker::new());
        let draining = Arc::new(AtomicBool::new(false));

        let pipeline = Arc::new(RequestPipeline::new(
            matcher,
            balancer,
            modifiers,
            proxier,
            sink.clone(),
            bus.clone(),
            tracker.clone(),
            draining.clone(),
        ));

        let tls_config = match &config.tls {
            Some(tls) if config.listeners.wants_tls() => {
                Some(tls::load_server_config(&tls.cert_path, &tls.key_path)?)
            }
            _ => None,
        };
        let server = GatewayServer::new(
            pipeline,
            bus.clone(),
            tracker,
            draining,
            tls_config,
            listener_specs(&config),
        );

        Ok(Self {
            bus,
            publisher,
            sink,
            server,
            managers,
            metric_managers,
            balancer_client,
            drain_timeout: config.timeouts.drain(),
            fatal_rx: TokioMutex::new(fatal_rx),
        })
    }

    /// Start everything. Consumers come up before producers: the sink and
    /// the supporting plugin roles first, discovery plugins after, so a
    /// plugin that emits its whole topology at start time loses nothing.
    /// Listeners come up last and publish `ServerStarted`.
    pub async fn start(&self) -> Result<()> {
        self.sink
            .start(Arc::new(MetricFanout::new(self.metric_managers.clone())));
        self.sink.subscribe_events(&self.bus)?;

        for manager in &self.managers {
            manager.start().await?;
        }
        if let Some(client) = &self.balancer_client {
            client.clone().spawn_pool_mirror(&self.bus)?;
        }

        self.publisher.start().await?;
        self.server.start().await?;
        tracing::info!("gateway started");
        Ok(())
    }

    /// Stop the gateway: drain the listeners, then stop plugins and the
    /// metric sink, and finally close the bus.
    pub async fn stop(&self) {
        self.server.stop(self.drain_timeout).await;
        self.publisher.stop(self.drain_timeout).await;
        for manager in &self.managers {
            manager.stop(self.drain_timeout).await;
        }
        self.sink.stop().await;
        self.bus.shutdown();
        tracing::info!("gateway stopped");
    }

    /// Resolves when plugin supervision gives up on a role. The caller is
    /// expected to terminate with exit code 3.
    pub async fn wait_for_fatal(&self) -> GatewayError {
        let mut rx = self.fatal_rx.lock().await;
        rx.recv()
            .await
            .unwrap_or_else(|| GatewayError::Internal("fatal channel closed".into()))
    }

    /// The callback surface handed to discovery plugins; exposed for
    /// in-process discovery in tests and embeddings.
    pub fn publisher(&self) -> Arc<UpstreamPublisher> {
        self.publisher.clone()
    }
}

fn listener_specs(config: &GatewayConfig) -> Vec<ListenerSpec> {
    let listeners = &config.listeners;
    [
        (Protocol::HttpPublic, listeners.http_public_port),
        (Protocol::HttpInternal, listeners.http_internal_port),
        (Protocol::HttpsPublic, listeners.https_public_port),
        (Protocol::HttpsInternal, listeners.https_internal_port),
    ]
    .into_iter()
    .filter(|(_, port)| *port != 0)
    .map(|(protocol, port)| ListenerSpec { protocol, port })
    .collect()
}

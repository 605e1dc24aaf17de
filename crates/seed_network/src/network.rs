//! AgentNetwork — the façade agent runtimes talk to.
//!
//! [`AgentNetwork`] owns every networking component and wires them together:
//! - inbound WebSocket server dispatching through the [`MessageRouter`]
//! - discovery broadcast and health-check loops
//! - the metrics monitor
//! - the state synchronizer
//!
//! All background work hangs off one root [`CancellationToken`]; `stop()`
//! cancels it and awaits every task. A stopped network cannot be restarted.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::discovery::{CapabilityProvider, DiscoveryService, DiscoverySettings, LocalEndpoint};
use crate::error::NetworkError;
use crate::identity::NodeId;
use crate::message::{CapabilityPayload, Message, MessageType};
use crate::metrics::{AlertCallback, BandwidthUsage, NetworkHealth, NetworkMetrics, NetworkMonitor};
use crate::registry::{NetworkNode, NodeRegistry};
use crate::router::{
    MessageHandler, MessageRouter, capability_handler, health_handler, unhandled_handler,
};
use crate::security::NetworkSecurity;
use crate::sync::{StateProvider, SyncOutcome, SyncTimeoutHandler, Synchronizer};
use crate::transport::{self, InboundContext, RetryPolicy, Transport};

/// Per-target outcome of a send.
#[derive(Debug, Default)]
pub struct SendReport {
    pub delivered: Vec<NodeId>,
    pub failed: Vec<(NodeId, NetworkError)>,
    /// Replies sent back by recipients' handlers.
    pub replies: Vec<Message>,
}

impl SendReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Read-only summary for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkMetricsSnapshot {
    pub node_id: NodeId,
    pub active_nodes: usize,
    pub total_nodes: usize,
    pub average_latency_ms: Option<f64>,
    pub delivery_rate: f64,
    pub bandwidth: BandwidthUsage,
}

struct Running {
    local_addr: SocketAddr,
    discovery: Arc<DiscoveryService>,
    server: JoinHandle<()>,
    janitor: JoinHandle<()>,
}

pub struct AgentNetwork {
    node_id: NodeId,
    config: NetworkConfig,
    security: Arc<NetworkSecurity>,
    registry: NodeRegistry,
    metrics: Arc<NetworkMetrics>,
    monitor: Arc<NetworkMonitor>,
    router: Arc<RwLock<MessageRouter>>,
    transport: Arc<Transport>,
    synchronizer: Arc<Synchronizer>,
    capabilities: Arc<dyn CapabilityProvider>,
    cancel: CancellationToken,
    running: Mutex<Option<Running>>,
}

impl AgentNetwork {
    /// Build a network node. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: NetworkConfig,
        capabilities: Arc<dyn CapabilityProvider>,
        state: Arc<dyn StateProvider>,
    ) -> Result<Self, NetworkError> {
        let node_id = config
            .node_id
            .clone()
            .map(NodeId::from_string)
            .unwrap_or_else(NodeId::generate);

        let security = match &config.shared_key {
            Some(key) => NetworkSecurity::from_base64_key(key)?,
            None => NetworkSecurity::new(),
        };
        let security = Arc::new(security.with_token_ttl(config.token_ttl()));

        let cancel = CancellationToken::new();
        let registry = NodeRegistry::new();
        let metrics = Arc::new(NetworkMetrics::new(config.latency_window));
        let monitor = Arc::new(NetworkMonitor::new(
            Arc::clone(&metrics),
            config.monitor_interval,
            config.alert_threshold,
        ));

        let transport = Arc::new(
            Transport::new(
                node_id.clone(),
                Arc::clone(&security),
                Arc::clone(&metrics),
                RetryPolicy::from_config(&config),
                cancel.child_token(),
            )
            .with_auth(config.auth_token.clone(), config.require_auth),
        );

        let synchronizer = Arc::new(Synchronizer::new(
            node_id.clone(),
            registry.clone(),
            Arc::clone(&transport),
            state,
            config.sync_ack_timeout,
            config.sync_ready_ttl,
        ));

        let mut router = MessageRouter::new();
        router.register(MessageType::Health, health_handler(node_id.clone()));
        router.register(MessageType::Capability, capability_handler(registry.clone()));
        router.register(MessageType::State, synchronizer.handler());
        router.set_default_handler(unhandled_handler());

        Ok(Self {
            node_id,
            config,
            security,
            registry,
            metrics,
            monitor,
            router: Arc::new(RwLock::new(router)),
            transport,
            synchronizer,
            capabilities,
            cancel,
            running: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn security(&self) -> &Arc<NetworkSecurity> {
        &self.security
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bound address, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bind the listener and start the server, discovery and monitor loops.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, NetworkError> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(running.local_addr);
        }
        if self.cancel.is_cancelled() {
            return Err(NetworkError::Cancelled);
        }

        let listener = transport::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let host = if local_addr.ip().is_unspecified() {
            self.config.advertise_host.clone()
        } else {
            local_addr.ip().to_string()
        };

        let discovery = Arc::new(DiscoveryService::new(
            LocalEndpoint {
                node_id: self.node_id.clone(),
                host,
                port: local_addr.port(),
            },
            self.registry.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.capabilities),
            DiscoverySettings::from_config(&self.config),
        ));
        self.router
            .write()
            .await
            .register(MessageType::Discovery, discovery.handler());

        let ctx = Arc::new(InboundContext {
            security: Arc::clone(&self.security),
            router: Arc::clone(&self.router),
            registry: self.registry.clone(),
            metrics: Arc::clone(&self.metrics),
            auth_token: self.config.auth_token.clone(),
            require_auth: self.config.require_auth,
            read_timeout: self.config.attempt_timeout,
        });
        let server = tokio::spawn(transport::serve(listener, ctx, self.cancel.child_token()));

        discovery.start(self.cancel.child_token());
        self.monitor.start(self.cancel.child_token());
        let janitor = self.synchronizer.start_janitor(self.cancel.child_token());

        info!("Agent network {} listening on {local_addr}", self.node_id);
        *running = Some(Running {
            local_addr,
            discovery,
            server,
            janitor,
        });
        Ok(local_addr)
    }

    /// Cancel all background work and wait for it to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.discovery.stop().await;
        self.monitor.stop().await;
        if let Err(e) = running.server.await {
            error!("Inbound server task failed: {e}");
        }
        if let Err(e) = running.janitor.await {
            error!("Sync janitor task failed: {e}");
        }
        info!("Agent network {} stopped", self.node_id);
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Send a message to one node, or to every active node when `recipient`
    /// is `None`.
    ///
    /// A unicast failure is returned as an error. Broadcast failures are
    /// reported per target in the [`SendReport`] and never abort delivery
    /// to the others.
    pub async fn send_message(
        &self,
        message_type: MessageType,
        payload: serde_json::Value,
        recipient: Option<&str>,
    ) -> Result<SendReport, NetworkError> {
        let message = Message::new(
            message_type,
            payload,
            self.node_id.clone(),
            recipient.map(NodeId::from),
        );

        let mut report = SendReport::default();

        if let Some(recipient) = recipient {
            let node = self
                .registry
                .get(recipient)
                .ok_or_else(|| NetworkError::Registry(recipient.to_string()))?;
            let reply = self.transport.send_to_node(&node, &message).await?;
            report.delivered.push(node.id);
            report.replies.extend(reply);
            return Ok(report);
        }

        let targets: Vec<NetworkNode> = self
            .registry
            .list_active()
            .into_iter()
            .filter(|node| node.id != self.node_id)
            .collect();
        if targets.is_empty() {
            debug!("Broadcast of {message_type} message has no active targets");
            return Ok(report);
        }

        let sends = targets
            .iter()
            .map(|node| self.transport.send_to_node(node, &message));
        let results = join_all(sends).await;

        for (node, result) in targets.into_iter().zip(results) {
            match result {
                Ok(reply) => {
                    report.delivered.push(node.id);
                    report.replies.extend(reply);
                }
                Err(e) => {
                    warn!("Broadcast to {} failed: {e}", node.id);
                    report.failed.push((node.id, e));
                }
            }
        }
        debug!(
            "Broadcast {message_type}: {} delivered, {} failed",
            report.delivered.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Advertise capabilities, defaulting to what the provider reports.
    pub async fn share_capabilities(
        &self,
        capabilities: Option<BTreeSet<String>>,
        recipient: Option<&str>,
    ) -> Result<SendReport, NetworkError> {
        let capabilities = match capabilities {
            Some(capabilities) => capabilities,
            None => self.capabilities.local_capabilities().await?,
        };
        let payload = serde_json::to_value(CapabilityPayload { capabilities })?;
        self.send_message(MessageType::Capability, payload, recipient).await
    }

    /// Register the handler for inbound `DATA` messages. A returned message
    /// is sent back to the sender as the reply.
    pub async fn on_message(&self, handler: MessageHandler) {
        self.router.write().await.register(MessageType::Data, handler);
    }

    // -----------------------------------------------------------------------
    // State sync
    // -----------------------------------------------------------------------

    pub async fn synchronize_state(
        &self,
        peer: &str,
        keys: Option<BTreeSet<String>>,
    ) -> Result<SyncOutcome, NetworkError> {
        self.synchronizer.synchronize(peer, keys).await
    }

    pub fn on_sync_timeout(&self, handler: SyncTimeoutHandler) {
        self.synchronizer.on_timeout(handler);
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    pub fn register_node(
        &self,
        id: &str,
        host: impl Into<String>,
        port: u16,
        capabilities: BTreeSet<String>,
    ) -> NetworkNode {
        self.registry.register(NodeId::from(id), host, port, capabilities)
    }

    pub fn nodes(&self) -> Vec<NetworkNode> {
        self.registry.list_all()
    }

    pub fn active_nodes(&self) -> Vec<NetworkNode> {
        self.registry.list_active()
    }

    pub fn node(&self, id: &str) -> Option<NetworkNode> {
        self.registry.get(id)
    }

    // -----------------------------------------------------------------------
    // Tokens
    // -----------------------------------------------------------------------

    pub fn issue_token(&self, agent_id: &str) -> String {
        self.security.issue_token(agent_id)
    }

    pub fn verify_token(&self, agent_id: &str, token: &str) -> bool {
        self.security.verify_token(agent_id, token)
    }

    pub fn revoke_token(&self, agent_id: &str) -> bool {
        self.security.revoke_token(agent_id)
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    pub fn network_metrics(&self) -> NetworkMetricsSnapshot {
        NetworkMetricsSnapshot {
            node_id: self.node_id.clone(),
            active_nodes: self.registry.active_count(),
            total_nodes: self.registry.total_count(),
            average_latency_ms: self.metrics.average_latency(),
            delivery_rate: self.metrics.delivery_rate(),
            bandwidth: self.metrics.bandwidth(),
        }
    }

    pub fn health(&self) -> NetworkHealth {
        self.metrics.health()
    }

    pub fn add_alert_callback(&self, callback: AlertCallback) {
        self.monitor.add_alert_callback(callback);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

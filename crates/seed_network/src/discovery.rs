//! Peer discovery and health checking.
//!
//! Two background loops keep the [`NodeRegistry`] current:
//!
//! - **Broadcast**: every `broadcast_interval`, announce this node's identity,
//!   address and capabilities to every known node and to the seed peers. The
//!   reply to an announcement is the responder's own announcement, so a
//!   fresh node learns its seeds on the first round, which runs at startup
//!   when seeds are configured.
//! - **Health check**: every `health_check_interval`, probe each known node,
//!   then sweep the registry. Nodes that miss one interval go stale; nodes
//!   that miss `missed_checks_before_eviction` intervals are evicted.
//!
//! Iteration errors are logged and the loop resumes after
//! `loop_error_backoff`.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::identity::NodeId;
use crate::message::{Announcement, Message, MessageType};
use crate::registry::{NetworkNode, NodeRegistry, SweepReport};
use crate::router::MessageHandler;
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Capability provider
// ---------------------------------------------------------------------------

/// Supplies the capability set this node advertises.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn local_capabilities(&self) -> anyhow::Result<BTreeSet<String>>;
}

/// A fixed capability set.
#[derive(Debug, Default)]
pub struct StaticCapabilities {
    capabilities: BTreeSet<String>,
}

impl StaticCapabilities {
    pub fn new<S: Into<String>>(capabilities: impl IntoIterator<Item = S>) -> Self {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl CapabilityProvider for StaticCapabilities {
    async fn local_capabilities(&self) -> anyhow::Result<BTreeSet<String>> {
        Ok(self.capabilities.clone())
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Where peers can reach this node.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub broadcast_interval: Duration,
    pub health_check_interval: Duration,
    pub missed_checks_before_eviction: u32,
    pub probe_timeout: Duration,
    pub loop_error_backoff: Duration,
    pub seed_peers: Vec<String>,
}

impl DiscoverySettings {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            broadcast_interval: config.broadcast_interval,
            health_check_interval: config.health_check_interval,
            missed_checks_before_eviction: config.missed_checks_before_eviction,
            probe_timeout: config.probe_timeout,
            loop_error_backoff: config.loop_error_backoff,
            seed_peers: config.seed_peers.clone(),
        }
    }
}

pub struct DiscoveryService {
    endpoint: LocalEndpoint,
    registry: NodeRegistry,
    transport: Arc<Transport>,
    capabilities: Arc<dyn CapabilityProvider>,
    settings: DiscoverySettings,
    tasks: Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
}

impl DiscoveryService {
    pub fn new(
        endpoint: LocalEndpoint,
        registry: NodeRegistry,
        transport: Arc<Transport>,
        capabilities: Arc<dyn CapabilityProvider>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            endpoint,
            registry,
            transport,
            capabilities,
            settings,
            tasks: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn endpoint(&self) -> &LocalEndpoint {
        &self.endpoint
    }

    /// Idempotent upsert into the registry.
    pub fn register_node(
        &self,
        id: NodeId,
        host: impl Into<String>,
        port: u16,
        capabilities: BTreeSet<String>,
    ) -> NetworkNode {
        self.registry.register(id, host, port, capabilities)
    }

    pub async fn announcement(&self) -> Result<Announcement, NetworkError> {
        Ok(Announcement {
            node_id: self.endpoint.node_id.clone(),
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            capabilities: self.capabilities.local_capabilities().await?,
        })
    }

    /// Announce this node to every known node and every seed address.
    /// Returns how many targets acknowledged.
    pub async fn broadcast_presence(&self) -> Result<usize, NetworkError> {
        let announcement = self.announcement().await?;
        let message = Message::typed(
            MessageType::Discovery,
            &announcement,
            self.endpoint.node_id.clone(),
            None,
        )?;

        let nodes: Vec<NetworkNode> = self
            .registry
            .list_all()
            .into_iter()
            .filter(|node| node.id != self.endpoint.node_id)
            .collect();
        let known: BTreeSet<String> = nodes.iter().map(NetworkNode::address).collect();
        let seeds: Vec<&String> = self
            .settings
            .seed_peers
            .iter()
            .filter(|seed| !known.contains(seed.as_str()))
            .collect();

        let to_nodes = nodes.iter().map(|node| self.transport.send_to_node(node, &message));
        let to_seeds = seeds.iter().map(|seed| self.transport.send_to_address(seed, &message));
        let (node_results, seed_results) = futures::join!(join_all(to_nodes), join_all(to_seeds));

        let mut acknowledged = 0;
        for result in node_results.into_iter().chain(seed_results) {
            match result {
                Ok(reply) => {
                    acknowledged += 1;
                    if let Some(reply) = reply {
                        self.learn(&reply);
                    }
                }
                Err(e) => debug!("Discovery announcement not delivered: {e}"),
            }
        }

        debug!(
            "Announced presence to {acknowledged}/{} targets",
            nodes.len() + seeds.len()
        );
        Ok(acknowledged)
    }

    /// Probe every known node, then expire the ones that stopped answering.
    pub async fn check_nodes_health(&self) -> SweepReport {
        let nodes = self.registry.list_all();
        let probes = nodes
            .iter()
            .map(|node| self.transport.probe(node, self.settings.probe_timeout));
        let results = join_all(probes).await;

        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(rtt) => {
                    self.registry.mark_seen(node.id.as_str(), Some(rtt.as_millis() as u64));
                }
                Err(e) => debug!("Health probe to {} failed: {e}", node.id),
            }
        }

        let report = self.registry.sweep(
            Utc::now(),
            self.settings.health_check_interval,
            self.settings.missed_checks_before_eviction,
        );
        for id in &report.stale {
            debug!("Node {id} is stale");
        }
        for node in &report.evicted {
            warn!("Evicted unreachable node {} ({})", node.id, node.address());
        }
        report
    }

    /// Register the sender of an announcement. Announcements whose claimed
    /// identity differs from the message sender are ignored.
    fn learn(&self, message: &Message) -> bool {
        let announcement = match message.parse_payload::<Announcement>() {
            Ok(announcement) => announcement,
            Err(e) => {
                warn!("Malformed announcement from {}: {e}", message.sender);
                return false;
            }
        };
        if announcement.node_id != message.sender {
            warn!(
                "Announcement for {} sent by {}; ignoring",
                announcement.node_id, message.sender
            );
            return false;
        }
        if announcement.node_id == self.endpoint.node_id {
            return false;
        }
        self.registry.register(
            announcement.node_id,
            announcement.host,
            announcement.port,
            announcement.capabilities,
        );
        true
    }

    /// Inbound `DISCOVERY` handler: learn the sender, answer with our own
    /// announcement.
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let service = Arc::clone(self);
        Arc::new(move |message: Message| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                if !service.learn(&message) {
                    return None;
                }
                let announcement = match service.announcement().await {
                    Ok(announcement) => announcement,
                    Err(e) => {
                        error!("Cannot answer announcement: {e}");
                        return None;
                    }
                };
                Message::typed(
                    MessageType::Discovery,
                    &announcement,
                    service.endpoint.node_id.clone(),
                    Some(message.sender),
                )
                .ok()
            })
        })
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// Spawn the broadcast and health-check loops. A second call while
    /// running is a no-op.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return;
        }
        info!(
            "Discovery started for {} at {}:{}",
            self.endpoint.node_id, self.endpoint.host, self.endpoint.port
        );

        // Seeds are announced to right away; otherwise the first round waits
        // a full interval.
        let first_broadcast = if self.settings.seed_peers.is_empty() {
            self.settings.broadcast_interval
        } else {
            Duration::ZERO
        };
        let service = Arc::clone(self);
        let broadcast = tokio::spawn(run_periodic(
            "discovery broadcast",
            first_broadcast,
            self.settings.broadcast_interval,
            self.settings.loop_error_backoff,
            cancel.clone(),
            move || {
                let service = Arc::clone(&service);
                async move { service.broadcast_presence().await.map(|_| ()) }
            },
        ));

        let service = Arc::clone(self);
        let health = tokio::spawn(run_periodic(
            "health check",
            self.settings.health_check_interval,
            self.settings.health_check_interval,
            self.settings.loop_error_backoff,
            cancel.clone(),
            move || {
                let service = Arc::clone(&service);
                async move {
                    service.check_nodes_health().await;
                    Ok(())
                }
            },
        ));

        *tasks = Some((cancel, vec![broadcast, health]));
    }

    /// Cancel both loops and wait for them to exit.
    pub async fn stop(&self) {
        let tasks = self.tasks.lock().take();
        if let Some((cancel, handles)) = tasks {
            cancel.cancel();
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Discovery task failed: {e}");
                }
            }
            info!("Discovery stopped");
        }
    }
}

/// Run `tick` every `interval` until cancelled. A failed tick is followed
/// by `error_backoff` instead of `interval`.
async fn run_periodic<F, Fut>(
    name: &'static str,
    initial_delay: Duration,
    interval: Duration,
    error_backoff: Duration,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), NetworkError>>,
{
    let mut pause = initial_delay;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
        pause = match tick().await {
            Ok(()) => interval,
            Err(NetworkError::Cancelled) => break,
            Err(e) => {
                error!("{name} failed: {e}; retrying in {error_backoff:?}");
                error_backoff
            }
        };
    }
    debug!("{name} loop stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

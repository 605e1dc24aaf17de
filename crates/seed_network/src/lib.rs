//! Seed Network — the inter-agent networking layer.
//!
//! Agents find each other, exchange encrypted messages and reconcile
//! shared state through this crate. External collaborators only see the
//! [`AgentNetwork`] façade plus two injected interfaces:
//! [`CapabilityProvider`] (what this agent can do) and [`StateProvider`]
//! (the state it owns).
//!
//! # Architecture
//!
//! - **Transport**: one WebSocket connection per delivery (via
//!   `tokio-tungstenite`), linear-backoff retries, at most one reply frame.
//! - **Security**: AES-256-GCM sealed frames and per-agent tokens.
//! - **Discovery**: announcement broadcast and health-check loops over a
//!   shared [`NodeRegistry`].
//! - **Sync**: two-phase prepare/commit with vector-clock reconciliation.
//! - **Metrics**: latency window, delivery counters and a health monitor.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use seed_network::{AgentNetwork, MemoryStateStore, NetworkConfig, NodeId, StaticCapabilities};
//!
//! # async fn example() -> Result<(), seed_network::NetworkError> {
//! let config = NetworkConfig::default();
//! let network = AgentNetwork::new(
//!     config,
//!     Arc::new(StaticCapabilities::new(["search", "summarize"])),
//!     Arc::new(MemoryStateStore::new(NodeId::generate())),
//! )?;
//!
//! network.start().await?;
//! // ... discover peers, send messages, synchronize state ...
//! network.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod network;
pub mod registry;
pub mod router;
pub mod security;
pub mod sync;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkConfig;
pub use discovery::{CapabilityProvider, DiscoveryService, StaticCapabilities};
pub use error::NetworkError;
pub use identity::NodeId;
pub use message::{Message, MessageType};
pub use metrics::{NetworkHealth, NetworkMetrics, NetworkMonitor};
pub use network::{AgentNetwork, NetworkMetricsSnapshot, SendReport};
pub use registry::{NetworkNode, NodeRegistry, NodeStatus};
pub use security::NetworkSecurity;
pub use sync::{MemoryStateStore, StateEntry, StateProvider, SyncOutcome, VectorClock};

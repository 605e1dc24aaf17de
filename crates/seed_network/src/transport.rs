//! WebSocket transport — one connection per delivery.
//!
//! A delivery connects to the target, writes one encrypted binary frame,
//! waits for at most one reply frame and closes. Transport failures are
//! retried with a linear backoff (`base * attempt`). The inbound side
//! accepts connections, decrypts the frame, authenticates it if required
//! and hands the message to the [`MessageRouter`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{accept_async, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::identity::NodeId;
use crate::message::{HealthPayload, Message, MessageType, WireFrame};
use crate::metrics::NetworkMetrics;
use crate::registry::{NetworkNode, NodeRegistry};
use crate::router::MessageRouter;
use crate::security::NetworkSecurity;

/// Retry bounds for a single logical send.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            max_attempts: config.max_delivery_attempts.max(1),
            base_delay: config.retry_base_delay(),
            attempt_timeout: config.attempt_timeout,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based). Saturates
    /// instead of overflowing.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

/// Outbound side of the transport. Cheap to share behind an `Arc`.
pub struct Transport {
    local_id: NodeId,
    security: Arc<NetworkSecurity>,
    metrics: Arc<NetworkMetrics>,
    policy: RetryPolicy,
    auth_token: Option<String>,
    require_auth: bool,
    cancel: CancellationToken,
}

impl Transport {
    pub fn new(
        local_id: NodeId,
        security: Arc<NetworkSecurity>,
        metrics: Arc<NetworkMetrics>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local_id,
            security,
            metrics,
            policy,
            auth_token: None,
            require_auth: false,
            cancel,
        }
    }

    /// Present `auth_token` on every frame; verify reply tokens when
    /// `require_auth` is set.
    pub fn with_auth(mut self, auth_token: Option<String>, require_auth: bool) -> Self {
        self.auth_token = auth_token;
        self.require_auth = require_auth;
        self
    }

    pub fn metrics(&self) -> &Arc<NetworkMetrics> {
        &self.metrics
    }

    /// Deliver `message` to `node`, retrying transport failures. Returns
    /// the node's reply, if it sent one.
    pub async fn send_to_node(
        &self,
        node: &NetworkNode,
        message: &Message,
    ) -> Result<Option<Message>, NetworkError> {
        self.deliver(node.id.as_str(), &node.address(), message).await
    }

    /// Deliver to a bare `host:port`, used before the node's identity is
    /// known (seed peers).
    pub async fn send_to_address(
        &self,
        address: &str,
        message: &Message,
    ) -> Result<Option<Message>, NetworkError> {
        self.deliver(address, address, message).await
    }

    async fn deliver(
        &self,
        label: &str,
        address: &str,
        message: &Message,
    ) -> Result<Option<Message>, NetworkError> {
        let sealed = self.seal(message)?;
        self.metrics.record_sent(sealed.len());

        let max_attempts = self.policy.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                self.metrics.record_failed();
                return Err(NetworkError::Cancelled);
            }

            let started = Instant::now();
            let outcome =
                tokio::time::timeout(self.policy.attempt_timeout, exchange(address, &sealed)).await;

            match outcome {
                Ok(Ok(reply)) => {
                    self.metrics
                        .record_latency(started.elapsed().as_secs_f64() * 1000.0);
                    let opened = match reply {
                        Some(bytes) => self.open_reply(&bytes).map(Some),
                        None => Ok(None),
                    };
                    // A reply that fails decryption or auth counts against the send.
                    match &opened {
                        Ok(_) => {
                            self.metrics.record_delivered();
                            trace!(
                                "Delivered {} message {} to {label} (attempt {attempt})",
                                message.message_type, message.id
                            );
                        }
                        Err(e) => {
                            self.metrics.record_failed();
                            warn!("Unusable reply from {label}: {e}");
                        }
                    }
                    return opened;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("attempt timed out after {:?}", self.policy.attempt_timeout)
                }
            }

            if attempt < max_attempts {
                let delay = self.policy.backoff(attempt);
                debug!("Send to {label} failed (attempt {attempt}/{max_attempts}): {last_error}; retrying in {delay:?}");
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.metrics.record_failed();
                        return Err(NetworkError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.metrics.record_failed();
        error!("Failed to send {} message to {label}: {last_error}", message.message_type);
        Err(NetworkError::Delivery {
            node: label.to_string(),
            attempts: max_attempts,
            reason: last_error,
        })
    }

    /// Single-attempt health probe. Returns the round-trip time.
    pub async fn probe(&self, node: &NetworkNode, timeout: Duration) -> Result<Duration, NetworkError> {
        let ping = Message::typed(
            MessageType::Health,
            &HealthPayload::Ping { sent_at: Utc::now() },
            self.local_id.clone(),
            Some(node.id.clone()),
        )?;
        let sealed = self.seal(&ping)?;
        self.metrics.record_bytes_sent(sealed.len());

        let started = Instant::now();
        let reply = tokio::time::timeout(timeout, exchange(&node.address(), &sealed))
            .await
            .map_err(|_| NetworkError::Transport(format!("Probe to {} timed out", node.id)))??;
        let rtt = started.elapsed();

        let bytes = reply
            .ok_or_else(|| NetworkError::Transport(format!("No probe reply from {}", node.id)))?;
        let pong = self.open_reply(&bytes)?;
        match pong.parse_payload::<HealthPayload>() {
            Ok(HealthPayload::Pong { .. }) => {
                self.metrics.record_latency(rtt.as_secs_f64() * 1000.0);
                Ok(rtt)
            }
            _ => Err(NetworkError::Transport(format!(
                "Unexpected probe reply from {}",
                node.id
            ))),
        }
    }

    fn seal(&self, message: &Message) -> Result<Vec<u8>, NetworkError> {
        self.security.encrypt(&WireFrame {
            auth_token: self.auth_token.clone(),
            message: message.clone(),
        })
    }

    fn open_reply(&self, bytes: &[u8]) -> Result<Message, NetworkError> {
        self.metrics.record_received(bytes.len());
        let frame: WireFrame = self.security.decrypt(bytes)?;
        if self.require_auth {
            self.security
                .authenticate(frame.message.sender.as_str(), frame.auth_token.as_deref())?;
        }
        Ok(frame.message)
    }
}

/// Connect, send one frame, collect at most one reply frame, close.
async fn exchange(address: &str, sealed: &[u8]) -> Result<Option<Vec<u8>>, NetworkError> {
    let url = format!("ws://{address}");
    let (mut ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| NetworkError::Transport(format!("Connect to {address} failed: {e}")))?;

    ws.send(WsMessage::Binary(sealed.to_vec().into()))
        .await
        .map_err(|e| NetworkError::Transport(format!("Send to {address} failed: {e}")))?;

    let reply = loop {
        match ws.next().await {
            Some(Ok(WsMessage::Binary(data))) => break Some(data.to_vec()),
            Some(Ok(WsMessage::Close(_))) | None => break None,
            Some(Ok(_)) => continue,
            Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                break None;
            }
            Some(Err(e)) => {
                return Err(NetworkError::Transport(format!(
                    "Read from {address} failed: {e}"
                )));
            }
        }
    };

    let _ = ws.close(None).await;
    Ok(reply)
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Everything the accept loop needs to turn a frame into a dispatch.
pub struct InboundContext {
    pub security: Arc<NetworkSecurity>,
    pub router: Arc<RwLock<MessageRouter>>,
    pub registry: NodeRegistry,
    pub metrics: Arc<NetworkMetrics>,
    pub auth_token: Option<String>,
    pub require_auth: bool,
    /// Bound on the handshake and on waiting for the request frame.
    pub read_timeout: Duration,
}

impl InboundContext {
    /// Decrypt, authenticate and dispatch one frame. Returns the sealed
    /// reply, if the handler produced one. Frames that fail decryption or
    /// authentication are dropped.
    pub async fn handle_frame(&self, bytes: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        self.metrics.record_received(bytes.len());

        let frame: WireFrame = match self.security.decrypt(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping frame from {from}: {e}");
                return None;
            }
        };

        let message = frame.message;
        if self.require_auth {
            if let Err(e) = self
                .security
                .authenticate(message.sender.as_str(), frame.auth_token.as_deref())
            {
                warn!("Rejected {} message from {}: {e}", message.message_type, message.sender);
                return None;
            }
        }

        self.registry.mark_seen(message.sender.as_str(), None);

        // Dispatch on a copy so handlers never run under the router lock.
        let router = self.router.read().await.clone();
        let reply = router.dispatch(message).await?;
        let sealed = self.security.encrypt(&WireFrame {
            auth_token: self.auth_token.clone(),
            message: reply,
        });
        match sealed {
            Ok(sealed) => {
                self.metrics.record_bytes_sent(sealed.len());
                Some(sealed)
            }
            Err(e) => {
                error!("Failed to seal reply: {e}");
                None
            }
        }
    }
}

/// Bind the inbound listener.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, NetworkError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections until `cancel` fires, then wait for in-flight
/// connections to finish.
pub async fn serve(listener: TcpListener, ctx: Arc<InboundContext>, cancel: CancellationToken) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let ctx = Arc::clone(&ctx);
                        connections.spawn(handle_connection(stream, peer_addr, ctx));
                    }
                    Err(e) => error!("TCP accept failed: {e}"),
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = cancel.cancelled() => {
                info!("Inbound server shutting down");
                break;
            }
        }
    }

    while connections.join_next().await.is_some() {}
}

async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, ctx: Arc<InboundContext>) {
    let mut ws = match tokio::time::timeout(ctx.read_timeout, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("WebSocket accept failed for {peer_addr}: {e}");
            return;
        }
        Err(_) => {
            debug!("WebSocket handshake with {peer_addr} timed out");
            return;
        }
    };

    let request = tokio::time::timeout(ctx.read_timeout, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(WsMessage::Binary(data)) => return Some(data.to_vec()),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    debug!("Read error from {peer_addr}: {e}");
                    return None;
                }
            }
        }
        None
    })
    .await
    .unwrap_or(None);

    if let Some(bytes) = request {
        if let Some(reply) = ctx.handle_frame(&bytes, peer_addr).await {
            if let Err(e) = ws.send(WsMessage::Binary(reply.into())).await {
                warn!("Failed to send reply to {peer_addr}: {e}");
            }
        }
    }

    let _ = ws.close(None).await;
    // Drive the close handshake to completion.
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Two-phase state synchronization with vector-clock conflict resolution.
//!
//! The initiator sends `prepare` carrying a sealed snapshot of its state.
//! The peer validates the snapshot, asks its [`StateProvider`] whether to
//! accept, and answers `ack/ready` with its own snapshot. The initiator then
//! sends `commit`; both sides reconcile the two snapshots key by key and
//! write the result back through the provider.
//!
//! Concurrent clocks are resolved deterministically: higher counter sum,
//! then later `updated_at`, then greater writer id, then greater canonical
//! JSON value. The winning value keeps the pointwise-max of both clocks, so
//! reconciling a result again with either input is a no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::NetworkError;
use crate::identity::NodeId;
use crate::message::{Message, MessageType};
use crate::metrics::panic_message;
use crate::registry::NodeRegistry;
use crate::router::MessageHandler;
use crate::transport::Transport;

pub const SNAPSHOT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Vector clocks
// ---------------------------------------------------------------------------

/// Causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Before,
    After,
    Equal,
    Concurrent,
}

impl ClockOrdering {
    pub fn reverse(self) -> Self {
        match self {
            Self::Before => Self::After,
            Self::After => Self::Before,
            other => other,
        }
    }
}

/// Per-node counters. Missing entries count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_counters<K: Into<String>>(counters: impl IntoIterator<Item = (K, u64)>) -> Self {
        Self(counters.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Bump `node`'s own counter and return the new value.
    pub fn increment(&mut self, node: &str) -> u64 {
        let counter = self.0.entry(node.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn get(&self, node: &str) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    pub fn sum(&self) -> u64 {
        self.0.values().sum()
    }

    /// Pointwise maximum of both clocks.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for (node, &count) in &other.0 {
            let slot = merged.entry(node.clone()).or_insert(0);
            *slot = (*slot).max(count);
        }
        Self(merged)
    }

    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut greater = false;
        let mut less = false;
        for node in self.0.keys().chain(other.0.keys()) {
            let (a, b) = (self.get(node), other.get(node));
            greater |= a > b;
            less |= a < b;
        }
        match (greater, less) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (true, true) => ClockOrdering::Concurrent,
        }
    }
}

// ---------------------------------------------------------------------------
// State entries and snapshots
// ---------------------------------------------------------------------------

/// Latest resolved value of one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub vclock: VectorClock,
    pub updated_at: DateTime<Utc>,
    pub writer: NodeId,
}

pub type StateMap = BTreeMap<String, StateEntry>;

/// State as it travels between peers: versioned, timestamped, checksummed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub content: StateMap,
    pub checksum: String,
}

impl StateSnapshot {
    pub fn seal(content: StateMap) -> Result<Self, NetworkError> {
        let checksum = content_checksum(&content)?;
        Ok(Self {
            version: SNAPSHOT_VERSION,
            timestamp: Utc::now(),
            content,
            checksum,
        })
    }

    pub fn verify(&self) -> Result<(), NetworkError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(NetworkError::Checksum(format!(
                "Unsupported snapshot version {}",
                self.version
            )));
        }
        let expected = content_checksum(&self.content)?;
        if expected != self.checksum {
            return Err(NetworkError::Checksum(format!(
                "expected {expected}, got {}",
                self.checksum
            )));
        }
        Ok(())
    }

    /// Decode and verify a snapshot received from a peer. The whole payload
    /// is rejected if any envelope field is missing or the checksum fails.
    pub fn from_value(value: serde_json::Value) -> Result<Self, NetworkError> {
        for field in ["version", "timestamp", "checksum"] {
            if value.get(field).is_none() {
                return Err(NetworkError::Checksum(format!("Snapshot missing `{field}`")));
            }
        }
        let snapshot: Self = serde_json::from_value(value)
            .map_err(|e| NetworkError::Checksum(format!("Malformed snapshot: {e}")))?;
        snapshot.verify()?;
        Ok(snapshot)
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.content.keys().cloned().collect()
    }
}

/// SHA-256 over the canonical JSON form of `content`. `BTreeMap` and
/// `serde_json`'s sorted object maps make the encoding key-order stable.
fn content_checksum(content: &StateMap) -> Result<String, NetworkError> {
    let bytes = serde_json::to_vec(content)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Merge two state maps key by key.
pub fn reconcile(local: &StateMap, remote: &StateMap) -> StateMap {
    let keys: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let resolved = match (local.get(key), remote.get(key)) {
                (Some(ours), Some(theirs)) => resolve_entry(ours, theirs),
                (Some(only), None) | (None, Some(only)) => only.clone(),
                (None, None) => return None,
            };
            Some((key.clone(), resolved))
        })
        .collect()
}

/// Pick the winner for one key present on both sides.
pub fn resolve_entry(a: &StateEntry, b: &StateEntry) -> StateEntry {
    match a.vclock.compare(&b.vclock) {
        ClockOrdering::After => a.clone(),
        ClockOrdering::Before => b.clone(),
        ClockOrdering::Equal | ClockOrdering::Concurrent => {
            let winner = if tie_break_key(a) >= tie_break_key(b) { a } else { b };
            StateEntry {
                vclock: a.vclock.merge(&b.vclock),
                ..winner.clone()
            }
        }
    }
}

fn tie_break_key(entry: &StateEntry) -> (u64, DateTime<Utc>, &str, String) {
    (
        entry.vclock.sum(),
        entry.updated_at,
        entry.writer.as_str(),
        serde_json::to_string(&entry.value).unwrap_or_default(),
    )
}

// ---------------------------------------------------------------------------
// Wire payloads and sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ready,
    Rejected,
}

/// Body of a `STATE` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SyncPayload {
    Prepare {
        sync_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        keys: Option<BTreeSet<String>>,
        /// A [`StateSnapshot`], kept untyped so a malformed one surfaces as
        /// a checksum failure rather than a decode error.
        state: serde_json::Value,
    },
    Ack {
        sync_id: String,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Commit {
        sync_id: String,
    },
    Committed {
        sync_id: String,
        applied: usize,
    },
}

impl SyncPayload {
    fn rejected(sync_id: String, reason: impl Into<String>) -> Self {
        Self::Ack {
            sync_id,
            status: AckStatus::Rejected,
            state: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPhase {
    Prepare,
    Ready,
    Committed,
    TimedOut,
}

/// One in-flight synchronization.
#[derive(Debug, Clone)]
pub struct SyncSession {
    pub sync_id: String,
    pub peer: NodeId,
    pub phase: SyncPhase,
    pub proposed: StateSnapshot,
    pub created_at: DateTime<Utc>,
}

/// Result of a completed synchronization.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub sync_id: String,
    pub peer: NodeId,
    /// Entries changed locally.
    pub applied: usize,
    /// Entries the peer reported changing.
    pub remote_applied: usize,
}

pub type SyncTimeoutHandler = Arc<dyn Fn(&SyncSession) -> anyhow::Result<()> + Send + Sync>;

struct PendingCommit {
    session: SyncSession,
    keys: BTreeSet<String>,
    expires_at: Instant,
}

// ---------------------------------------------------------------------------
// State provider
// ---------------------------------------------------------------------------

/// The agent runtime's side of synchronization: it owns the state.
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Current entries, restricted to `keys` when given.
    async fn local_state(&self, keys: Option<&BTreeSet<String>>) -> anyhow::Result<StateMap>;

    /// Whether to take part in a sync proposed by `peer`.
    async fn accept_prepare(&self, _peer: &NodeId, _proposed: &StateSnapshot) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Upsert reconciled entries.
    async fn apply_state(&self, entries: StateMap) -> anyhow::Result<()>;
}

/// In-process state store. Local writes bump only this node's counter.
pub struct MemoryStateStore {
    node_id: NodeId,
    entries: RwLock<StateMap>,
}

impl MemoryStateStore {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Write `value` as a local update.
    pub fn put(&self, key: &str, value: serde_json::Value) -> StateEntry {
        let mut entries = self.entries.write();
        let mut vclock = entries.get(key).map(|e| e.vclock.clone()).unwrap_or_default();
        vclock.increment(self.node_id.as_str());
        let entry = StateEntry {
            key: key.to_string(),
            value,
            vclock,
            updated_at: Utc::now(),
            writer: self.node_id.clone(),
        };
        entries.insert(key.to_string(), entry.clone());
        entry
    }

    /// Store an entry verbatim, clock included.
    pub fn insert_entry(&self, entry: StateEntry) {
        self.entries.write().insert(entry.key.clone(), entry);
    }

    pub fn get(&self, key: &str) -> Option<StateEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl StateProvider for MemoryStateStore {
    async fn local_state(&self, keys: Option<&BTreeSet<String>>) -> anyhow::Result<StateMap> {
        let entries = self.entries.read();
        Ok(match keys {
            Some(keys) => keys
                .iter()
                .filter_map(|k| entries.get(k).map(|e| (k.clone(), e.clone())))
                .collect(),
            None => entries.clone(),
        })
    }

    async fn apply_state(&self, entries: StateMap) -> anyhow::Result<()> {
        self.entries.write().extend(entries);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

/// Removes the peer from the in-flight set when the sync ends.
struct InFlightGuard<'a> {
    set: &'a DashSet<String>,
    peer: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.peer);
    }
}

/// Drives both sides of the prepare/commit exchange.
pub struct Synchronizer {
    local_id: NodeId,
    registry: NodeRegistry,
    transport: Arc<Transport>,
    provider: Arc<dyn StateProvider>,
    ack_timeout: Duration,
    ready_ttl: Duration,
    sessions: DashMap<String, SyncSession>,
    pending: DashMap<String, PendingCommit>,
    in_flight: DashSet<String>,
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    timeout_handlers: RwLock<Vec<SyncTimeoutHandler>>,
}

impl Synchronizer {
    pub fn new(
        local_id: NodeId,
        registry: NodeRegistry,
        transport: Arc<Transport>,
        provider: Arc<dyn StateProvider>,
        ack_timeout: Duration,
        ready_ttl: Duration,
    ) -> Self {
        Self {
            local_id,
            registry,
            transport,
            provider,
            ack_timeout,
            ready_ttl,
            sessions: DashMap::new(),
            pending: DashMap::new(),
            in_flight: DashSet::new(),
            key_locks: DashMap::new(),
            timeout_handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn on_timeout(&self, handler: SyncTimeoutHandler) {
        self.timeout_handlers.write().push(handler);
    }

    /// Sessions this node initiated that have not finished.
    pub fn active_sessions(&self) -> Vec<SyncSession> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Accepted prepares still waiting for a commit.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Synchronize `keys` (or all state) with `peer`.
    pub async fn synchronize(
        &self,
        peer: &str,
        keys: Option<BTreeSet<String>>,
    ) -> Result<SyncOutcome, NetworkError> {
        let node = self
            .registry
            .get(peer)
            .ok_or_else(|| NetworkError::Registry(peer.to_string()))?;

        if !self.in_flight.insert(peer.to_string()) {
            return Err(NetworkError::SyncInProgress(peer.to_string()));
        }
        let _guard = InFlightGuard {
            set: &self.in_flight,
            peer: peer.to_string(),
        };

        let local = self.provider.local_state(keys.as_ref()).await?;
        let snapshot = StateSnapshot::seal(local)?;
        let sync_id = uuid::Uuid::new_v4().to_string();

        self.sessions.insert(
            sync_id.clone(),
            SyncSession {
                sync_id: sync_id.clone(),
                peer: node.id.clone(),
                phase: SyncPhase::Prepare,
                proposed: snapshot.clone(),
                created_at: Utc::now(),
            },
        );
        info!("Starting sync {sync_id} with {peer} ({} keys)", snapshot.content.len());

        let result = self.run_initiator(&sync_id, &node.id, keys, snapshot).await;
        self.sessions.remove(&sync_id);
        result
    }

    async fn run_initiator(
        &self,
        sync_id: &str,
        peer: &NodeId,
        keys: Option<BTreeSet<String>>,
        snapshot: StateSnapshot,
    ) -> Result<SyncOutcome, NetworkError> {
        let mut lock_keys = snapshot.keys();

        // Phase 1: prepare, wait for the acknowledgment.
        let prepare = SyncPayload::Prepare {
            sync_id: sync_id.to_string(),
            keys,
            state: serde_json::to_value(&snapshot)?,
        };
        let remote = match self.exchange(peer, &prepare).await? {
            SyncPayload::Ack {
                status: AckStatus::Ready,
                state: Some(state),
                ..
            } => StateSnapshot::from_value(state).inspect_err(|e| {
                warn!("Rejecting sync {sync_id} with {peer}: {e}");
            })?,
            SyncPayload::Ack { reason, .. } => {
                return Err(NetworkError::SyncRejected(
                    reason.unwrap_or_else(|| format!("{peer} declined sync")),
                ));
            }
            other => {
                return Err(NetworkError::SyncRejected(format!(
                    "Unexpected reply to prepare: {other:?}"
                )));
            }
        };

        if let Some(mut session) = self.sessions.get_mut(sync_id) {
            session.phase = SyncPhase::Ready;
        }
        lock_keys.extend(remote.keys());

        // Phase 2: commit.
        let commit = SyncPayload::Commit {
            sync_id: sync_id.to_string(),
        };
        let remote_applied = match self.exchange(peer, &commit).await? {
            SyncPayload::Committed { applied, .. } => applied,
            SyncPayload::Ack { reason, .. } => {
                return Err(NetworkError::SyncRejected(
                    reason.unwrap_or_else(|| format!("{peer} refused commit")),
                ));
            }
            other => {
                return Err(NetworkError::SyncRejected(format!(
                    "Unexpected reply to commit: {other:?}"
                )));
            }
        };

        let applied = self.apply_reconciled(&lock_keys, &remote.content).await?;
        if let Some(mut session) = self.sessions.get_mut(sync_id) {
            session.phase = SyncPhase::Committed;
        }
        info!("Sync {sync_id} with {peer} committed: {applied} local, {remote_applied} remote changes");

        Ok(SyncOutcome {
            sync_id: sync_id.to_string(),
            peer: peer.clone(),
            applied,
            remote_applied,
        })
    }

    /// Send one phase message and wait, bounded, for the peer's reply.
    async fn exchange(&self, peer: &NodeId, payload: &SyncPayload) -> Result<SyncPayload, NetworkError> {
        let node = self
            .registry
            .get(peer.as_str())
            .ok_or_else(|| NetworkError::Registry(peer.to_string()))?;
        let message = Message::typed(
            MessageType::State,
            payload,
            self.local_id.clone(),
            Some(peer.clone()),
        )?;

        let reply = match tokio::time::timeout(
            self.ack_timeout,
            self.transport.send_to_node(&node, &message),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(self.abandon(peer, payload)),
        };

        let reply = reply.ok_or_else(|| {
            NetworkError::SyncRejected(format!("{peer} closed without acknowledging"))
        })?;
        reply
            .parse_payload::<SyncPayload>()
            .map_err(|e| NetworkError::SyncRejected(format!("Malformed reply from {peer}: {e}")))
    }

    fn abandon(&self, peer: &NodeId, payload: &SyncPayload) -> NetworkError {
        let sync_id = match payload {
            SyncPayload::Prepare { sync_id, .. }
            | SyncPayload::Ack { sync_id, .. }
            | SyncPayload::Commit { sync_id }
            | SyncPayload::Committed { sync_id, .. } => sync_id,
        };

        let timeout = NetworkError::SyncTimeout {
            peer: peer.to_string(),
            waited: self.ack_timeout,
        };
        let Some((_, mut session)) = self.sessions.remove(sync_id) else {
            return timeout;
        };
        session.phase = SyncPhase::TimedOut;
        warn!(
            "Sync {} with {} timed out after {:?}; abandoning",
            session.sync_id, session.peer, self.ack_timeout
        );

        let handlers = self.timeout_handlers.read().clone();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&session))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Sync timeout handler failed: {e}"),
                Err(panic) => error!("Sync timeout handler panicked: {}", panic_message(&*panic)),
            }
        }

        timeout
    }

    /// Reconcile `remote` against current local state under per-key locks
    /// and write back what changed.
    async fn apply_reconciled(
        &self,
        keys: &BTreeSet<String>,
        remote: &StateMap,
    ) -> Result<usize, NetworkError> {
        // BTreeSet iteration is sorted, so every caller locks in one order.
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = self.key_locks.entry(key.clone()).or_default().clone();
            guards.push(lock.lock_owned().await);
        }

        let result = self.write_changes(keys, remote).await;
        drop(guards);

        // Locks nobody else holds or waits on are dropped from the table.
        for key in keys {
            self.key_locks
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
        result
    }

    async fn write_changes(&self, keys: &BTreeSet<String>, remote: &StateMap) -> Result<usize, NetworkError> {
        let current = self.provider.local_state(Some(keys)).await?;
        let changed: StateMap = reconcile(&current, remote)
            .into_iter()
            .filter(|(key, entry)| current.get(key) != Some(entry))
            .collect();

        let applied = changed.len();
        if applied > 0 {
            self.provider.apply_state(changed).await?;
        }
        Ok(applied)
    }

    // -----------------------------------------------------------------------
    // Responder
    // -----------------------------------------------------------------------

    /// Inbound `STATE` handler.
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let sync = Arc::clone(self);
        Arc::new(move |message: Message| {
            let sync = Arc::clone(&sync);
            Box::pin(async move {
                let reply = match message.parse_payload::<SyncPayload>() {
                    Ok(SyncPayload::Prepare { sync_id, keys, state }) => {
                        sync.handle_prepare(&message.sender, sync_id, keys, state).await
                    }
                    Ok(SyncPayload::Commit { sync_id }) => {
                        sync.handle_commit(&message.sender, sync_id).await
                    }
                    Ok(other) => {
                        debug!("Ignoring unsolicited sync payload from {}: {other:?}", message.sender);
                        return None;
                    }
                    Err(e) => {
                        warn!("Malformed sync payload from {}: {e}", message.sender);
                        return None;
                    }
                };
                Message::typed(
                    MessageType::State,
                    &reply,
                    sync.local_id.clone(),
                    Some(message.sender),
                )
                .ok()
            })
        })
    }

    async fn handle_prepare(
        &self,
        peer: &NodeId,
        sync_id: String,
        keys: Option<BTreeSet<String>>,
        state: serde_json::Value,
    ) -> SyncPayload {
        self.purge_expired();

        let proposed = match StateSnapshot::from_value(state) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Rejecting sync {sync_id} from {peer}: {e}");
                return SyncPayload::rejected(sync_id, e.to_string());
            }
        };

        match self.provider.accept_prepare(peer, &proposed).await {
            Ok(true) => {}
            Ok(false) => return SyncPayload::rejected(sync_id, "Peer not ready"),
            Err(e) => return SyncPayload::rejected(sync_id, e.to_string()),
        }

        let local = match self
            .provider
            .local_state(keys.as_ref())
            .await
            .map_err(NetworkError::from)
            .and_then(StateSnapshot::seal)
        {
            Ok(snapshot) => snapshot,
            Err(e) => return SyncPayload::rejected(sync_id, e.to_string()),
        };
        let state = match serde_json::to_value(&local) {
            Ok(state) => state,
            Err(e) => return SyncPayload::rejected(sync_id, e.to_string()),
        };

        let mut lock_keys = proposed.keys();
        lock_keys.extend(local.keys());
        self.pending.insert(
            sync_id.clone(),
            PendingCommit {
                session: SyncSession {
                    sync_id: sync_id.clone(),
                    peer: peer.clone(),
                    phase: SyncPhase::Ready,
                    proposed,
                    created_at: Utc::now(),
                },
                keys: lock_keys,
                expires_at: Instant::now() + self.ready_ttl,
            },
        );
        debug!("Sync {sync_id} from {peer} ready");

        SyncPayload::Ack {
            sync_id,
            status: AckStatus::Ready,
            state: Some(state),
            reason: None,
        }
    }

    async fn handle_commit(&self, peer: &NodeId, sync_id: String) -> SyncPayload {
        let Some((_, pending)) = self
            .pending
            .remove_if(&sync_id, |_, pending| &pending.session.peer == peer)
        else {
            warn!("Commit for unknown sync {sync_id} from {peer}");
            return SyncPayload::rejected(sync_id, "Unknown or expired sync");
        };

        if pending.expires_at <= Instant::now() {
            warn!("Commit for expired sync {sync_id} from {peer}");
            return SyncPayload::rejected(sync_id, "Sync expired before commit");
        }

        match self
            .apply_reconciled(&pending.keys, &pending.session.proposed.content)
            .await
        {
            Ok(applied) => {
                info!("Sync {sync_id} from {peer} committed: {applied} changes");
                SyncPayload::Committed { sync_id, applied }
            }
            Err(e) => {
                warn!("Failed to apply sync {sync_id} from {peer}: {e}");
                SyncPayload::rejected(sync_id, e.to_string())
            }
        }
    }

    /// Drop accepted prepares whose commit never arrived.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.pending.len();
        self.pending.retain(|sync_id, pending| {
            let keep = pending.expires_at > now;
            if !keep {
                debug!("Ready state for sync {sync_id} expired");
            }
            keep
        });
        before.saturating_sub(self.pending.len())
    }

    /// Spawn a loop that purges expired ready state every `ready_ttl`
    /// until `cancel` fires.
    pub fn start_janitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(sync.ready_ttl) => {
                        let purged = sync.purge_expired();
                        if purged > 0 {
                            debug!("Purged {purged} expired sync(s)");
                        }
                    }
                }
            }
            debug!("Sync janitor stopped");
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_util::sync::CancellationToken;

    use crate::metrics::NetworkMetrics;
    use crate::security::NetworkSecurity;
    use crate::router::MessageRouter;
    use crate::transport::{self, InboundContext, RetryPolicy};

    fn clock(counters: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_counters(counters.iter().map(|(k, v)| (*k, *v)))
    }

    fn entry(key: &str, value: serde_json::Value, vclock: VectorClock, writer: &str, secs: i64) -> StateEntry {
        StateEntry {
            key: key.to_string(),
            value,
            vclock,
            updated_at: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            writer: NodeId::from(writer),
        }
    }

    fn map(entries: Vec<StateEntry>) -> StateMap {
        entries.into_iter().map(|e| (e.key.clone(), e)).collect()
    }

    fn synchronizer(provider: Arc<dyn StateProvider>, ack_timeout: Duration) -> Arc<Synchronizer> {
        synchronizer_with(
            Arc::new(NetworkSecurity::new()),
            provider,
            ack_timeout,
            Duration::from_secs(60),
        )
    }

    fn synchronizer_with(
        security: Arc<NetworkSecurity>,
        provider: Arc<dyn StateProvider>,
        ack_timeout: Duration,
        ready_ttl: Duration,
    ) -> Arc<Synchronizer> {
        let transport = Transport::new(
            NodeId::from("local"),
            security,
            Arc::new(NetworkMetrics::default()),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(10),
                attempt_timeout: Duration::from_secs(5),
            },
            CancellationToken::new(),
        );
        Arc::new(Synchronizer::new(
            NodeId::from("local"),
            NodeRegistry::new(),
            Arc::new(transport),
            provider,
            ack_timeout,
            ready_ttl,
        ))
    }

    fn state_message(sender: &str, payload: &SyncPayload) -> Message {
        Message::typed(MessageType::State, payload, NodeId::from(sender), Some(NodeId::from("local"))).unwrap()
    }

    #[test]
    fn test_clock_compare() {
        let a = clock(&[("a", 2), ("b", 1)]);
        let b = clock(&[("a", 1), ("b", 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::After);
        assert_eq!(b.compare(&a), ClockOrdering::Before);
        assert_eq!(a.compare(&a), ClockOrdering::Equal);

        // Missing counters are zero.
        assert_eq!(clock(&[("a", 1)]).compare(&clock(&[("a", 1), ("b", 0)])), ClockOrdering::Equal);
        assert_eq!(clock(&[]).compare(&clock(&[("b", 1)])), ClockOrdering::Before);

        let c = clock(&[("a", 1), ("b", 2)]);
        assert_eq!(a.compare(&c), ClockOrdering::Concurrent);
        assert_eq!(c.compare(&a), ClockOrdering::Concurrent);
    }

    #[test]
    fn test_clock_compare_is_antisymmetric() {
        let clocks = [
            clock(&[]),
            clock(&[("a", 1)]),
            clock(&[("a", 1), ("b", 3)]),
            clock(&[("a", 2), ("b", 1)]),
            clock(&[("c", 4)]),
        ];
        for x in &clocks {
            assert_eq!(x.compare(x), ClockOrdering::Equal);
            for y in &clocks {
                assert_eq!(x.compare(y), y.compare(x).reverse());
            }
        }
    }

    #[test]
    fn test_increment_and_merge() {
        let mut vc = VectorClock::new();
        assert_eq!(vc.increment("a"), 1);
        assert_eq!(vc.increment("a"), 2);
        assert_eq!(vc.get("b"), 0);

        let merged = vc.merge(&clock(&[("a", 1), ("b", 5)]));
        assert_eq!(merged, clock(&[("a", 2), ("b", 5)]));
        assert_eq!(merged.sum(), 7);
    }

    #[test]
    fn test_dominating_clock_wins() {
        let ours = entry("x", "old".into(), clock(&[("a", 1)]), "a", 100);
        let theirs = entry("x", "new".into(), clock(&[("a", 1), ("b", 1)]), "b", 0);
        // Causality beats wall clock.
        assert_eq!(resolve_entry(&ours, &theirs), theirs);
        assert_eq!(resolve_entry(&theirs, &ours), theirs);
    }

    #[test]
    fn test_concurrent_tie_break_order() {
        // Higher counter sum first.
        let big = entry("x", "big".into(), clock(&[("a", 3)]), "a", 0);
        let small = entry("x", "small".into(), clock(&[("b", 2)]), "b", 50);
        assert_eq!(resolve_entry(&big, &small).value, "big");
        assert_eq!(resolve_entry(&small, &big).value, "big");

        // Equal sums: later write.
        let early = entry("x", "early".into(), clock(&[("a", 2), ("b", 1)]), "z", 0);
        let late = entry("x", "late".into(), clock(&[("a", 1), ("b", 2)]), "a", 1);
        assert_eq!(resolve_entry(&early, &late).value, "late");

        // Equal sums and time: greater writer id.
        let from_a = entry("x", "from-a".into(), clock(&[("a", 2), ("b", 1)]), "a", 0);
        let from_b = entry("x", "from-b".into(), clock(&[("a", 1), ("b", 2)]), "b", 0);
        let winner = resolve_entry(&from_a, &from_b);
        assert_eq!(winner.value, "from-b");
        assert_eq!(winner.vclock, clock(&[("a", 2), ("b", 2)]));
        assert_eq!(resolve_entry(&from_b, &from_a), winner);
    }

    #[test]
    fn test_reconcile_one_sided_keys_pass_through() {
        let local = map(vec![entry("only-local", 1.into(), clock(&[("a", 1)]), "a", 0)]);
        let remote = map(vec![entry("only-remote", 2.into(), clock(&[("b", 1)]), "b", 0)]);
        let merged = reconcile(&local, &remote);
        assert_eq!(merged["only-local"], local["only-local"]);
        assert_eq!(merged["only-remote"], remote["only-remote"]);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let local = map(vec![
            entry("x", "a".into(), clock(&[("a", 2), ("b", 1)]), "a", 5),
            entry("y", 1.into(), clock(&[("a", 1)]), "a", 0),
            entry("z", true.into(), clock(&[("a", 1)]), "a", 0),
        ]);
        let remote = map(vec![
            entry("x", "b".into(), clock(&[("a", 1), ("b", 2)]), "b", 3),
            entry("y", 2.into(), clock(&[("a", 1), ("b", 1)]), "b", 0),
            entry("w", "new".into(), clock(&[("b", 1)]), "b", 0),
        ]);

        let once = reconcile(&local, &remote);
        assert_eq!(reconcile(&once, &local), once);
        assert_eq!(reconcile(&once, &remote), once);
        assert_eq!(reconcile(&local, &once), once);
        assert_eq!(reconcile(&remote, &local), once);
    }

    #[test]
    fn test_snapshot_checksum() {
        let content = map(vec![entry("x", 1.into(), clock(&[("a", 1)]), "a", 0)]);
        let snapshot = StateSnapshot::seal(content).unwrap();
        assert!(snapshot.verify().is_ok());

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(StateSnapshot::from_value(value.clone()).unwrap(), snapshot);

        let mut tampered = value.clone();
        tampered["content"]["x"]["value"] = 2.into();
        assert!(matches!(StateSnapshot::from_value(tampered), Err(NetworkError::Checksum(_))));

        for field in ["version", "timestamp", "checksum"] {
            let mut missing = value.clone();
            missing.as_object_mut().unwrap().remove(field);
            assert!(matches!(StateSnapshot::from_value(missing), Err(NetworkError::Checksum(_))));
        }
    }

    #[tokio::test]
    async fn test_memory_store_bumps_own_counter() {
        let store = MemoryStateStore::new(NodeId::from("a"));
        store.insert_entry(entry("x", 0.into(), clock(&[("b", 4)]), "b", 0));
        let updated = store.put("x", 1.into());
        assert_eq!(updated.vclock, clock(&[("a", 1), ("b", 4)]));
        store.put("y", 2.into());

        let keys: BTreeSet<String> = ["y".to_string()].into();
        let subset = store.local_state(Some(&keys)).await.unwrap();
        assert_eq!(subset.len(), 1);
        assert_eq!(store.local_state(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_responder_prepare_then_commit() {
        let store = Arc::new(MemoryStateStore::new(NodeId::from("local")));
        store.insert_entry(entry("x", "mine".into(), clock(&[("local", 1)]), "local", 0));
        let sync = synchronizer(store.clone(), Duration::from_secs(1));
        let handler = sync.handler();

        let proposed = StateSnapshot::seal(map(vec![
            entry("x", "theirs".into(), clock(&[("local", 1), ("peer", 1)]), "peer", 0),
            entry("y", "extra".into(), clock(&[("peer", 1)]), "peer", 0),
        ]))
        .unwrap();
        let prepare = SyncPayload::Prepare {
            sync_id: "s1".into(),
            keys: None,
            state: serde_json::to_value(&proposed).unwrap(),
        };

        let ack = handler(state_message("peer", &prepare)).await.unwrap();
        match ack.parse_payload::<SyncPayload>().unwrap() {
            SyncPayload::Ack { status, state, .. } => {
                assert_eq!(status, AckStatus::Ready);
                let ours = StateSnapshot::from_value(state.unwrap()).unwrap();
                assert_eq!(ours.content["x"].value, "mine");
            }
            other => panic!("Expected ack, got {other:?}"),
        }
        assert_eq!(sync.pending_count(), 1);
        // Nothing applied before commit.
        assert_eq!(store.get("x").unwrap().value, "mine");

        // A commit from another node must not consume the pending sync.
        let commit = SyncPayload::Commit { sync_id: "s1".into() };
        let hijack = handler(state_message("intruder", &commit)).await.unwrap();
        assert!(matches!(
            hijack.parse_payload::<SyncPayload>().unwrap(),
            SyncPayload::Ack { status: AckStatus::Rejected, .. }
        ));

        let done = handler(state_message("peer", &commit)).await.unwrap();
        match done.parse_payload::<SyncPayload>().unwrap() {
            SyncPayload::Committed { applied, .. } => assert_eq!(applied, 2),
            other => panic!("Expected committed, got {other:?}"),
        }
        assert_eq!(store.get("x").unwrap().value, "theirs");
        assert_eq!(store.get("y").unwrap().value, "extra");
        assert_eq!(sync.pending_count(), 0);
        assert!(sync.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_janitor_purges_uncommitted_prepares() {
        let store = Arc::new(MemoryStateStore::new(NodeId::from("local")));
        let sync = synchronizer_with(
            Arc::new(NetworkSecurity::new()),
            store,
            Duration::from_secs(1),
            Duration::from_millis(50),
        );

        let proposed =
            StateSnapshot::seal(map(vec![entry("x", 1.into(), clock(&[("peer", 1)]), "peer", 0)])).unwrap();
        let prepare = SyncPayload::Prepare {
            sync_id: "abandoned".into(),
            keys: None,
            state: serde_json::to_value(&proposed).unwrap(),
        };
        sync.handler()(state_message("peer", &prepare)).await.unwrap();
        assert_eq!(sync.pending_count(), 1);

        let cancel = CancellationToken::new();
        let janitor = sync.start_janitor(cancel.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sync.pending_count(), 0);

        cancel.cancel();
        janitor.await.unwrap();
    }

    #[tokio::test]
    async fn test_tampered_ack_rejected_by_initiator() {
        let security = Arc::new(NetworkSecurity::new());

        let mut forged = serde_json::to_value(
            StateSnapshot::seal(map(vec![entry("x", "forged".into(), clock(&[("peer", 5)]), "peer", 0)])).unwrap(),
        )
        .unwrap();
        forged["checksum"] = "deadbeef".into();

        // Answers every prepare with a snapshot whose checksum does not match.
        let commits = Arc::new(AtomicUsize::new(0));
        let commit_counter = Arc::clone(&commits);
        let responder: MessageHandler = Arc::new(move |message: Message| {
            let forged = forged.clone();
            let commit_counter = Arc::clone(&commit_counter);
            Box::pin(async move {
                let reply = match message.parse_payload::<SyncPayload>().ok()? {
                    SyncPayload::Prepare { sync_id, .. } => SyncPayload::Ack {
                        sync_id,
                        status: AckStatus::Ready,
                        state: Some(forged),
                        reason: None,
                    },
                    SyncPayload::Commit { sync_id } => {
                        commit_counter.fetch_add(1, Ordering::SeqCst);
                        SyncPayload::Committed { sync_id, applied: 1 }
                    }
                    _ => return None,
                };
                Message::typed(MessageType::State, &reply, NodeId::from("peer"), Some(message.sender)).ok()
            })
        });
        let mut router = MessageRouter::new();
        router.register(MessageType::State, responder);

        let ctx = Arc::new(InboundContext {
            security: Arc::clone(&security),
            router: Arc::new(tokio::sync::RwLock::new(router)),
            registry: NodeRegistry::new(),
            metrics: Arc::new(NetworkMetrics::default()),
            auth_token: None,
            require_auth: false,
            read_timeout: Duration::from_secs(2),
        });
        let listener = transport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(transport::serve(listener, ctx, cancel.clone()));

        let store = Arc::new(MemoryStateStore::new(NodeId::from("local")));
        store.put("x", "mine".into());
        let sync = synchronizer_with(security, store.clone(), Duration::from_secs(2), Duration::from_secs(60));
        sync.registry
            .register(NodeId::from("peer"), "127.0.0.1", port, BTreeSet::new());

        let result = sync.synchronize("peer", None).await;
        assert!(matches!(result, Err(NetworkError::Checksum(_))));
        assert_eq!(commits.load(Ordering::SeqCst), 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("x").unwrap().value, "mine");
        assert!(sync.active_sessions().is_empty());

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_prepare_rejected_without_pending() {
        let store = Arc::new(MemoryStateStore::new(NodeId::from("local")));
        let sync = synchronizer(store.clone(), Duration::from_secs(1));

        let mut state = serde_json::to_value(
            StateSnapshot::seal(map(vec![entry("x", 1.into(), clock(&[("peer", 1)]), "peer", 0)])).unwrap(),
        )
        .unwrap();
        state["checksum"] = "deadbeef".into();
        let prepare = SyncPayload::Prepare {
            sync_id: "bad".into(),
            keys: None,
            state,
        };

        let reply = sync.handler()(state_message("peer", &prepare)).await.unwrap();
        assert!(matches!(
            reply.parse_payload::<SyncPayload>().unwrap(),
            SyncPayload::Ack { status: AckStatus::Rejected, .. }
        ));
        assert_eq!(sync.pending_count(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_peer_is_registry_error() {
        let sync = synchronizer(Arc::new(MemoryStateStore::new(NodeId::from("local"))), Duration::from_secs(1));
        let result = sync.synchronize("nobody", None).await;
        assert!(matches!(result, Err(NetworkError::Registry(_))));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_and_fires_handlers() {
        // Accepts TCP but never completes the WebSocket handshake.
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let store = Arc::new(MemoryStateStore::new(NodeId::from("local")));
        store.put("x", 1.into());
        let sync = synchronizer(store.clone(), Duration::from_millis(200));
        sync.registry
            .register(NodeId::from("silent"), "127.0.0.1", port, BTreeSet::new());

        sync.on_timeout(Arc::new(|_: &SyncSession| -> anyhow::Result<()> {
            panic!("timeout handler exploded")
        }));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        sync.on_timeout(Arc::new(move |session: &SyncSession| -> anyhow::Result<()> {
            assert_eq!(session.phase, SyncPhase::TimedOut);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        sync.on_timeout(Arc::new(|_: &SyncSession| -> anyhow::Result<()> {
            anyhow::bail!("handler failure is isolated")
        }));

        let background = Arc::clone(&sync);
        let first = tokio::spawn(async move { background.synchronize("silent", None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            sync.synchronize("silent", None).await,
            Err(NetworkError::SyncInProgress(_))
        ));

        let result = first.await.unwrap();
        assert!(matches!(result, Err(NetworkError::SyncTimeout { .. })));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(sync.active_sessions().is_empty());
        // Nothing merged.
        assert_eq!(store.len(), 1);

        // The in-flight slot is released.
        let again = sync.synchronize("silent", None).await;
        assert!(matches!(again, Err(NetworkError::SyncTimeout { .. })));
        drop(silent);
    }
}

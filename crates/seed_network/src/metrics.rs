//! Delivery and latency metrics, health scoring and degradation alerts.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Counters and a bounded latency window shared by every component that
/// sends or receives traffic.
#[derive(Debug)]
pub struct NetworkMetrics {
    latency_window: usize,
    latency_samples: Mutex<VecDeque<f64>>,
    sent_messages: AtomicU64,
    delivered_messages: AtomicU64,
    failed_messages: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl NetworkMetrics {
    pub fn new(latency_window: usize) -> Self {
        let latency_window = latency_window.max(1);
        Self {
            latency_window,
            latency_samples: Mutex::new(VecDeque::with_capacity(latency_window)),
            sent_messages: AtomicU64::new(0),
            delivered_messages: AtomicU64::new(0),
            failed_messages: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Add a latency sample, evicting the oldest once the window is full.
    pub fn record_latency(&self, latency_ms: f64) {
        let mut samples = self.latency_samples.lock();
        if samples.len() == self.latency_window {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }

    /// Mean of the current window, or `None` with no samples.
    pub fn average_latency(&self) -> Option<f64> {
        let samples = self.latency_samples.lock();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    pub fn latency_sample_count(&self) -> usize {
        self.latency_samples.lock().len()
    }

    pub fn record_sent(&self, size_bytes: usize) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size_bytes as u64, Ordering::Relaxed);
    }

    /// Count outbound bytes that are not a tracked message (replies, probes).
    pub fn record_bytes_sent(&self, size_bytes: usize) {
        self.bytes_sent.fetch_add(size_bytes as u64, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, size_bytes: usize) {
        self.bytes_received
            .fetch_add(size_bytes as u64, Ordering::Relaxed);
    }

    pub fn sent_messages(&self) -> u64 {
        self.sent_messages.load(Ordering::Relaxed)
    }

    pub fn delivered_messages(&self) -> u64 {
        self.delivered_messages.load(Ordering::Relaxed)
    }

    pub fn failed_messages(&self) -> u64 {
        self.failed_messages.load(Ordering::Relaxed)
    }

    /// `delivered / sent`, or 1.0 before any traffic.
    pub fn delivery_rate(&self) -> f64 {
        let sent = self.sent_messages();
        if sent == 0 {
            return 1.0;
        }
        self.delivered_messages() as f64 / sent as f64
    }

    pub fn bandwidth(&self) -> BandwidthUsage {
        BandwidthUsage {
            sent_bytes: self.bytes_sent.load(Ordering::Relaxed),
            received_bytes: self.bytes_received.load(Ordering::Relaxed),
            total_messages: self.sent_messages(),
        }
    }

    /// Point-in-time health report.
    pub fn health(&self) -> NetworkHealth {
        let avg_latency_ms = self.average_latency();
        let delivery_rate = self.delivery_rate();
        NetworkHealth {
            health_score: health_score(avg_latency_ms, delivery_rate),
            avg_latency_ms,
            delivery_rate,
            failed_messages: self.failed_messages(),
            bandwidth: self.bandwidth(),
        }
    }
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Unweighted mean of the delivery rate and, when latency samples exist,
/// the latency score `max(0, 1 - latency_ms / 1000)`.
pub fn health_score(avg_latency_ms: Option<f64>, delivery_rate: f64) -> f64 {
    match avg_latency_ms {
        Some(latency) => {
            let latency_score = (1.0 - latency / 1000.0).max(0.0);
            (delivery_rate + latency_score) / 2.0
        }
        None => delivery_rate,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthUsage {
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub total_messages: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkHealth {
    pub health_score: f64,
    pub avg_latency_ms: Option<f64>,
    pub delivery_rate: f64,
    pub failed_messages: u64,
    pub bandwidth: BandwidthUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
}

/// Raised when the health score drops below the alert threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthAlert {
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub threshold: f64,
    pub metrics: NetworkHealth,
}

/// An alert sink. Errors and panics are logged and never stop other
/// callbacks.
pub type AlertCallback = Arc<dyn Fn(&HealthAlert) -> anyhow::Result<()> + Send + Sync>;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Periodically scores [`NetworkMetrics`] and fires alert callbacks.
pub struct NetworkMonitor {
    metrics: Arc<NetworkMetrics>,
    callbacks: RwLock<Vec<AlertCallback>>,
    interval: Duration,
    threshold: f64,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl NetworkMonitor {
    pub fn new(metrics: Arc<NetworkMetrics>, interval: Duration, threshold: f64) -> Self {
        Self {
            metrics,
            callbacks: RwLock::new(Vec::new()),
            interval,
            threshold,
            task: Mutex::new(None),
        }
    }

    pub fn add_alert_callback(&self, callback: AlertCallback) {
        self.callbacks.write().push(callback);
    }

    /// Score the network once; fire alerts if degraded. Returns the alert
    /// that was raised, if any.
    pub fn check_health(&self) -> Option<HealthAlert> {
        let health = self.metrics.health();
        if health.health_score >= self.threshold {
            debug!("Network health {:.3}", health.health_score);
            return None;
        }

        warn!(
            "Network health degraded: score {:.3} below {:.3}",
            health.health_score, self.threshold
        );
        let alert = HealthAlert {
            timestamp: Utc::now(),
            severity: AlertSeverity::Warning,
            threshold: self.threshold,
            metrics: health,
        };

        let callbacks = self.callbacks.read().clone();
        for (index, callback) in callbacks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| callback(&alert))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Alert callback {index} failed: {e}"),
                Err(panic) => error!("Alert callback {index} panicked: {}", panic_message(&*panic)),
            }
        }
        Some(alert)
    }

    /// Spawn the monitoring loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let monitor = Arc::clone(self);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tokio::time::sleep(monitor.interval) => {
                        monitor.check_health();
                    }
                }
            }
            debug!("Network monitor stopped");
        });
        *task = Some((cancel, handle));
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!("Network monitor task failed: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Health monitor — background probe task per running executor.
//!
//! The `HealthMonitor` spawns one task per slot that probes the executor on
//! a fixed interval and reports through a [`HealthCallback`]. It never
//! touches slot state; the scheduler owns that.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use keel_core::HealthSettings;
use keel_state::{Generation, SlotId, TaskId, epoch_millis};

use crate::checker::{BoxFuture, HealthTracker, HealthVerdict, ProbeResult, ProbeTarget, Prober};

/// Signal raised by a slot's probe task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    /// The executor answered a probe.
    Ack {
        slot_id: SlotId,
        generation: Generation,
        task_id: TaskId,
        /// Unix timestamp (millis) of the acknowledgment.
        at_ms: u64,
    },
    /// No acknowledgment within `delay + timeout`. Raised once; the probe
    /// task exits afterwards.
    Expired {
        slot_id: SlotId,
        generation: Generation,
        task_id: TaskId,
        silent_for: Duration,
    },
}

impl HealthSignal {
    pub fn slot_id(&self) -> SlotId {
        match self {
            HealthSignal::Ack { slot_id, .. } | HealthSignal::Expired { slot_id, .. } => *slot_id,
        }
    }

    pub fn generation(&self) -> Generation {
        match self {
            HealthSignal::Ack { generation, .. } | HealthSignal::Expired { generation, .. } => {
                *generation
            }
        }
    }
}

/// Callback invoked for every health signal.
///
/// The scheduler uses this to route signals into its event loop.
pub type HealthCallback = Arc<dyn Fn(HealthSignal) -> BoxFuture<()> + Send + Sync>;

/// Per-slot monitor state.
struct MonitorSlot {
    generation: Generation,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages probe tasks for all running executors.
pub struct HealthMonitor {
    prober: Arc<dyn Prober>,
    policy: HealthSettings,
    /// Active monitors: slot_id → slot.
    monitors: Arc<RwLock<HashMap<SlotId, MonitorSlot>>>,
    on_signal: Option<HealthCallback>,
}

impl HealthMonitor {
    pub fn new(prober: Arc<dyn Prober>, policy: HealthSettings) -> Self {
        Self {
            prober,
            policy,
            monitors: Arc::new(RwLock::new(HashMap::new())),
            on_signal: None,
        }
    }

    /// Set the callback that receives health signals.
    pub fn with_callback(mut self, callback: HealthCallback) -> Self {
        self.on_signal = Some(callback);
        self
    }

    pub fn policy(&self) -> HealthSettings {
        self.policy
    }

    /// Start monitoring an executor. Replaces any monitor already running
    /// for the same slot; the grace period starts now.
    pub async fn start_monitor(&self, target: ProbeTarget) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let slot_id = target.slot_id;
        let generation = target.generation;
        let task_id = target.task_id.clone();
        let prober = self.prober.clone();
        let policy = self.policy;
        let callback = self.on_signal.clone();

        let handle = tokio::spawn(async move {
            run_probe_loop(target, policy, prober, callback, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            slot_id,
            MonitorSlot {
                generation,
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(slot_id, generation, %task_id, "health monitor started");
    }

    /// Stop monitoring a slot.
    pub async fn stop_monitor(&self, slot_id: SlotId) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(&slot_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(slot_id, generation = slot.generation, "health monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (slot_id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(slot_id, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    /// Slot ids with an active monitor, in ascending order.
    pub async fn active_monitors(&self) -> Vec<SlotId> {
        let monitors = self.monitors.read().await;
        let mut ids: Vec<SlotId> = monitors.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether the slot is monitored for the given binding.
    pub async fn is_monitoring(&self, slot_id: SlotId, generation: Generation) -> bool {
        let monitors = self.monitors.read().await;
        monitors
            .get(&slot_id)
            .is_some_and(|m| m.generation == generation)
    }
}

/// The probe loop for a single executor.
async fn run_probe_loop(
    target: ProbeTarget,
    policy: HealthSettings,
    prober: Arc<dyn Prober>,
    callback: Option<HealthCallback>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = HealthTracker::new(policy, Instant::now());

    debug!(
        slot_id = target.slot_id,
        address = %target.address(),
        "probe loop starting"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(policy.interval) => {
                let answer = tokio::time::timeout(policy.timeout, prober.probe(&target)).await;
                let result = answer.unwrap_or(ProbeResult::Failed);
                let verdict = tracker.record(result, Instant::now());

                if result == ProbeResult::Healthy {
                    if let Some(ref cb) = callback {
                        cb(HealthSignal::Ack {
                            slot_id: target.slot_id,
                            generation: target.generation,
                            task_id: target.task_id.clone(),
                            at_ms: epoch_millis(),
                        })
                        .await;
                    }
                }

                if verdict == HealthVerdict::Overdue {
                    let silent_for = tracker.silent_for(Instant::now());
                    warn!(
                        slot_id = target.slot_id,
                        generation = target.generation,
                        task_id = %target.task_id,
                        ?silent_for,
                        "executor failed health check window"
                    );
                    if let Some(ref cb) = callback {
                        cb(HealthSignal::Expired {
                            slot_id: target.slot_id,
                            generation: target.generation,
                            task_id: target.task_id.clone(),
                            silent_for,
                        })
                        .await;
                    }
                    break;
                }
            }
            _ = shutdown.changed() => {
                debug!(slot_id = target.slot_id, "probe loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc;

    struct ToggleProber {
        healthy: Arc<AtomicBool>,
    }

    impl Prober for ToggleProber {
        fn probe(&self, _target: &ProbeTarget) -> BoxFuture<ProbeResult> {
            let result = if self.healthy.load(Ordering::SeqCst) {
                ProbeResult::Healthy
            } else {
                ProbeResult::Failed
            };
            Box::pin(async move { result })
        }
    }

    fn policy() -> HealthSettings {
        HealthSettings {
            delay: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(1),
        }
    }

    fn target(slot_id: SlotId) -> ProbeTarget {
        ProbeTarget {
            slot_id,
            generation: 1,
            task_id: TaskId::for_binding("keel-test", slot_id, 1),
            hostname: "127.0.0.1".to_string(),
            port: 9200,
        }
    }

    fn monitor(
        healthy: bool,
    ) -> (HealthMonitor, Arc<AtomicBool>, mpsc::UnboundedReceiver<HealthSignal>) {
        let flag = Arc::new(AtomicBool::new(healthy));
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: HealthCallback = Arc::new(move |signal| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(signal);
            }) as BoxFuture<()>
        });
        let prober = Arc::new(ToggleProber {
            healthy: flag.clone(),
        });
        (
            HealthMonitor::new(prober, policy()).with_callback(callback),
            flag,
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_executor_acks() {
        let (monitor, _flag, mut rx) = monitor(true);
        monitor.start_monitor(target(0)).await;

        let signal = rx.recv().await.unwrap();
        assert!(matches!(signal, HealthSignal::Ack { slot_id: 0, generation: 1, .. }));
        monitor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_executor_expires_once_after_window() {
        let (monitor, _flag, mut rx) = monitor(false);
        let started = Instant::now();
        monitor.start_monitor(target(3)).await;

        let signal = rx.recv().await.unwrap();
        match signal {
            HealthSignal::Expired { slot_id, silent_for, .. } => {
                assert_eq!(slot_id, 3);
                assert!(silent_for > Duration::from_secs(10));
            }
            other => panic!("unexpected signal {other:?}"),
        }
        assert!(started.elapsed() > Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_after_acks_expires() {
        let (monitor, flag, mut rx) = monitor(true);
        monitor.start_monitor(target(1)).await;
        assert!(matches!(rx.recv().await.unwrap(), HealthSignal::Ack { .. }));

        flag.store(false, Ordering::SeqCst);
        loop {
            match rx.recv().await.unwrap() {
                HealthSignal::Ack { .. } => continue,
                HealthSignal::Expired { slot_id, .. } => {
                    assert_eq!(slot_id, 1);
                    break;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_monitors() {
        let (monitor, _flag, _rx) = monitor(true);
        monitor.start_monitor(target(0)).await;
        monitor.start_monitor(target(2)).await;

        assert_eq!(monitor.active_monitors().await, vec![0, 2]);
        assert!(monitor.is_monitoring(2, 1).await);
        assert!(!monitor.is_monitoring(2, 7).await);

        monitor.stop_monitor(0).await;
        assert_eq!(monitor.active_monitors().await, vec![2]);

        monitor.stop_all().await;
        assert!(monitor.active_monitors().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_existing_monitor() {
        let (monitor, _flag, _rx) = monitor(true);
        monitor.start_monitor(target(0)).await;

        let mut next = target(0);
        next.generation = 2;
        monitor.start_monitor(next).await;

        assert_eq!(monitor.active_monitors().await, vec![0]);
        assert!(monitor.is_monitoring(0, 2).await);
        assert!(!monitor.is_monitoring(0, 1).await);
    }
}

//! Health probes answered from the simulated task table.

use keel_health::{BoxFuture, ProbeResult, ProbeTarget, Prober};
use keel_state::TaskState;

use crate::cluster::SimCluster;

/// Healthy while the target task is running and responsive. Answers arrive
/// after the cluster's configured latency.
pub struct SimProber {
    cluster: SimCluster,
}

impl SimProber {
    pub fn new(cluster: SimCluster) -> Self {
        Self { cluster }
    }
}

impl Prober for SimProber {
    fn probe(&self, target: &ProbeTarget) -> BoxFuture<ProbeResult> {
        let result = match self.cluster.task(&target.task_id) {
            Some(task) if task.state == TaskState::Running && task.responsive => {
                ProbeResult::Healthy
            }
            _ => ProbeResult::Failed,
        };
        let latency = self.cluster.probe_latency();
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            result
        })
    }
}

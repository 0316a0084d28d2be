//! SimDriver — the scheduler's view of a [`SimCluster`].

use keel_scheduler::{LaunchRequest, ResourceManager};
use keel_state::TaskId;

use crate::cluster::SimCluster;

/// A resource manager bound to one registration of a [`SimCluster`].
///
/// Calls made after the scheduler re-registers (or while the link is
/// severed) are dropped, the same way a real driver's calls would be.
pub struct SimDriver {
    cluster: SimCluster,
    connection: u64,
}

impl SimDriver {
    pub(crate) fn new(cluster: SimCluster, connection: u64) -> Self {
        Self {
            cluster,
            connection,
        }
    }
}

impl ResourceManager for SimDriver {
    fn launch(&self, request: LaunchRequest) {
        self.cluster.launch(self.connection, request);
    }

    fn kill(&self, task_id: &TaskId) {
        self.cluster.kill(self.connection, task_id);
    }

    fn decline(&self, offer_id: &str) {
        self.cluster.decline(self.connection, offer_id);
    }

    fn reconcile(&self, sweep: u64, known: Vec<TaskId>) {
        self.cluster.reconcile(self.connection, sweep, known);
    }

    fn revive(&self) {
        self.cluster.revive(self.connection);
    }
}

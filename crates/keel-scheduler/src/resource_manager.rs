//! The cluster resource manager, as seen by the scheduler.
//!
//! Every call is fire-and-forget: results come back later as
//! [`SchedulerEvent`](crate::SchedulerEvent)s.

use keel_core::ExecutorCommand;
use keel_state::{Generation, PortPair, SlotId, TaskId};

/// Everything needed to start one executor on one offer.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub task_id: TaskId,
    pub slot_id: SlotId,
    pub generation: Generation,
    pub offer_id: String,
    pub agent_id: String,
    pub hostname: String,
    pub cpus: f64,
    pub mem_mb: u64,
    pub ports: PortPair,
    pub command: ExecutorCommand,
}

pub trait ResourceManager: Send + Sync {
    fn launch(&self, request: LaunchRequest);

    fn kill(&self, task_id: &TaskId);

    /// Return an offer unused.
    fn decline(&self, offer_id: &str);

    /// Ask for the status of `known` plus every other task of this
    /// framework. The answer arrives as a `ClusterSnapshot` tagged `sweep`.
    fn reconcile(&self, sweep: u64, known: Vec<TaskId>);

    /// Ask for offers to be sent again.
    fn revive(&self);
}

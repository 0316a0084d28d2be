//! Events consumed by the reconciliation loop.
//!
//! Every input to the coordinator arrives as a [`SchedulerEvent`] on one
//! unbounded channel: resource-manager callbacks, health signals, timer
//! ticks, and operator requests.

use tokio::sync::{mpsc, oneshot};

use keel_health::HealthSignal;
use keel_placement::Offer;
use keel_state::{DesiredSpec, TaskId, TaskState};

use crate::error::SchedulerResult;

/// A task status change pushed by the resource manager.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatusUpdate {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Unix timestamp (millis) at which the resource manager observed the change.
    pub timestamp: u64,
    pub reason: Option<String>,
}

/// One entry of a cluster snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedTask {
    pub task_id: TaskId,
    pub state: TaskState,
}

#[derive(Debug)]
pub enum SchedulerEvent {
    /// First registration with the resource manager.
    Connected,
    /// Registration restored after a disruption.
    Reregistered,
    /// The link to the resource manager dropped.
    Disconnected,
    Offers(Vec<Offer>),
    StatusUpdate(TaskStatusUpdate),
    /// Answer to a reconciliation request.
    ClusterSnapshot { sweep: u64, tasks: Vec<ObservedTask> },
    Health(HealthSignal),
    /// Operator asked for a sweep.
    ReconcileNow,
    /// Periodic timer.
    SweepTick,
    Reconfigure {
        spec: DesiredSpec,
        reply: Option<oneshot::Sender<SchedulerResult<()>>>,
    },
    Shutdown,
}

pub type EventSender = mpsc::UnboundedSender<SchedulerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SchedulerEvent>;

/// Create the coordinator's event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

//! keel-scheduler — keeps a fixed-size executor fleet converged.
//!
//! Reconciles what the operator asked for (`DesiredSpec`) against what the
//! resource manager reports, and launches or kills executors to close the
//! gap. The coordinator is the single writer of slot state:
//!
//! - Binds empty slots to new tasks from resource offers
//! - Applies task status updates, discarding stale generations
//! - Sweeps the cluster on (re)connection and on a timer, killing orphans
//! - Kills executors whose health checks lapse
//!
//! # Architecture
//!
//! ```text
//! SchedulerHandle ──events──▶ ReconciliationCoordinator
//!                               ├── DesiredStateStore (persisted target)
//!                               ├── ExecutorRegistry (persisted slots)
//!                               ├── LaunchPlanner (offers → launches)
//!                               ├── HealthMonitor (probe tasks → events)
//!                               └── ResourceManager (launch / kill / reconcile)
//! ```

pub mod coordinator;
pub mod desired;
pub mod error;
pub mod events;
pub mod handle;
pub mod planner;
pub mod registry;
pub mod resource_manager;

pub use coordinator::{ReconciliationCoordinator, SchedulerSnapshot};
pub use desired::{DesiredStateStore, load_or_create_identity};
pub use error::{SchedulerError, SchedulerResult};
pub use events::{
    EventReceiver, EventSender, ObservedTask, SchedulerEvent, TaskStatusUpdate, event_channel,
};
pub use handle::SchedulerHandle;
pub use planner::{LaunchPlan, LaunchPlanner};
pub use registry::{ExecutorRegistry, StatusOutcome};
pub use resource_manager::{LaunchRequest, ResourceManager};

//! SchedulerHandle — how the rest of the process talks to a running scheduler.

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

use keel_core::SchedulerSettings;
use keel_health::Prober;
use keel_state::{DesiredSpec, StateStore};

use crate::coordinator::{ReconciliationCoordinator, SchedulerSnapshot};
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{EventSender, SchedulerEvent, event_channel};
use crate::resource_manager::ResourceManager;

/// Cheap to clone; every clone talks to the same coordinator.
#[derive(Clone)]
pub struct SchedulerHandle {
    events: EventSender,
    snapshot: watch::Receiver<SchedulerSnapshot>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl SchedulerHandle {
    /// Bootstrap a coordinator and spawn its loop.
    ///
    /// `connect` receives the event sender and returns the resource manager
    /// the coordinator will drive; it is the place to register with the
    /// cluster.
    pub async fn start<F>(
        settings: &SchedulerSettings,
        store: StateStore,
        prober: Arc<dyn Prober>,
        apply_config: bool,
        connect: F,
    ) -> SchedulerResult<Self>
    where
        F: FnOnce(EventSender) -> Arc<dyn ResourceManager>,
    {
        let (events, receiver) = event_channel();
        let rm = connect(events.clone());
        let coordinator = ReconciliationCoordinator::bootstrap(
            settings,
            store,
            rm,
            prober,
            events.clone(),
            apply_config,
        )
        .await?;
        let snapshot = coordinator.subscribe();
        let task = tokio::spawn(coordinator.run(receiver));

        info!("scheduler started");
        Ok(Self {
            events,
            snapshot,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        })
    }

    /// Sender for feeding events into the loop.
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn send(&self, event: SchedulerEvent) -> SchedulerResult<()> {
        self.events.send(event).map_err(|_| SchedulerError::Stopped)
    }

    /// Whether the coordinator loop is still accepting events.
    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }

    /// The latest published view.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshot.clone()
    }

    /// Request an immediate reconciliation sweep.
    pub fn reconcile_now(&self) -> SchedulerResult<()> {
        self.send(SchedulerEvent::ReconcileNow)
    }

    /// Replace the desired spec and wait for the coordinator to apply it.
    pub async fn reconfigure(&self, spec: DesiredSpec) -> SchedulerResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(SchedulerEvent::Reconfigure {
            spec,
            reply: Some(reply),
        })?;
        response.await.map_err(|_| SchedulerError::Stopped)?
    }

    /// Stop the loop and wait for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.events.send(SchedulerEvent::Shutdown);
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

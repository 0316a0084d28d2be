//! SimCluster — agents, offers, and the task table.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use keel_placement::{Offer, OfferCapacity, PortRange};
use keel_scheduler::{
    EventSender, LaunchRequest, ObservedTask, ResourceManager, SchedulerEvent, TaskStatusUpdate,
};
use keel_state::{PortPair, ResourceRequirements, TaskId, TaskState, epoch_millis};

use crate::driver::SimDriver;

/// A simulated machine.
#[derive(Debug, Clone, PartialEq)]
pub struct SimAgent {
    pub agent_id: String,
    pub hostname: String,
    pub cpus: f64,
    pub mem_mb: u64,
    pub ports: Vec<PortRange>,
}

impl SimAgent {
    /// An agent with 4 CPUs, 8 GiB, the 9200/9300 blocks and an ephemeral range.
    pub fn standard(index: usize) -> Self {
        Self {
            agent_id: format!("agent-{index}"),
            hostname: format!("sim-host-{index}"),
            cpus: 4.0,
            mem_mb: 8192,
            ports: vec![
                PortRange::new(9200, 9209),
                PortRange::new(9300, 9309),
                PortRange::new(31000, 31099),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub agents: Vec<SimAgent>,
    /// Cadence of unsolicited offer cycles.
    pub offer_interval: Duration,
    /// How long a launched task stays in staging.
    pub staging_delay: Duration,
    /// How long every health check takes to be answered.
    pub probe_latency: Duration,
}

impl SimConfig {
    pub fn with_agents(count: usize) -> Self {
        Self {
            agents: (0..count).map(SimAgent::standard).collect(),
            offer_interval: Duration::from_secs(1),
            staging_delay: Duration::from_millis(200),
            probe_latency: Duration::ZERO,
        }
    }
}

/// A task living on a simulated agent.
#[derive(Debug, Clone, PartialEq)]
pub struct SimTask {
    pub task_id: TaskId,
    pub agent_id: String,
    pub hostname: String,
    pub ports: PortPair,
    pub cpus: f64,
    pub mem_mb: u64,
    pub state: TaskState,
    /// Whether the task answers health probes.
    pub responsive: bool,
}

struct Inner {
    framework: Option<EventSender>,
    /// Bumped on every registration so calls from an older driver are dropped.
    connection: u64,
    severed: bool,
    /// Live tasks only; terminal tasks are removed.
    tasks: BTreeMap<TaskId, SimTask>,
    /// offer_id → agent_id
    outstanding: HashMap<String, String>,
    /// Offers already launched on, which stay valid for further launches
    /// until their agent is offered again. offer_id → agent_id
    used_offers: HashMap<String, String>,
    next_offer: u64,
    launched_total: u64,
    killed_total: u64,
}

impl Inner {
    fn notify(&self, event: SchedulerEvent) {
        if self.severed {
            debug!(?event, "link severed; event dropped");
            return;
        }
        if let Some(framework) = &self.framework {
            let _ = framework.send(event);
        }
    }

    fn notify_status(&self, task_id: &TaskId, state: TaskState, reason: &str) {
        self.notify(SchedulerEvent::StatusUpdate(TaskStatusUpdate {
            task_id: task_id.clone(),
            state,
            timestamp: epoch_millis(),
            reason: Some(reason.to_string()),
        }));
    }

    fn active(&self, connection: u64) -> bool {
        self.connection == connection && self.framework.is_some() && !self.severed
    }
}

/// Handle to a simulated cluster. Clones share the same cluster.
#[derive(Clone)]
pub struct SimCluster {
    config: Arc<SimConfig>,
    inner: Arc<Mutex<Inner>>,
    revive: Arc<Notify>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SimCluster {
    /// Create the cluster and start its offer loop.
    pub fn start(config: SimConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cluster = Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner {
                framework: None,
                connection: 0,
                severed: false,
                tasks: BTreeMap::new(),
                outstanding: HashMap::new(),
                used_offers: HashMap::new(),
                next_offer: 0,
                launched_total: 0,
                killed_total: 0,
            })),
            revive: Arc::new(Notify::new()),
            shutdown_tx: Arc::new(shutdown_tx),
        };

        tokio::spawn(run_offer_loop(cluster.clone(), shutdown_rx));
        info!(agents = cluster.config.agents.len(), "simulated cluster started");
        cluster
    }

    /// Stop the offer loop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn probe_latency(&self) -> Duration {
        self.config.probe_latency
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Framework link ─────────────────────────────────────────────

    /// Register a scheduler. Replaces any previous registration; the new
    /// scheduler receives `Connected`.
    pub fn register(&self, events: EventSender) -> Arc<dyn ResourceManager> {
        let mut inner = self.lock();
        inner.connection += 1;
        inner.framework = Some(events);
        inner.severed = false;
        inner.outstanding.clear();
        inner.used_offers.clear();
        inner.notify(SchedulerEvent::Connected);
        info!(connection = inner.connection, "framework registered");
        Arc::new(SimDriver::new(self.clone(), inner.connection))
    }

    /// The scheduler process went away. Its tasks keep running.
    pub fn disconnect_framework(&self) {
        let mut inner = self.lock();
        inner.framework = None;
        inner.outstanding.clear();
        inner.used_offers.clear();
        info!("framework disconnected");
    }

    /// Drop the link without unregistering; the scheduler sees `Disconnected`.
    pub fn sever(&self) {
        let mut inner = self.lock();
        inner.notify(SchedulerEvent::Disconnected);
        inner.severed = true;
        inner.outstanding.clear();
        inner.used_offers.clear();
        info!("framework link severed");
    }

    /// Restore a severed link; the scheduler sees `Reregistered`.
    pub fn restore(&self) {
        let mut inner = self.lock();
        inner.severed = false;
        inner.notify(SchedulerEvent::Reregistered);
        info!("framework link restored");
    }

    // ── Fault injection ────────────────────────────────────────────

    /// Crash a task. Returns `false` if it was not running.
    pub fn kill_task_externally(&self, task_id: &TaskId) -> bool {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.remove(task_id) else {
            return false;
        };
        warn!(task_id = %task.task_id, "task crashed");
        inner.notify_status(task_id, TaskState::Failed, "executor process exited");
        true
    }

    /// Make a task stop (or resume) answering health probes.
    pub fn set_responsive(&self, task_id: &TaskId, responsive: bool) -> bool {
        let mut inner = self.lock();
        match inner.tasks.get_mut(task_id) {
            Some(task) => {
                task.responsive = responsive;
                true
            }
            None => false,
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn task(&self, task_id: &TaskId) -> Option<SimTask> {
        self.lock().tasks.get(task_id).cloned()
    }

    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .map(|t| t.task_id.clone())
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.running_tasks().len()
    }

    pub fn launched_total(&self) -> u64 {
        self.lock().launched_total
    }

    pub fn killed_total(&self) -> u64 {
        self.lock().killed_total
    }

    // ── Calls from the driver ──────────────────────────────────────

    pub(crate) fn launch(&self, connection: u64, request: LaunchRequest) {
        let mut inner = self.lock();
        if !inner.active(connection) {
            debug!(task_id = %request.task_id, "launch from inactive driver dropped");
            return;
        }

        let offer_valid = match inner.outstanding.remove(&request.offer_id) {
            Some(agent_id) => {
                inner.used_offers.insert(request.offer_id.clone(), agent_id);
                true
            }
            None => inner.used_offers.contains_key(&request.offer_id),
        };
        if !offer_valid || inner.tasks.contains_key(&request.task_id) {
            inner.notify_status(&request.task_id, TaskState::Lost, "offer no longer valid");
            return;
        }

        let task = SimTask {
            task_id: request.task_id.clone(),
            agent_id: request.agent_id,
            hostname: request.hostname,
            ports: request.ports,
            cpus: request.cpus,
            mem_mb: request.mem_mb,
            state: TaskState::Staging,
            responsive: true,
        };
        debug!(task_id = %task.task_id, host = %task.hostname, "task staging");
        inner.tasks.insert(task.task_id.clone(), task);
        inner.launched_total += 1;
        inner.notify_status(&request.task_id, TaskState::Staging, "launched");
        drop(inner);

        let cluster = self.clone();
        let delay = self.config.staging_delay;
        let task_id = request.task_id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cluster.promote(&task_id);
        });
    }

    fn promote(&self, task_id: &TaskId) {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return;
        };
        if task.state != TaskState::Staging {
            return;
        }
        task.state = TaskState::Running;
        inner.notify_status(task_id, TaskState::Running, "started");
    }

    pub(crate) fn kill(&self, connection: u64, task_id: &TaskId) {
        let mut inner = self.lock();
        if !inner.active(connection) {
            debug!(%task_id, "kill from inactive driver dropped");
            return;
        }
        if inner.tasks.remove(task_id).is_some() {
            inner.killed_total += 1;
            inner.notify_status(task_id, TaskState::Killed, "killed by framework");
        } else {
            inner.notify_status(task_id, TaskState::Lost, "unknown task");
        }
    }

    pub(crate) fn decline(&self, connection: u64, offer_id: &str) {
        let mut inner = self.lock();
        if inner.active(connection) {
            inner.outstanding.remove(offer_id);
        }
    }

    pub(crate) fn reconcile(&self, connection: u64, sweep: u64, known: Vec<TaskId>) {
        let inner = self.lock();
        if !inner.active(connection) {
            debug!(sweep, "reconcile from inactive driver dropped");
            return;
        }

        let mut tasks: Vec<ObservedTask> = inner
            .tasks
            .values()
            .map(|t| ObservedTask {
                task_id: t.task_id.clone(),
                state: t.state,
            })
            .collect();
        for task_id in known {
            if !inner.tasks.contains_key(&task_id) {
                tasks.push(ObservedTask {
                    task_id,
                    state: TaskState::Lost,
                });
            }
        }
        debug!(sweep, reported = tasks.len(), "answering reconciliation");
        inner.notify(SchedulerEvent::ClusterSnapshot { sweep, tasks });
    }

    pub(crate) fn revive(&self, connection: u64) {
        if self.lock().active(connection) {
            self.revive.notify_one();
        }
    }

    // ── Offers ─────────────────────────────────────────────────────

    fn offer_cycle(&self) {
        let mut inner = self.lock();
        if inner.framework.is_none() || inner.severed {
            return;
        }

        let mut offers = Vec::new();
        for agent in &self.config.agents {
            if inner.outstanding.values().any(|a| *a == agent.agent_id) {
                continue;
            }
            let Some(offer) = free_resources(agent, &inner.tasks, inner.next_offer) else {
                continue;
            };
            inner.next_offer += 1;
            inner.used_offers.retain(|_, a| *a != agent.agent_id);
            inner.outstanding.insert(offer.offer_id.clone(), agent.agent_id.clone());
            offers.push(offer);
        }

        if !offers.is_empty() {
            debug!(offers = offers.len(), "sending offers");
            inner.notify(SchedulerEvent::Offers(offers));
        }
    }
}

/// What is left on `agent` after its running tasks, as an offer.
fn free_resources(
    agent: &SimAgent,
    tasks: &BTreeMap<TaskId, SimTask>,
    seq: u64,
) -> Option<Offer> {
    let mut capacity = OfferCapacity::from_offer(&Offer {
        offer_id: String::new(),
        agent_id: agent.agent_id.clone(),
        hostname: agent.hostname.clone(),
        cpus: agent.cpus,
        mem_mb: agent.mem_mb,
        ports: agent.ports.clone(),
    });
    for task in tasks.values().filter(|t| t.agent_id == agent.agent_id) {
        let used = ResourceRequirements {
            cpus: task.cpus,
            mem_mb: task.mem_mb,
            ports: Vec::new(),
            strict_ports: false,
        };
        capacity.consume(&used, task.ports);
    }
    if capacity.cpus <= 0.0 || capacity.mem_mb == 0 {
        return None;
    }
    Some(Offer {
        offer_id: format!("offer-{seq}"),
        agent_id: agent.agent_id.clone(),
        hostname: agent.hostname.clone(),
        cpus: capacity.cpus,
        mem_mb: capacity.mem_mb,
        ports: capacity.ports,
    })
}

async fn run_offer_loop(cluster: SimCluster, mut shutdown: watch::Receiver<bool>) {
    let interval = cluster.config.offer_interval;
    let revive = cluster.revive.clone();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => cluster.offer_cycle(),
            _ = revive.notified() => cluster.offer_cycle(),
            _ = shutdown.changed() => {
                debug!("offer loop shutting down");
                break;
            }
        }
    }
}

//! ReconciliationCoordinator — the scheduler's control loop.
//!
//! The coordinator owns the registry, the desired state, and the planner,
//! and is the only writer of slot state. Every input arrives as a
//! [`SchedulerEvent`]; after each event a fresh [`SchedulerSnapshot`] is
//! published for readers.
//!
//! # Sweeps
//!
//! A sweep asks the resource manager for the status of every task it knows
//! about. The bindings present when the sweep was requested are captured;
//! when the answer arrives, captured bindings the cluster no longer reports
//! are lost, tasks nobody bound are killed, and the remaining deficit is
//! advertised with a revive. Answers to superseded sweeps are discarded.
//!
//! # Disconnection
//!
//! While the resource manager is unreachable, launches and kills are held
//! back. After reconnecting, one sweep must be applied before either
//! resumes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use keel_core::{ReconcileSettings, SchedulerSettings};
use keel_health::{BoxFuture, HealthCallback, HealthMonitor, HealthSignal, ProbeTarget, Prober};
use keel_placement::Offer;
use keel_state::{
    DesiredSpec, ExecutorSlot, FrameworkIdentity, Generation, SlotId, SlotState, StateStore,
    TaskId, TaskState,
};

use crate::desired::{DesiredStateStore, load_or_create_identity};
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{EventReceiver, EventSender, ObservedTask, SchedulerEvent, TaskStatusUpdate};
use crate::planner::LaunchPlanner;
use crate::registry::{ExecutorRegistry, StatusOutcome};
use crate::resource_manager::ResourceManager;

/// Sweeps whose answers are still accepted.
const MAX_IN_FLIGHT_SWEEPS: usize = 16;

/// Consistent view of the scheduler, published after every event.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub framework: FrameworkIdentity,
    pub desired: DesiredSpec,
    pub slots: Vec<ExecutorSlot>,
    pub connected: bool,
    pub launch_allowed: bool,
    pub store_healthy: bool,
    /// Number of the last applied sweep.
    pub last_sweep: u64,
    pub pending_kills: usize,
    pub launches_total: u64,
    pub kills_total: u64,
}

impl SchedulerSnapshot {
    pub fn count_in(&self, state: SlotState) -> u32 {
        self.slots.iter().filter(|s| s.state == state).count() as u32
    }

    pub fn running_count(&self) -> u32 {
        self.count_in(SlotState::Running)
    }

    pub fn alive_count(&self) -> u32 {
        self.slots.iter().filter(|s| s.state.is_alive()).count() as u32
    }

    pub fn deficit(&self) -> u32 {
        self.desired.count.saturating_sub(self.alive_count())
    }

    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Running)
            .filter_map(|s| s.task_id.clone())
            .collect()
    }
}

pub struct ReconciliationCoordinator {
    identity: FrameworkIdentity,
    desired: DesiredStateStore,
    registry: ExecutorRegistry,
    planner: LaunchPlanner,
    health: HealthMonitor,
    rm: Arc<dyn ResourceManager>,
    timing: ReconcileSettings,

    connected: bool,
    /// Sweep that must be applied before launches and kills resume.
    resume_sweep: Option<u64>,
    next_sweep: u64,
    applied_sweep: u64,
    /// Bindings captured when each outstanding sweep was requested.
    in_flight: BTreeMap<u64, HashSet<TaskId>>,
    revive_requested: bool,
    store_healthy: bool,
    /// Kills not yet confirmed; `None` = queued, not issued.
    pending_kills: HashMap<TaskId, Option<Instant>>,
    /// Health expiries whose kill could not be recorded; retried on tick.
    pending_expiries: HashMap<SlotId, Generation>,
    launch_deadlines: HashMap<SlotId, (Generation, Instant)>,
    launches_total: u64,
    kills_total: u64,

    snapshot_tx: watch::Sender<SchedulerSnapshot>,
}

impl ReconciliationCoordinator {
    /// Load persisted state and get ready to run.
    ///
    /// Fails if the store cannot be read; nothing is launched in that case.
    pub async fn bootstrap(
        settings: &SchedulerSettings,
        store: StateStore,
        rm: Arc<dyn ResourceManager>,
        prober: Arc<dyn Prober>,
        events: EventSender,
        apply_config: bool,
    ) -> SchedulerResult<Self> {
        store.ping()?;
        let persisted = store.load()?;
        let identity = load_or_create_identity(
            &store,
            persisted.framework.clone(),
            &settings.framework_name,
            || uuid::Uuid::new_v4().simple().to_string(),
        )?;
        let desired = DesiredStateStore::bootstrap(
            store.clone(),
            persisted.desired.clone(),
            settings.desired.clone(),
            apply_config,
        )?;
        let mut registry = ExecutorRegistry::restore(store, persisted)?;
        let removed = registry.resize(desired.get().count)?;

        let health =
            HealthMonitor::new(prober, settings.health).with_callback(health_callback(events));
        let planner = LaunchPlanner::new(identity.task_prefix(), settings.command.clone());

        let initial = SchedulerSnapshot {
            framework: identity.clone(),
            desired: desired.get().clone(),
            slots: registry.snapshot(),
            connected: false,
            launch_allowed: false,
            store_healthy: true,
            last_sweep: 0,
            pending_kills: 0,
            launches_total: 0,
            kills_total: 0,
        };
        let (snapshot_tx, _) = watch::channel(initial);

        let mut coordinator = Self {
            identity,
            desired,
            registry,
            planner,
            health,
            rm,
            timing: settings.reconcile,
            connected: false,
            resume_sweep: None,
            next_sweep: 0,
            applied_sweep: 0,
            in_flight: BTreeMap::new(),
            revive_requested: false,
            store_healthy: true,
            pending_kills: HashMap::new(),
            pending_expiries: HashMap::new(),
            launch_deadlines: HashMap::new(),
            launches_total: 0,
            kills_total: 0,
            snapshot_tx,
        };

        for slot in removed {
            if let Some(task_id) = slot.task_id.filter(|_| slot.state.has_live_task()) {
                coordinator.pending_kills.insert(task_id, None);
            }
        }

        // Running executors get a fresh grace period, pending launches a fresh
        // deadline. Kills started by a previous run are sent again.
        let now = Instant::now();
        for slot in coordinator.registry.snapshot() {
            match slot.state {
                SlotState::Running => coordinator.start_monitor(&slot).await,
                SlotState::LaunchPending => {
                    let deadline = now + coordinator.timing.launch_timeout;
                    coordinator
                        .launch_deadlines
                        .insert(slot.slot_id, (slot.generation, deadline));
                }
                SlotState::Unhealthy | SlotState::Killing => {
                    if let Some(task_id) = slot.task_id {
                        coordinator.pending_kills.insert(task_id, None);
                    }
                }
                _ => {}
            }
        }

        info!(
            framework_id = %coordinator.identity.framework_id,
            desired = coordinator.desired.get().count,
            slots = coordinator.registry.len(),
            "reconciliation coordinator bootstrapped"
        );
        coordinator.publish();
        Ok(coordinator)
    }

    pub fn identity(&self) -> &FrameworkIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn desired(&self) -> &DesiredSpec {
        self.desired.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Launches may be issued: connected, resumed after a sweep, store writable.
    pub fn launch_allowed(&self) -> bool {
        self.connected && self.resume_sweep.is_none() && self.store_healthy
    }

    fn kills_allowed(&self) -> bool {
        self.connected && self.resume_sweep.is_none()
    }

    /// Drive the coordinator until `Shutdown` or until every sender is gone.
    pub async fn run(mut self, mut events: EventReceiver) {
        let mut ticker = tokio::time::interval(self.timing.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = ticker.tick() => SchedulerEvent::SweepTick,
            };
            if !self.handle(event).await {
                break;
            }
        }

        self.health.stop_all().await;
        info!("reconciliation coordinator stopped");
    }

    /// Handle one event. Returns `false` once the loop should stop.
    pub async fn handle(&mut self, event: SchedulerEvent) -> bool {
        match event {
            SchedulerEvent::Connected => self.on_connected("registered"),
            SchedulerEvent::Reregistered => self.on_connected("reregistered"),
            SchedulerEvent::Disconnected => self.on_disconnected(),
            SchedulerEvent::Offers(offers) => self.on_offers(offers),
            SchedulerEvent::StatusUpdate(update) => self.on_status(update).await,
            SchedulerEvent::ClusterSnapshot { sweep, tasks } => {
                self.on_snapshot(sweep, tasks).await
            }
            SchedulerEvent::Health(signal) => self.on_health(signal).await,
            SchedulerEvent::ReconcileNow => {
                if self.connected {
                    self.start_sweep();
                } else {
                    info!("reconciliation requested while disconnected; will run on reconnection");
                }
            }
            SchedulerEvent::SweepTick => self.on_tick().await,
            SchedulerEvent::Reconfigure { spec, reply } => {
                let result = self.reconfigure(spec).await;
                if let Err(e) = &result {
                    warn!(error = %e, "reconfiguration rejected");
                }
                // Callers read the snapshot as soon as the reply lands.
                self.publish();
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SchedulerEvent::Shutdown => {
                info!("shutdown requested");
                return false;
            }
        }
        self.publish();
        true
    }

    // ── Connection lifecycle ───────────────────────────────────────

    fn on_connected(&mut self, how: &str) {
        self.connected = true;
        self.revive_requested = false;
        let sweep = self.start_sweep();
        self.resume_sweep = Some(sweep);
        info!(sweep, how, "connected to resource manager; launches held until sweep completes");
    }

    fn on_disconnected(&mut self) {
        self.connected = false;
        self.resume_sweep = None;
        // Anything issued on the old link may have been dropped.
        for issued in self.pending_kills.values_mut() {
            *issued = None;
        }
        warn!(
            queued_kills = self.pending_kills.len(),
            "disconnected from resource manager; launches and kills suspended"
        );
    }

    // ── Offers ─────────────────────────────────────────────────────

    fn on_offers(&mut self, offers: Vec<Offer>) {
        self.revive_requested = false;
        let desired = self.desired.get().clone();
        let deficit = self.registry.deficit(desired.count);

        if !self.launch_allowed() || deficit == 0 {
            debug!(
                offers = offers.len(),
                deficit,
                launch_allowed = self.launch_allowed(),
                "declining offers"
            );
            for offer in &offers {
                self.rm.decline(&offer.offer_id);
            }
            return;
        }

        let plan = self
            .planner
            .fill(&mut self.registry, &desired.resources, deficit, &offers);
        if plan.store_failed {
            self.store_healthy = false;
        }

        let deadline = Instant::now() + self.timing.launch_timeout;
        for request in plan.requests {
            info!(
                slot_id = request.slot_id,
                generation = request.generation,
                task_id = %request.task_id,
                host = %request.hostname,
                "launching executor"
            );
            self.launch_deadlines
                .insert(request.slot_id, (request.generation, deadline));
            self.launches_total += 1;
            self.rm.launch(request);
        }
        for offer_id in &plan.unused_offers {
            self.rm.decline(offer_id);
        }
    }

    // ── Status updates ─────────────────────────────────────────────

    async fn on_status(&mut self, update: TaskStatusUpdate) {
        debug!(
            task_id = %update.task_id,
            state = ?update.state,
            reason = ?update.reason,
            "status update"
        );
        self.apply_observed(&update.task_id, update.state, update.reason.as_deref())
            .await;
    }

    async fn apply_observed(&mut self, task_id: &TaskId, state: TaskState, reason: Option<&str>) {
        let generation = task_id.binding().map(|(_, g)| g).unwrap_or_default();
        let outcome = match self.registry.apply_status(task_id, state, generation) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.store_failure(&e);
                return;
            }
        };

        match outcome {
            StatusOutcome::Unknown | StatusOutcome::Stale if state.is_terminal() => {
                self.pending_kills.remove(task_id);
            }
            StatusOutcome::Unknown => {
                warn!(%task_id, ?state, "orphan task reported; killing");
                self.ensure_kill(task_id);
            }
            StatusOutcome::Stale | StatusOutcome::Ignored => {}
            StatusOutcome::Transitioned { slot_id, from, to } => {
                self.on_transition(slot_id, generation, task_id, from, to, reason)
                    .await;
            }
        }
    }

    async fn on_transition(
        &mut self,
        slot_id: SlotId,
        generation: Generation,
        task_id: &TaskId,
        from: SlotState,
        to: SlotState,
        reason: Option<&str>,
    ) {
        match to {
            SlotState::Staging => {
                self.launch_deadlines.remove(&slot_id);
            }
            SlotState::Running => {
                self.launch_deadlines.remove(&slot_id);
                info!(slot_id, generation, %task_id, "executor running");
                if let Some(slot) = self.registry.slot(slot_id).cloned() {
                    self.start_monitor(&slot).await;
                }
            }
            SlotState::Lost | SlotState::Failed => {
                if matches!(from, SlotState::LaunchPending | SlotState::Staging) {
                    info!(
                        slot_id,
                        %task_id,
                        %to,
                        reason,
                        "launch did not succeed; will retry on next offer cycle"
                    );
                } else if from == SlotState::Killing {
                    info!(slot_id, %task_id, "kill confirmed");
                } else {
                    warn!(slot_id, %task_id, %to, reason, "executor terminated");
                }
                self.release_slot(slot_id, task_id).await;
                self.maybe_revive();
            }
            _ => {}
        }
    }

    /// Clean up after a terminal binding and free the slot for relaunch.
    async fn release_slot(&mut self, slot_id: SlotId, task_id: &TaskId) {
        self.launch_deadlines.remove(&slot_id);
        self.pending_expiries.remove(&slot_id);
        self.pending_kills.remove(task_id);
        self.health.stop_monitor(slot_id).await;
        if let Err(e) = self.registry.retire(slot_id) {
            self.store_failure(&e);
        }
    }

    // ── Sweeps ─────────────────────────────────────────────────────

    fn start_sweep(&mut self) -> u64 {
        self.next_sweep += 1;
        let sweep = self.next_sweep;
        let known = self.registry.bound_tasks();

        self.in_flight.insert(sweep, known.iter().cloned().collect());
        while self.in_flight.len() > MAX_IN_FLIGHT_SWEEPS {
            self.in_flight.pop_first();
        }

        info!(sweep, known = known.len(), "reconciliation sweep requested");
        self.rm.reconcile(sweep, known);
        sweep
    }

    async fn on_snapshot(&mut self, sweep: u64, tasks: Vec<ObservedTask>) {
        if sweep <= self.applied_sweep {
            debug!(
                sweep,
                applied = self.applied_sweep,
                "superseded cluster snapshot discarded"
            );
            return;
        }
        let Some(captured) = self.in_flight.remove(&sweep) else {
            debug!(sweep, "cluster snapshot for unknown sweep discarded");
            return;
        };
        self.in_flight.retain(|s, _| *s > sweep);
        self.applied_sweep = sweep;

        let observed: HashMap<&TaskId, TaskState> =
            tasks.iter().map(|t| (&t.task_id, t.state)).collect();

        // Bindings the cluster has forgotten.
        let mut lost = 0;
        for task_id in &captured {
            let Some(slot) = self.registry.find_task(task_id) else {
                continue;
            };
            let (slot_id, generation) = (slot.slot_id, slot.generation);
            let gone = observed.get(task_id).is_none_or(|s| s.is_terminal());
            if gone && self.lose_slot(slot_id, generation, task_id).await {
                lost += 1;
            }
        }

        // Everything the cluster reports.
        let mut orphans = 0;
        for task in &tasks {
            if self.registry.find_task(&task.task_id).is_some() {
                self.apply_observed(&task.task_id, task.state, None).await;
            } else if task.state.is_terminal() {
                self.pending_kills.remove(&task.task_id);
            } else {
                orphans += 1;
                warn!(
                    task_id = %task.task_id,
                    state = ?task.state,
                    "orphan task in cluster snapshot; killing"
                );
                self.ensure_kill(&task.task_id);
            }
        }

        // Kills the cluster no longer reports have completed.
        self.pending_kills
            .retain(|task_id, _| observed.get(task_id).is_some_and(|s| !s.is_terminal()));

        if self.resume_sweep.is_some_and(|s| sweep >= s) {
            self.resume_sweep = None;
            info!(sweep, "reconciliation after reconnection complete; launches resumed");
            self.flush_kills();
        }

        info!(
            sweep,
            reported = tasks.len(),
            lost,
            orphans,
            deficit = self.registry.deficit(self.desired.get().count),
            "reconciliation sweep applied"
        );
        self.maybe_revive();
    }

    /// Declare a captured binding lost and free its slot.
    async fn lose_slot(
        &mut self,
        slot_id: SlotId,
        generation: Generation,
        task_id: &TaskId,
    ) -> bool {
        match self.registry.mark_lost(slot_id, generation) {
            Ok(Some(_)) => {
                warn!(slot_id, generation, %task_id, "executor missing from cluster; marking lost");
                self.release_slot(slot_id, task_id).await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.store_failure(&e);
                false
            }
        }
    }

    fn maybe_revive(&mut self) {
        let deficit = self.registry.deficit(self.desired.get().count);
        if deficit > 0 && !self.revive_requested && self.launch_allowed() {
            info!(deficit, "requesting offers");
            self.revive_requested = true;
            self.rm.revive();
        }
    }

    // ── Kills ──────────────────────────────────────────────────────

    /// Kill `task_id` unless a kill is already in flight inside the retry window.
    fn ensure_kill(&mut self, task_id: &TaskId) {
        let now = Instant::now();
        if let Some(Some(issued)) = self.pending_kills.get(task_id) {
            if now.duration_since(*issued) < self.timing.kill_retry {
                debug!(%task_id, "kill already in flight");
                return;
            }
        }
        if self.kills_allowed() {
            self.issue_kill(task_id, now);
        } else {
            info!(%task_id, "kill queued until reconnection");
            self.pending_kills.insert(task_id.clone(), None);
        }
    }

    fn issue_kill(&mut self, task_id: &TaskId, now: Instant) {
        debug!(%task_id, "issuing kill");
        self.pending_kills.insert(task_id.clone(), Some(now));
        self.kills_total += 1;
        self.rm.kill(task_id);
    }

    fn flush_kills(&mut self) {
        let queued: Vec<TaskId> = self
            .pending_kills
            .iter()
            .filter(|(_, issued)| issued.is_none())
            .map(|(task_id, _)| task_id.clone())
            .collect();
        if !queued.is_empty() {
            info!(kills = queued.len(), "sending queued kills");
        }
        let now = Instant::now();
        for task_id in queued {
            self.issue_kill(&task_id, now);
        }
    }

    // ── Health ─────────────────────────────────────────────────────

    async fn start_monitor(&self, slot: &ExecutorSlot) {
        let (Some(task_id), Some(endpoint)) = (&slot.task_id, &slot.endpoint) else {
            return;
        };
        self.health
            .start_monitor(ProbeTarget {
                slot_id: slot.slot_id,
                generation: slot.generation,
                task_id: task_id.clone(),
                hostname: endpoint.hostname.clone(),
                port: endpoint.ports.client,
            })
            .await;
    }

    async fn on_health(&mut self, signal: HealthSignal) {
        let (slot_id, generation) = (signal.slot_id(), signal.generation());
        match signal {
            HealthSignal::Ack { at_ms, .. } => {
                self.registry.record_health_ack(slot_id, generation, at_ms);
            }
            HealthSignal::Expired {
                task_id,
                silent_for,
                ..
            } => {
                let live = self.registry.slot(slot_id).is_some_and(|s| {
                    s.generation == generation
                        && matches!(s.state, SlotState::Running | SlotState::Unhealthy)
                });
                if !live {
                    debug!(slot_id, generation, "health expiry for stale binding ignored");
                    return;
                }
                warn!(slot_id, generation, %task_id, ?silent_for, "executor unhealthy; killing");
                self.health.stop_monitor(slot_id).await;
                self.kill_unhealthy(slot_id, generation);
            }
        }
    }

    /// `RUNNING → UNHEALTHY → KILLING`, then kill the task. If either step
    /// cannot be written the expiry is kept and retried on the next tick.
    fn kill_unhealthy(&mut self, slot_id: SlotId, generation: Generation) {
        let marked = self
            .registry
            .mark_unhealthy(slot_id, generation)
            .and_then(|_| self.registry.mark_killing(slot_id, generation));
        match marked {
            Ok(task_id) => {
                self.pending_expiries.remove(&slot_id);
                if let Some(task_id) = task_id {
                    self.ensure_kill(&task_id);
                }
            }
            Err(e) => {
                self.store_failure(&e);
                self.pending_expiries.insert(slot_id, generation);
            }
        }
    }

    /// Finish kills that a store failure interrupted.
    fn retry_expiries(&mut self) {
        let mut retry: Vec<(SlotId, Generation)> =
            self.pending_expiries.iter().map(|(s, g)| (*s, *g)).collect();
        retry.extend(
            self.registry
                .snapshot()
                .into_iter()
                .filter(|s| s.state == SlotState::Unhealthy)
                .map(|s| (s.slot_id, s.generation)),
        );
        retry.sort_unstable();
        retry.dedup();

        for (slot_id, generation) in retry {
            if !self.store_healthy {
                break;
            }
            info!(slot_id, generation, "retrying kill of unhealthy executor");
            self.kill_unhealthy(slot_id, generation);
        }
    }

    // ── Timer ──────────────────────────────────────────────────────

    async fn on_tick(&mut self) {
        let now = Instant::now();

        if !self.store_healthy {
            match self.registry.check_store() {
                Ok(()) => {
                    info!("state store writable again; launches unblocked");
                    self.store_healthy = true;
                }
                Err(e) => error!(error = %e, "state store still unavailable"),
            }
        }

        if self.store_healthy {
            if let Err(e) = self.registry.flush_health_acks() {
                self.store_failure(&e);
            }
            self.retry_expiries();
        }

        let count = self.desired.get().count;
        if self.registry.len() as u32 != count {
            self.apply_resize(count).await;
        }

        if self.connected {
            self.expire_launches(now).await;

            if self.kills_allowed() {
                let retry: Vec<TaskId> = self
                    .pending_kills
                    .iter()
                    .filter(|(_, issued)| {
                        issued.is_none_or(|at| now.duration_since(at) >= self.timing.kill_retry)
                    })
                    .map(|(task_id, _)| task_id.clone())
                    .collect();
                for task_id in retry {
                    debug!(%task_id, "retrying kill");
                    self.issue_kill(&task_id, now);
                }
            }

            self.start_sweep();
        }
    }

    async fn expire_launches(&mut self, now: Instant) {
        let expired: Vec<(SlotId, Generation)> = self
            .launch_deadlines
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(slot_id, (generation, _))| (*slot_id, *generation))
            .collect();

        for (slot_id, generation) in expired {
            self.launch_deadlines.remove(&slot_id);
            match self.registry.revert_launch(slot_id, generation) {
                Ok(Some(task_id)) => {
                    info!(
                        slot_id,
                        generation,
                        %task_id,
                        "launch not acknowledged in time; abandoning"
                    );
                    self.ensure_kill(&task_id);
                }
                Ok(None) => {}
                Err(e) => self.store_failure(&e),
            }
        }
    }

    // ── Reconfiguration ────────────────────────────────────────────

    async fn reconfigure(&mut self, spec: DesiredSpec) -> SchedulerResult<()> {
        if !self.desired.reconfigure(spec)? {
            return Ok(());
        }
        let count = self.desired.get().count;
        self.apply_resize(count).await;
        self.revive_requested = false;
        if self.connected {
            self.start_sweep();
        }
        Ok(())
    }

    async fn apply_resize(&mut self, count: u32) {
        let removed = match self.registry.resize(count) {
            Ok(removed) => removed,
            Err(e) => {
                self.store_failure(&e);
                return;
            }
        };
        for slot in removed {
            self.health.stop_monitor(slot.slot_id).await;
            self.launch_deadlines.remove(&slot.slot_id);
            if let Some(task_id) = slot.task_id.filter(|_| slot.state.has_live_task()) {
                info!(slot_id = slot.slot_id, %task_id, "slot removed; killing its executor");
                self.ensure_kill(&task_id);
            }
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn store_failure(&mut self, e: &SchedulerError) {
        error!(error = %e, "state store write failed; launches blocked until it recovers");
        self.store_healthy = false;
    }

    fn publish(&self) {
        let snapshot = SchedulerSnapshot {
            framework: self.identity.clone(),
            desired: self.desired.get().clone(),
            slots: self.registry.snapshot(),
            connected: self.connected,
            launch_allowed: self.launch_allowed(),
            store_healthy: self.store_healthy,
            last_sweep: self.applied_sweep,
            pending_kills: self.pending_kills.len(),
            launches_total: self.launches_total,
            kills_total: self.kills_total,
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

fn health_callback(events: EventSender) -> HealthCallback {
    Arc::new(move |signal| {
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(SchedulerEvent::Health(signal));
        }) as BoxFuture<()>
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use keel_core::KeelConfig;
    use keel_health::ProbeResult;
    use keel_placement::PortRange;

    use crate::events::event_channel;
    use crate::resource_manager::LaunchRequest;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Launch(TaskId),
        Kill(TaskId),
        Decline(String),
        Reconcile(u64, Vec<TaskId>),
        Revive,
    }

    #[derive(Default)]
    struct RecordingRm {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingRm {
        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    impl ResourceManager for RecordingRm {
        fn launch(&self, request: LaunchRequest) {
            self.calls.lock().unwrap().push(Call::Launch(request.task_id));
        }
        fn kill(&self, task_id: &TaskId) {
            self.calls.lock().unwrap().push(Call::Kill(task_id.clone()));
        }
        fn decline(&self, offer_id: &str) {
            self.calls.lock().unwrap().push(Call::Decline(offer_id.to_string()));
        }
        fn reconcile(&self, sweep: u64, mut known: Vec<TaskId>) {
            known.sort();
            self.calls.lock().unwrap().push(Call::Reconcile(sweep, known));
        }
        fn revive(&self) {
            self.calls.lock().unwrap().push(Call::Revive);
        }
    }

    struct AlwaysHealthy;

    impl Prober for AlwaysHealthy {
        fn probe(&self, _target: &ProbeTarget) -> BoxFuture<ProbeResult> {
            Box::pin(async { ProbeResult::Healthy })
        }
    }

    fn settings(count: u32) -> SchedulerSettings {
        let toml_str = format!(
            r#"
[framework]
name = "keel"

[executors]
desired_count = {count}
cpu_per_executor = 0.5
mem_per_executor = 256

[health]
health_delay_seconds = 5
health_timeout_seconds = 5
probe_interval_seconds = 1

[reconciliation]
sweep_interval_seconds = 60
launch_timeout_seconds = 30
kill_retry_seconds = 10
"#
        );
        KeelConfig::from_toml_str(&toml_str)
            .unwrap()
            .resolve()
            .unwrap()
    }

    async fn coordinator_on(
        store: StateStore,
        count: u32,
    ) -> (ReconciliationCoordinator, Arc<RecordingRm>, EventReceiver) {
        let rm = Arc::new(RecordingRm::default());
        let (tx, rx) = event_channel();
        let coordinator = ReconciliationCoordinator::bootstrap(
            &settings(count),
            store,
            rm.clone(),
            Arc::new(AlwaysHealthy),
            tx,
            false,
        )
        .await
        .unwrap();
        (coordinator, rm, rx)
    }

    async fn coordinator(
        count: u32,
    ) -> (ReconciliationCoordinator, Arc<RecordingRm>, EventReceiver) {
        coordinator_on(StateStore::open_in_memory().unwrap(), count).await
    }

    fn offer(id: &str) -> Offer {
        Offer {
            offer_id: id.to_string(),
            agent_id: format!("agent-{id}"),
            hostname: format!("host-{id}"),
            cpus: 1.0,
            mem_mb: 1024,
            ports: vec![PortRange::new(31000, 31001)],
        }
    }

    fn offers(n: usize) -> SchedulerEvent {
        SchedulerEvent::Offers((0..n).map(|i| offer(&format!("o{i}"))).collect())
    }

    fn snapshot(sweep: u64, tasks: &[(&TaskId, TaskState)]) -> SchedulerEvent {
        SchedulerEvent::ClusterSnapshot {
            sweep,
            tasks: tasks
                .iter()
                .map(|(task_id, state)| ObservedTask {
                    task_id: (*task_id).clone(),
                    state: *state,
                })
                .collect(),
        }
    }

    fn status(task_id: &TaskId, state: TaskState) -> SchedulerEvent {
        SchedulerEvent::StatusUpdate(TaskStatusUpdate {
            task_id: task_id.clone(),
            state,
            timestamp: 0,
            reason: None,
        })
    }

    fn launched(calls: &[Call]) -> Vec<TaskId> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::Launch(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Connect, apply the resume sweep, and launch `count` executors to RUNNING.
    async fn converge(
        coordinator: &mut ReconciliationCoordinator,
        rm: &RecordingRm,
        count: usize,
    ) -> Vec<TaskId> {
        coordinator.handle(SchedulerEvent::Connected).await;
        let sweep = coordinator.next_sweep;
        coordinator.handle(snapshot(sweep, &[])).await;
        coordinator.handle(offers(count)).await;
        let tasks = launched(&rm.take());
        for task in &tasks {
            coordinator.handle(status(task, TaskState::Running)).await;
        }
        tasks
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_sweeps_before_launching() {
        let (mut c, rm, _rx) = coordinator(3).await;

        c.handle(SchedulerEvent::Connected).await;
        assert_eq!(rm.take(), vec![Call::Reconcile(1, vec![])]);

        // Offers before the resume sweep completes are declined.
        c.handle(offers(1)).await;
        assert_eq!(rm.take(), vec![Call::Decline("o0".to_string())]);

        c.handle(snapshot(1, &[])).await;
        assert_eq!(rm.take(), vec![Call::Revive]);

        c.handle(offers(4)).await;
        let calls = rm.take();
        assert_eq!(launched(&calls).len(), 3);
        assert!(calls.contains(&Call::Decline("o3".to_string())));
        assert_eq!(c.registry().count_in(&[SlotState::LaunchPending]), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn converges_to_running() {
        let (mut c, rm, _rx) = coordinator(3).await;
        let tasks = converge(&mut c, &rm, 3).await;
        assert_eq!(tasks.len(), 3);
        assert_eq!(c.registry().count_in(&[SlotState::Running]), 3);
        assert_eq!(c.subscribe().borrow().running_count(), 3);
        assert_eq!(c.subscribe().borrow().deficit(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_frees_slot_and_requests_offers() {
        let (mut c, rm, _rx) = coordinator(2).await;
        let tasks = converge(&mut c, &rm, 2).await;

        c.handle(status(&tasks[0], TaskState::Failed)).await;
        let slot = c.registry().slot(tasks[0].binding().unwrap().0).unwrap();
        assert_eq!(slot.state, SlotState::Empty);
        assert_eq!(rm.take(), vec![Call::Revive]);

        c.handle(offers(1)).await;
        let relaunched = launched(&rm.take());
        assert_eq!(relaunched.len(), 1);
        assert_eq!(relaunched[0].binding().unwrap().1, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_status_is_discarded() {
        let (mut c, rm, _rx) = coordinator(1).await;
        let first = converge(&mut c, &rm, 1).await;
        c.handle(status(&first[0], TaskState::Lost)).await;
        rm.take();
        c.handle(offers(1)).await;
        let second = launched(&rm.take());
        c.handle(status(&second[0], TaskState::Running)).await;

        let before = c.registry().snapshot();
        c.handle(status(&first[0], TaskState::Running)).await;
        c.handle(status(&first[0], TaskState::Failed)).await;
        assert_eq!(c.registry().snapshot(), before);
        assert!(rm.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_marks_missing_tasks_lost() {
        let (mut c, rm, _rx) = coordinator(2).await;
        let tasks = converge(&mut c, &rm, 2).await;

        c.handle(SchedulerEvent::ReconcileNow).await;
        let sweep = c.next_sweep;
        rm.take();

        c.handle(snapshot(sweep, &[(&tasks[1], TaskState::Running)])).await;
        let lost_slot = tasks[0].binding().unwrap().0;
        assert_eq!(c.registry().slot(lost_slot).unwrap().state, SlotState::Empty);
        assert_eq!(c.registry().count_in(&[SlotState::Running]), 1);
        assert_eq!(rm.take(), vec![Call::Revive]);
    }

    #[tokio::test(start_paused = true)]
    async fn binding_made_after_sweep_request_is_not_lost() {
        let (mut c, rm, _rx) = coordinator(1).await;
        c.handle(SchedulerEvent::Connected).await;
        c.handle(snapshot(1, &[])).await;

        c.handle(SchedulerEvent::ReconcileNow).await;
        c.handle(offers(1)).await;
        rm.take();

        // Sweep 2 was requested before the launch; its answer cannot know the task.
        c.handle(snapshot(2, &[])).await;
        assert_eq!(c.registry().count_in(&[SlotState::LaunchPending]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn orphans_are_killed_once_per_retry_window() {
        let (mut c, rm, _rx) = coordinator(0).await;
        c.handle(SchedulerEvent::Connected).await;
        rm.take();
        let orphan = TaskId::new("keel-previous.0.3");
        c.handle(snapshot(1, &[(&orphan, TaskState::Running)])).await;
        assert_eq!(rm.take(), vec![Call::Kill(orphan.clone())]);

        // Second sweep with no intervening events: nothing new.
        c.handle(SchedulerEvent::ReconcileNow).await;
        c.handle(snapshot(2, &[(&orphan, TaskState::Running)])).await;
        assert_eq!(rm.take(), vec![Call::Reconcile(2, vec![])]);

        tokio::time::advance(Duration::from_secs(11)).await;
        c.handle(SchedulerEvent::ReconcileNow).await;
        c.handle(snapshot(3, &[(&orphan, TaskState::Running)])).await;
        assert_eq!(
            rm.take(),
            vec![Call::Reconcile(3, vec![]), Call::Kill(orphan.clone())]
        );

        c.handle(status(&orphan, TaskState::Killed)).await;
        assert_eq!(c.subscribe().borrow().pending_kills, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_is_idempotent() {
        let (mut c, rm, _rx) = coordinator(2).await;
        let tasks = converge(&mut c, &rm, 2).await;
        let observed = [(&tasks[0], TaskState::Running), (&tasks[1], TaskState::Running)];

        c.handle(SchedulerEvent::ReconcileNow).await;
        c.handle(snapshot(c.next_sweep, &observed)).await;
        let after_first = c.registry().snapshot();
        rm.take();

        c.handle(SchedulerEvent::ReconcileNow).await;
        c.handle(snapshot(c.next_sweep, &observed)).await;
        let calls = rm.take();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::Reconcile(..)));
        assert_eq!(c.registry().snapshot(), after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_snapshot_is_discarded() {
        let (mut c, rm, _rx) = coordinator(1).await;
        let tasks = converge(&mut c, &rm, 1).await;

        c.handle(SchedulerEvent::ReconcileNow).await;
        let older = c.next_sweep;
        c.handle(SchedulerEvent::ReconcileNow).await;
        let newer = c.next_sweep;

        c.handle(snapshot(newer, &[(&tasks[0], TaskState::Running)])).await;
        // The older answer claims the task is gone; it must not be applied.
        c.handle(snapshot(older, &[])).await;
        assert_eq!(c.registry().count_in(&[SlotState::Running]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnection_suspends_launches_and_queues_kills() {
        let (mut c, rm, _rx) = coordinator(1).await;
        let tasks = converge(&mut c, &rm, 1).await;
        let (slot_id, generation) = tasks[0].binding().unwrap();

        c.handle(SchedulerEvent::Disconnected).await;
        c.handle(SchedulerEvent::Health(HealthSignal::Expired {
            slot_id,
            generation,
            task_id: tasks[0].clone(),
            silent_for: Duration::from_secs(11),
        }))
        .await;
        assert_eq!(c.registry().slot(slot_id).unwrap().state, SlotState::Killing);
        assert!(rm.take().is_empty());

        c.handle(offers(1)).await;
        assert_eq!(rm.take(), vec![Call::Decline("o0".to_string())]);

        c.handle(SchedulerEvent::Reregistered).await;
        let sweep = c.next_sweep;
        assert_eq!(rm.take(), vec![Call::Reconcile(sweep, vec![tasks[0].clone()])]);

        c.handle(snapshot(sweep, &[(&tasks[0], TaskState::Running)])).await;
        let calls = rm.take();
        assert!(calls.contains(&Call::Kill(tasks[0].clone())));
        assert!(c.launch_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn health_expiry_kills_then_relaunches() {
        let (mut c, rm, _rx) = coordinator(1).await;
        let tasks = converge(&mut c, &rm, 1).await;
        let (slot_id, generation) = tasks[0].binding().unwrap();

        c.handle(SchedulerEvent::Health(HealthSignal::Expired {
            slot_id,
            generation,
            task_id: tasks[0].clone(),
            silent_for: Duration::from_secs(11),
        }))
        .await;
        assert_eq!(rm.take(), vec![Call::Kill(tasks[0].clone())]);
        assert_eq!(c.registry().slot(slot_id).unwrap().state, SlotState::Killing);

        c.handle(status(&tasks[0], TaskState::Killed)).await;
        assert_eq!(c.registry().slot(slot_id).unwrap().state, SlotState::Empty);
        assert_eq!(rm.take(), vec![Call::Revive]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_health_expiry_is_ignored() {
        let (mut c, rm, _rx) = coordinator(1).await;
        let tasks = converge(&mut c, &rm, 1).await;
        let (slot_id, generation) = tasks[0].binding().unwrap();

        c.handle(SchedulerEvent::Health(HealthSignal::Expired {
            slot_id,
            generation: generation + 5,
            task_id: tasks[0].clone(),
            silent_for: Duration::from_secs(11),
        }))
        .await;
        assert_eq!(c.registry().slot(slot_id).unwrap().state, SlotState::Running);
        assert!(rm.take().is_empty());
    }

    fn expired(task_id: &TaskId) -> SchedulerEvent {
        let (slot_id, generation) = task_id.binding().unwrap();
        SchedulerEvent::Health(HealthSignal::Expired {
            slot_id,
            generation,
            task_id: task_id.clone(),
            silent_for: Duration::from_secs(11),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_survives_store_write_failure() {
        let store = StateStore::open_in_memory().unwrap();
        let (mut c, rm, _rx) = coordinator_on(store.clone(), 1).await;
        let tasks = converge(&mut c, &rm, 1).await;
        let slot_id = tasks[0].binding().unwrap().0;

        store.set_write_fault(true);
        c.handle(expired(&tasks[0])).await;
        assert_eq!(c.registry().slot(slot_id).unwrap().state, SlotState::Running);
        assert!(!c.subscribe().borrow().store_healthy);
        assert!(rm.take().is_empty());

        // Still failing: nothing moves.
        c.handle(SchedulerEvent::SweepTick).await;
        assert_eq!(c.registry().slot(slot_id).unwrap().state, SlotState::Running);
        assert!(!rm.take().contains(&Call::Kill(tasks[0].clone())));

        store.set_write_fault(false);
        c.handle(SchedulerEvent::SweepTick).await;
        assert_eq!(c.registry().slot(slot_id).unwrap().state, SlotState::Killing);
        assert!(rm.take().contains(&Call::Kill(tasks[0].clone())));

        c.handle(status(&tasks[0], TaskState::Killed)).await;
        assert_eq!(c.registry().slot(slot_id).unwrap().state, SlotState::Empty);
        assert!(c.subscribe().borrow().store_healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_slot_is_killed_on_tick() {
        let (mut c, rm, _rx) = coordinator(1).await;
        let tasks = converge(&mut c, &rm, 1).await;
        let (slot_id, generation) = tasks[0].binding().unwrap();

        // The kill step never ran, e.g. the write after UNHEALTHY failed.
        c.registry.mark_unhealthy(slot_id, generation).unwrap();

        c.handle(SchedulerEvent::SweepTick).await;
        assert_eq!(c.registry().slot(slot_id).unwrap().state, SlotState::Killing);
        assert!(rm.take().contains(&Call::Kill(tasks[0].clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn store_write_failure_blocks_launches_until_ping_succeeds() {
        let store = StateStore::open_in_memory().unwrap();
        let (mut c, rm, _rx) = coordinator_on(store.clone(), 1).await;
        c.handle(SchedulerEvent::Connected).await;
        c.handle(snapshot(1, &[])).await;
        rm.take();

        store.set_write_fault(true);
        c.handle(offers(1)).await;
        assert!(launched(&rm.take()).is_empty());
        assert!(!c.launch_allowed());
        assert_eq!(c.registry().count_in(&[SlotState::Empty]), 1);

        c.handle(offers(1)).await;
        assert_eq!(rm.take(), vec![Call::Decline("o0".to_string())]);

        // The ping itself writes, so a tick cannot unblock launches yet.
        c.handle(SchedulerEvent::SweepTick).await;
        assert!(!c.launch_allowed());
        rm.take();

        store.set_write_fault(false);
        c.handle(SchedulerEvent::SweepTick).await;
        assert!(c.launch_allowed());
        rm.take();

        c.handle(offers(1)).await;
        assert_eq!(launched(&rm.take()).len(), 1);
        assert_eq!(c.registry().count_in(&[SlotState::LaunchPending]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn health_acks_reach_the_store_on_tick() {
        let store = StateStore::open_in_memory().unwrap();
        let (mut c, rm, _rx) = coordinator_on(store.clone(), 1).await;
        let tasks = converge(&mut c, &rm, 1).await;
        let (slot_id, generation) = tasks[0].binding().unwrap();

        c.handle(SchedulerEvent::Health(HealthSignal::Ack {
            slot_id,
            generation,
            task_id: tasks[0].clone(),
            at_ms: 1234,
        }))
        .await;
        assert_eq!(c.registry().slot(slot_id).unwrap().last_health_ack, Some(1234));
        assert_eq!(store.get_slot(slot_id).unwrap().unwrap().last_health_ack, None);

        c.handle(SchedulerEvent::SweepTick).await;
        assert_eq!(
            store.get_slot(slot_id).unwrap().unwrap().last_health_ack,
            Some(1234)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_launch_times_out() {
        let (mut c, rm, _rx) = coordinator(1).await;
        c.handle(SchedulerEvent::Connected).await;
        c.handle(snapshot(1, &[])).await;
        c.handle(offers(1)).await;
        let task = launched(&rm.take()).remove(0);

        tokio::time::advance(Duration::from_secs(31)).await;
        c.handle(SchedulerEvent::SweepTick).await;

        assert_eq!(c.registry().slot(0).unwrap().state, SlotState::Empty);
        let calls = rm.take();
        assert!(calls.contains(&Call::Kill(task)));
        assert!(calls.iter().any(|c| matches!(c, Call::Reconcile(..))));
    }

    #[tokio::test(start_paused = true)]
    async fn shrinking_kills_highest_slots() {
        let (mut c, rm, _rx) = coordinator(3).await;
        let tasks = converge(&mut c, &rm, 3).await;
        let highest = tasks
            .iter()
            .find(|t| t.binding().unwrap().0 == 2)
            .unwrap()
            .clone();

        let mut spec = c.desired().clone();
        spec.count = 2;
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        c.handle(SchedulerEvent::Reconfigure {
            spec,
            reply: Some(reply_tx),
        })
        .await;
        reply_rx.await.unwrap().unwrap();

        assert_eq!(c.registry().len(), 2);
        let calls = rm.take();
        assert!(calls.contains(&Call::Kill(highest)));
        assert!(calls.iter().any(|c| matches!(c, Call::Reconcile(..))));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_reconfigure_is_rejected() {
        let (mut c, _rm, _rx) = coordinator(1).await;
        let mut spec = c.desired().clone();
        spec.resources.mem_mb = 0;
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        c.handle(SchedulerEvent::Reconfigure {
            spec,
            reply: Some(reply_tx),
        })
        .await;
        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(SchedulerError::InvalidSpec(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_keeps_bindings_and_restarts_monitors() {
        let store = StateStore::open_in_memory().unwrap();
        let tasks = {
            let (mut c, rm, _rx) = coordinator_on(store.clone(), 2).await;
            converge(&mut c, &rm, 2).await
        };

        let (mut c, rm, _rx) = coordinator_on(store, 2).await;
        assert_eq!(c.registry().count_in(&[SlotState::Running]), 2);
        assert_eq!(c.health.active_monitors().await, vec![0, 1]);

        c.handle(SchedulerEvent::Connected).await;
        let mut known = tasks.clone();
        known.sort();
        assert_eq!(rm.take(), vec![Call::Reconcile(1, known)]);

        c.handle(snapshot(
            1,
            &[(&tasks[0], TaskState::Running), (&tasks[1], TaskState::Running)],
        ))
        .await;
        assert!(rm.take().is_empty());
        assert_eq!(c.registry().count_in(&[SlotState::Running]), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn same_framework_identity_across_restarts() {
        let store = StateStore::open_in_memory().unwrap();
        let first = coordinator_on(store.clone(), 1).await.0.identity().clone();
        let second = coordinator_on(store, 1).await.0.identity().clone();
        assert_eq!(first, second);
        assert_eq!(first.framework_id.len(), 32);
    }
}

//! ExecutorRegistry — the single source of truth for slot state.
//!
//! Every state mutation follows the same pattern: build the next version of
//! the slot, write it to the store, and only then swap it into memory. A
//! failed write therefore leaves the registry exactly as it was.
//!
//! Health acknowledgments are the exception. They change no state, arrive
//! once per health-check interval per executor, and are never trusted after a
//! restart, so they are kept in memory and written in one batch by
//! [`ExecutorRegistry::flush_health_acks`].

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use keel_state::{
    Endpoint, ExecutorSlot, Generation, PersistedState, SlotId, SlotState, StateStore, TaskId,
    TaskState, epoch_millis,
};

use crate::error::{SchedulerError, SchedulerResult};

/// What applying a status update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// No slot has ever held this task.
    Unknown,
    /// The task belongs to an earlier binding of its slot.
    Stale,
    /// The update does not move the slot forward.
    Ignored,
    Transitioned {
        slot_id: SlotId,
        from: SlotState,
        to: SlotState,
    },
}

pub struct ExecutorRegistry {
    store: StateStore,
    /// Indexed by slot id.
    slots: Vec<ExecutorSlot>,
    tasks: HashMap<TaskId, SlotId>,
    /// New slots start here so a regrown slot never re-mints a task id.
    generation_floor: Generation,
    /// Slots whose latest health ack is not yet in the store.
    unsynced_acks: HashSet<SlotId>,
}

impl ExecutorRegistry {
    #[cfg(test)]
    pub(crate) fn load(store: StateStore) -> SchedulerResult<Self> {
        let persisted = store.load()?;
        Self::restore(store, persisted)
    }

    /// Rebuild the registry from what was read back at startup.
    ///
    /// Gaps in the persisted slot ids are filled with empty slots, and slots
    /// left in a terminal state by a crash are retired.
    pub fn restore(store: StateStore, persisted: PersistedState) -> SchedulerResult<Self> {
        let generation_floor = persisted.generation_floor;
        let persisted = persisted.slots;
        let len = persisted
            .iter()
            .map(|s| s.slot_id as usize + 1)
            .max()
            .unwrap_or(0);

        let mut slots: Vec<ExecutorSlot> = (0..len as SlotId)
            .map(|slot_id| fresh_slot(slot_id, generation_floor))
            .collect();
        let mut repaired = Vec::new();
        for slot in persisted {
            let idx = slot.slot_id as usize;
            slots[idx] = slot;
        }
        for slot in &mut slots {
            if slot.state.is_terminal() || (slot.state.has_live_task() && slot.task_id.is_none()) {
                debug!(slot_id = slot.slot_id, state = %slot.state, "retiring slot on load");
                retire_in_place(slot);
                repaired.push(slot.clone());
            }
        }
        if !repaired.is_empty() {
            store.put_slots(&repaired)?;
        }

        let mut tasks = HashMap::new();
        for slot in &slots {
            if let Some(task_id) = &slot.task_id {
                if let Some(other) = tasks.insert(task_id.clone(), slot.slot_id) {
                    warn!(
                        %task_id,
                        slot_id = slot.slot_id,
                        other,
                        "task bound to two slots in store"
                    );
                }
            }
        }

        info!(
            slots = slots.len(),
            bound = tasks.len(),
            "executor registry loaded"
        );
        Ok(Self {
            store,
            slots,
            tasks,
            generation_floor,
            unsynced_acks: HashSet::new(),
        })
    }

    /// Ping the backing store.
    pub fn check_store(&self) -> SchedulerResult<()> {
        Ok(self.store.ping()?)
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All slots in slot-id order.
    pub fn snapshot(&self) -> Vec<ExecutorSlot> {
        self.slots.clone()
    }

    pub fn slot(&self, slot_id: SlotId) -> Option<&ExecutorSlot> {
        self.slots.get(slot_id as usize)
    }

    /// The slot currently bound to `task_id`.
    pub fn find_task(&self, task_id: &TaskId) -> Option<&ExecutorSlot> {
        self.tasks
            .get(task_id)
            .and_then(|slot_id| self.slot(*slot_id))
    }

    pub fn count_in(&self, states: &[SlotState]) -> u32 {
        self.slots
            .iter()
            .filter(|s| states.contains(&s.state))
            .count() as u32
    }

    /// Slots counting toward the desired count.
    pub fn alive_count(&self) -> u32 {
        self.slots.iter().filter(|s| s.state.is_alive()).count() as u32
    }

    /// How many executors are missing to reach `desired`.
    pub fn deficit(&self, desired: u32) -> u32 {
        desired.saturating_sub(self.alive_count())
    }

    /// Unbound slot ids in ascending order.
    pub fn empty_slots(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Empty)
            .map(|s| s.slot_id)
            .collect()
    }

    /// Task ids bound to slots whose task is not yet confirmed gone.
    pub fn bound_tasks(&self) -> Vec<TaskId> {
        self.slots
            .iter()
            .filter(|s| s.state.has_live_task())
            .filter_map(|s| s.task_id.clone())
            .collect()
    }

    /// Generation the next bind of `slot_id` will receive.
    pub fn next_generation(&self, slot_id: SlotId) -> Option<Generation> {
        self.slot(slot_id).map(|s| s.generation + 1)
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Bind a new task to an empty slot (`EMPTY → LAUNCH_PENDING`).
    pub fn bind(
        &mut self,
        slot_id: SlotId,
        task_id: TaskId,
        endpoint: Endpoint,
    ) -> SchedulerResult<Generation> {
        let slot = self
            .slot(slot_id)
            .ok_or(SchedulerError::SlotNotFound(slot_id))?;
        if slot.state != SlotState::Empty {
            return Err(SchedulerError::SlotOccupied {
                slot_id,
                state: slot.state,
            });
        }
        if self.tasks.contains_key(&task_id) {
            return Err(SchedulerError::DuplicateTask(task_id));
        }

        let mut next = slot.clone();
        next.generation += 1;
        next.task_id = Some(task_id.clone());
        next.state = SlotState::LaunchPending;
        next.endpoint = Some(endpoint);
        next.last_health_ack = None;
        let generation = next.generation;
        self.commit(next)?;

        debug!(slot_id, generation, %task_id, "slot bound");
        Ok(generation)
    }

    /// Apply a resource-manager status update for the binding `generation`.
    pub fn apply_status(
        &mut self,
        task_id: &TaskId,
        status: TaskState,
        generation: Generation,
    ) -> SchedulerResult<StatusOutcome> {
        let Some(slot) = self.find_task(task_id) else {
            return Ok(self.classify_unbound(task_id, generation));
        };
        if !slot.holds(task_id, generation) {
            debug!(%task_id, generation, current = slot.generation, "stale status discarded");
            return Ok(StatusOutcome::Stale);
        }

        let from = slot.state;
        let Some(to) = from.on_task_state(status) else {
            debug!(%task_id, slot_id = slot.slot_id, state = %from, ?status, "status ignored");
            return Ok(StatusOutcome::Ignored);
        };

        let slot_id = slot.slot_id;
        let mut next = slot.clone();
        next.state = to;
        self.commit(next)?;

        debug!(slot_id, %task_id, %from, %to, "slot transitioned");
        Ok(StatusOutcome::Transitioned { slot_id, from, to })
    }

    fn classify_unbound(&self, task_id: &TaskId, generation: Generation) -> StatusOutcome {
        match task_id.binding().and_then(|(slot_id, _)| self.slot(slot_id)) {
            Some(slot) if slot.generation >= generation => StatusOutcome::Stale,
            _ => StatusOutcome::Unknown,
        }
    }

    /// Record a successful health check (`RUNNING → RUNNING`). Held in memory
    /// until the next [`flush_health_acks`](Self::flush_health_acks).
    pub fn record_health_ack(
        &mut self,
        slot_id: SlotId,
        generation: Generation,
        at_ms: u64,
    ) -> bool {
        if self
            .live_binding(slot_id, generation, &[SlotState::Running])
            .is_none()
        {
            return false;
        }
        self.slots[slot_id as usize].last_health_ack = Some(at_ms);
        self.unsynced_acks.insert(slot_id);
        true
    }

    /// Write every health ack recorded since the last flush in one transaction.
    pub fn flush_health_acks(&mut self) -> SchedulerResult<usize> {
        if self.unsynced_acks.is_empty() {
            return Ok(0);
        }
        let pending: Vec<ExecutorSlot> = self
            .unsynced_acks
            .iter()
            .filter_map(|slot_id| self.slot(*slot_id).cloned())
            .collect();
        self.store.put_slots(&pending)?;
        self.unsynced_acks.clear();
        debug!(slots = pending.len(), "health acks flushed");
        Ok(pending.len())
    }

    /// `RUNNING → UNHEALTHY`.
    pub fn mark_unhealthy(
        &mut self,
        slot_id: SlotId,
        generation: Generation,
    ) -> SchedulerResult<bool> {
        self.transition(slot_id, generation, &[SlotState::Running], SlotState::Unhealthy)
            .map(|t| t.is_some())
    }

    /// Move a live binding to `KILLING`. Returns the task to kill.
    pub fn mark_killing(
        &mut self,
        slot_id: SlotId,
        generation: Generation,
    ) -> SchedulerResult<Option<TaskId>> {
        self.transition(
            slot_id,
            generation,
            &[
                SlotState::LaunchPending,
                SlotState::Staging,
                SlotState::Running,
                SlotState::Unhealthy,
            ],
            SlotState::Killing,
        )
    }

    /// Move a binding the cluster no longer knows about to `LOST`.
    pub fn mark_lost(
        &mut self,
        slot_id: SlotId,
        generation: Generation,
    ) -> SchedulerResult<Option<TaskId>> {
        self.transition(
            slot_id,
            generation,
            &[
                SlotState::LaunchPending,
                SlotState::Staging,
                SlotState::Running,
                SlotState::Unhealthy,
                SlotState::Killing,
            ],
            SlotState::Lost,
        )
    }

    /// Terminal → `EMPTY`, clearing the binding. Returns the retired task.
    pub fn retire(&mut self, slot_id: SlotId) -> SchedulerResult<Option<TaskId>> {
        let slot = self
            .slot(slot_id)
            .ok_or(SchedulerError::SlotNotFound(slot_id))?;
        if !slot.state.is_terminal() {
            return Ok(None);
        }
        let retired = slot.task_id.clone();
        let mut next = slot.clone();
        retire_in_place(&mut next);
        self.commit(next)?;
        debug!(slot_id, task_id = ?retired, "slot retired");
        Ok(retired)
    }

    /// Abandon a launch that was never acknowledged (`LAUNCH_PENDING → EMPTY`).
    /// Returns the abandoned task, which the caller must kill.
    pub fn revert_launch(
        &mut self,
        slot_id: SlotId,
        generation: Generation,
    ) -> SchedulerResult<Option<TaskId>> {
        let Some(slot) = self.live_binding(slot_id, generation, &[SlotState::LaunchPending]) else {
            return Ok(None);
        };
        let abandoned = slot.task_id.clone();
        let mut next = slot.clone();
        retire_in_place(&mut next);
        self.commit(next)?;
        Ok(abandoned)
    }

    /// Grow or shrink to `count` slots. Highest slot ids are removed first;
    /// the removed slots are returned so their tasks can be killed.
    pub fn resize(&mut self, count: u32) -> SchedulerResult<Vec<ExecutorSlot>> {
        let current = self.slots.len() as u32;
        if count > current {
            let added: Vec<ExecutorSlot> = (current..count)
                .map(|slot_id| fresh_slot(slot_id, self.generation_floor))
                .collect();
            self.store.put_slots(&added)?;
            self.slots.extend(added);
            info!(from = current, to = count, "registry grown");
            Ok(Vec::new())
        } else if count < current {
            let ids: Vec<SlotId> = (count..current).collect();
            let highest = self.slots[count as usize..]
                .iter()
                .map(|s| s.generation)
                .max()
                .unwrap_or(0);
            if highest > self.generation_floor {
                self.store.put_generation_floor(highest)?;
                self.generation_floor = highest;
            }
            self.store.delete_slots(&ids)?;
            let removed = self.slots.split_off(count as usize);
            for slot in &removed {
                self.unsynced_acks.remove(&slot.slot_id);
                if let Some(task_id) = &slot.task_id {
                    self.tasks.remove(task_id);
                }
            }
            info!(from = current, to = count, "registry shrunk");
            Ok(removed)
        } else {
            Ok(Vec::new())
        }
    }

    fn live_binding(
        &self,
        slot_id: SlotId,
        generation: Generation,
        states: &[SlotState],
    ) -> Option<&ExecutorSlot> {
        self.slot(slot_id)
            .filter(|s| s.generation == generation && s.task_id.is_some())
            .filter(|s| states.contains(&s.state))
    }

    fn transition(
        &mut self,
        slot_id: SlotId,
        generation: Generation,
        allowed: &[SlotState],
        to: SlotState,
    ) -> SchedulerResult<Option<TaskId>> {
        let Some(slot) = self.live_binding(slot_id, generation, allowed) else {
            return Ok(None);
        };
        let from = slot.state;
        let task_id = slot.task_id.clone();
        let mut next = slot.clone();
        next.state = to;
        self.commit(next)?;
        debug!(slot_id, generation, %from, %to, "slot transitioned");
        Ok(task_id)
    }

    /// Persist `next`, then make it visible.
    fn commit(&mut self, mut next: ExecutorSlot) -> SchedulerResult<()> {
        let idx = next.slot_id as usize;
        let Some(prev) = self.slots.get(idx) else {
            return Err(SchedulerError::SlotNotFound(next.slot_id));
        };
        next.updated_at = epoch_millis();
        self.store.put_slot(&next)?;
        self.unsynced_acks.remove(&next.slot_id);

        if prev.task_id != next.task_id {
            if let Some(old) = &prev.task_id {
                self.tasks.remove(old);
            }
            if let Some(new) = &next.task_id {
                self.tasks.insert(new.clone(), next.slot_id);
            }
        }
        self.slots[idx] = next;
        Ok(())
    }
}

fn fresh_slot(slot_id: SlotId, generation: Generation) -> ExecutorSlot {
    ExecutorSlot {
        generation,
        ..ExecutorSlot::empty(slot_id)
    }
}

fn retire_in_place(slot: &mut ExecutorSlot) {
    slot.state = SlotState::Empty;
    slot.task_id = None;
    slot.endpoint = None;
    slot.last_health_ack = None;
}

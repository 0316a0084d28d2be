//! Domain types for the Keel state store.
//!
//! These types represent the persisted state of the scheduler: what the
//! operator asked for (`DesiredSpec`), who we are (`FrameworkIdentity`), and
//! what each unit of capacity is bound to (`ExecutorSlot`). All types are
//! serializable to/from JSON for storage in redb tables.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Stable index of a logical capacity unit.
pub type SlotId = u32;

/// Per-slot binding counter.
pub type Generation = u64;

// ── Desired state ──────────────────────────────────────────────────

/// An ordered (client, transport) port pair required by one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub client: u16,
    pub transport: u16,
}

impl PortPair {
    pub fn new(client: u16, transport: u16) -> Self {
        Self { client, transport }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client, self.transport)
    }
}

/// Resources each executor needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// CPU shares per executor.
    pub cpus: f64,
    /// Memory per executor in megabytes.
    pub mem_mb: u64,
    /// Acceptable port pairs in order of preference. Empty means any two free ports.
    #[serde(default)]
    pub ports: Vec<PortPair>,
    /// Reject offers that contain none of `ports` instead of picking free ports.
    #[serde(default)]
    pub strict_ports: bool,
}

/// What the operator asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredSpec {
    /// Number of executors to keep running.
    pub count: u32,
    /// Per-executor resource requirements.
    pub resources: ResourceRequirements,
    /// Unix timestamp (seconds) of the last reconfiguration.
    pub updated_at: u64,
}

impl DesiredSpec {
    /// Check the spec for values that could never be satisfied.
    pub fn validate(&self) -> Result<(), String> {
        let res = &self.resources;
        if !(res.cpus.is_finite() && res.cpus > 0.0) {
            return Err(format!("cpus must be positive, got {}", res.cpus));
        }
        if res.mem_mb == 0 {
            return Err("mem_mb must be positive".to_string());
        }
        for (i, pair) in res.ports.iter().enumerate() {
            if pair.client == 0 || pair.transport == 0 {
                return Err(format!("port pair {pair} contains port 0"));
            }
            if pair.client == pair.transport {
                return Err(format!("port pair {pair} uses the same port twice"));
            }
            if res.ports[..i].contains(pair) {
                return Err(format!("port pair {pair} listed twice"));
            }
        }
        if res.strict_ports && res.ports.is_empty() {
            return Err("strict_ports requires at least one port pair".to_string());
        }
        Ok(())
    }

    /// Whether applying `other` changes anything besides the timestamp.
    pub fn differs_from(&self, other: &DesiredSpec) -> bool {
        self.count != other.count || self.resources != other.resources
    }
}

// ── Framework ──────────────────────────────────────────────────────

/// Identity of this scheduler, stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkIdentity {
    pub name: String,
    pub framework_id: String,
    /// Unix timestamp (seconds) of first registration.
    pub registered_at: u64,
}

impl FrameworkIdentity {
    /// Prefix shared by every task id this framework mints.
    pub fn task_prefix(&self) -> String {
        format!("{}-{}", self.name, self.framework_id)
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

/// Identifier of a task launched on the resource manager.
///
/// Minted as `{prefix}.{slot}.{generation}` so every status event names the
/// binding it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint the task id for a binding.
    pub fn for_binding(prefix: &str, slot_id: SlotId, generation: Generation) -> Self {
        Self(format!("{prefix}.{slot_id}.{generation}"))
    }

    /// Recover `(slot_id, generation)` from a minted id.
    pub fn binding(&self) -> Option<(SlotId, Generation)> {
        let mut parts = self.0.rsplitn(3, '.');
        let generation = parts.next()?.parse().ok()?;
        let slot_id = parts.next()?.parse().ok()?;
        let prefix = parts.next()?;
        if prefix.is_empty() {
            return None;
        }
        Some((slot_id, generation))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task status as reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Killing,
    Finished,
    Failed,
    Killed,
    Error,
    Lost,
    Dropped,
    Gone,
}

impl TaskState {
    /// Whether the task will never run again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Error
                | TaskState::Lost
                | TaskState::Dropped
                | TaskState::Gone
        )
    }
}

// ── Slots ──────────────────────────────────────────────────────────

/// Lifecycle state of an executor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Empty,
    LaunchPending,
    Staging,
    Running,
    Unhealthy,
    Killing,
    Lost,
    Failed,
}

impl SlotState {
    pub const ALL: [SlotState; 8] = [
        SlotState::Empty,
        SlotState::LaunchPending,
        SlotState::Staging,
        SlotState::Running,
        SlotState::Unhealthy,
        SlotState::Killing,
        SlotState::Lost,
        SlotState::Failed,
    ];

    /// Counts toward the desired count.
    pub fn is_alive(self) -> bool {
        matches!(
            self,
            SlotState::LaunchPending | SlotState::Staging | SlotState::Running
        )
    }

    /// The bound task is confirmed gone.
    pub fn is_terminal(self) -> bool {
        matches!(self, SlotState::Lost | SlotState::Failed)
    }

    /// A task is bound and not yet confirmed gone.
    pub fn has_live_task(self) -> bool {
        !matches!(self, SlotState::Empty) && !self.is_terminal()
    }

    /// Transition caused by a task status update, if any.
    ///
    /// Transitions only move forward: a late `Staging` after `Running` is
    /// ignored, and `Unhealthy`/`Killing` slots are never resurrected.
    pub fn on_task_state(self, status: TaskState) -> Option<SlotState> {
        if !self.has_live_task() {
            return None;
        }
        match status {
            TaskState::Failed | TaskState::Error => Some(SlotState::Failed),
            s if s.is_terminal() => Some(SlotState::Lost),
            TaskState::Staging | TaskState::Starting => {
                (self == SlotState::LaunchPending).then_some(SlotState::Staging)
            }
            TaskState::Running => matches!(self, SlotState::LaunchPending | SlotState::Staging)
                .then_some(SlotState::Running),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SlotState::Empty => "empty",
            SlotState::LaunchPending => "launch_pending",
            SlotState::Staging => "staging",
            SlotState::Running => "running",
            SlotState::Unhealthy => "unhealthy",
            SlotState::Killing => "killing",
            SlotState::Lost => "lost",
            SlotState::Failed => "failed",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a bound task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub agent_id: String,
    pub hostname: String,
    pub ports: PortPair,
}

/// One unit of desired capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSlot {
    pub slot_id: SlotId,
    pub task_id: Option<TaskId>,
    pub state: SlotState,
    pub generation: Generation,
    /// Unix timestamp (millis) of the last successful probe.
    pub last_health_ack: Option<u64>,
    pub endpoint: Option<Endpoint>,
    /// Unix timestamp (millis) of the last mutation.
    pub updated_at: u64,
}

impl ExecutorSlot {
    /// A fresh, unbound slot.
    pub fn empty(slot_id: SlotId) -> Self {
        Self {
            slot_id,
            task_id: None,
            state: SlotState::Empty,
            generation: 0,
            last_health_ack: None,
            endpoint: None,
            updated_at: epoch_millis(),
        }
    }

    /// Build the key for the slots table.
    pub fn table_key(&self) -> String {
        slot_key(self.slot_id)
    }

    /// Whether this slot currently holds the given binding.
    pub fn holds(&self, task_id: &TaskId, generation: Generation) -> bool {
        self.generation == generation && self.task_id.as_ref() == Some(task_id)
    }
}

/// Zero-padded key so lexicographic order matches slot order.
pub fn slot_key(slot_id: SlotId) -> String {
    format!("{slot_id:010}")
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    epoch_millis() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(ports: Vec<PortPair>) -> DesiredSpec {
        DesiredSpec {
            count: 3,
            resources: ResourceRequirements {
                cpus: 0.5,
                mem_mb: 256,
                ports,
                strict_ports: false,
            },
            updated_at: 0,
        }
    }

    #[test]
    fn task_id_round_trips_binding() {
        let id = TaskId::for_binding("elasticsearch-5f1c", 2, 7);
        assert_eq!(id.as_str(), "elasticsearch-5f1c.2.7");
        assert_eq!(id.binding(), Some((2, 7)));
    }

    #[test]
    fn foreign_task_id_has_no_binding() {
        assert_eq!(TaskId::new("something-else").binding(), None);
        assert_eq!(TaskId::new("a.b.c").binding(), None);
        assert_eq!(TaskId::new(".1.2").binding(), None);
    }

    #[test]
    fn status_transitions_move_forward_only() {
        use SlotState::*;
        assert_eq!(LaunchPending.on_task_state(TaskState::Staging), Some(Staging));
        assert_eq!(LaunchPending.on_task_state(TaskState::Running), Some(Running));
        assert_eq!(Staging.on_task_state(TaskState::Running), Some(Running));
        assert_eq!(Running.on_task_state(TaskState::Staging), None);
        assert_eq!(Running.on_task_state(TaskState::Running), None);
        assert_eq!(Killing.on_task_state(TaskState::Running), None);
        assert_eq!(Unhealthy.on_task_state(TaskState::Running), None);
    }

    #[test]
    fn terminal_statuses_map_to_lost_or_failed() {
        use SlotState::*;
        assert_eq!(Running.on_task_state(TaskState::Killed), Some(Lost));
        assert_eq!(Killing.on_task_state(TaskState::Killed), Some(Lost));
        assert_eq!(Staging.on_task_state(TaskState::Failed), Some(Failed));
        assert_eq!(LaunchPending.on_task_state(TaskState::Error), Some(Failed));
        assert_eq!(Empty.on_task_state(TaskState::Lost), None);
        assert_eq!(Lost.on_task_state(TaskState::Failed), None);
    }

    #[test]
    fn alive_states_count_toward_desired() {
        let alive: Vec<_> = SlotState::ALL.iter().filter(|s| s.is_alive()).collect();
        assert_eq!(
            alive,
            vec![&SlotState::LaunchPending, &SlotState::Staging, &SlotState::Running]
        );
    }

    #[test]
    fn validate_rejects_bad_port_pairs() {
        assert!(spec(vec![PortPair::new(9200, 9300)]).validate().is_ok());
        assert!(spec(vec![PortPair::new(9200, 9200)]).validate().is_err());
        assert!(spec(vec![PortPair::new(0, 9300)]).validate().is_err());
        assert!(
            spec(vec![PortPair::new(9200, 9300), PortPair::new(9200, 9300)])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn validate_rejects_empty_resources() {
        let mut s = spec(vec![]);
        s.resources.cpus = 0.0;
        assert!(s.validate().is_err());

        let mut s = spec(vec![]);
        s.resources.mem_mb = 0;
        assert!(s.validate().is_err());

        let mut s = spec(vec![]);
        s.resources.strict_ports = true;
        assert!(s.validate().is_err());
    }

    #[test]
    fn slot_keys_sort_numerically() {
        assert!(slot_key(2) < slot_key(10));
        assert_eq!(ExecutorSlot::empty(4).table_key(), "0000000004");
    }

    #[test]
    fn differs_ignores_timestamp() {
        let a = spec(vec![]);
        let mut b = a.clone();
        b.updated_at = 99;
        assert!(!a.differs_from(&b));
        b.count = 4;
        assert!(a.differs_from(&b));
    }
}

//! LaunchPlanner — turns a deficit plus a batch of offers into launches.

use tracing::{debug, error, info};

use keel_core::ExecutorCommand;
use keel_placement::{Offer, compute_placement};
use keel_state::{Endpoint, ResourceRequirements, TaskId};

use crate::registry::ExecutorRegistry;
use crate::resource_manager::LaunchRequest;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchPlan {
    pub requests: Vec<LaunchRequest>,
    /// Offers to decline.
    pub unused_offers: Vec<String>,
    /// A bind could not be persisted; planning stopped early.
    pub store_failed: bool,
}

pub struct LaunchPlanner {
    task_prefix: String,
    command: ExecutorCommand,
}

impl LaunchPlanner {
    pub fn new(task_prefix: impl Into<String>, command: ExecutorCommand) -> Self {
        Self {
            task_prefix: task_prefix.into(),
            command,
        }
    }

    /// Fill up to `deficit` empty slots from `offers`.
    ///
    /// Each matched slot is bound before its launch request is returned.
    /// Whatever cannot be placed stays outstanding for the next offer cycle.
    pub fn fill(
        &self,
        registry: &mut ExecutorRegistry,
        resources: &ResourceRequirements,
        deficit: u32,
        offers: &[Offer],
    ) -> LaunchPlan {
        let empty = registry.empty_slots();
        let wanted = deficit.min(empty.len() as u32);
        let placement = compute_placement(resources, wanted, offers);
        let unplaced = placement.unplaced;

        let mut requests = Vec::with_capacity(placement.placements.len());
        let mut store_failed = false;

        for (slot_id, placed) in empty.into_iter().zip(placement.placements) {
            let Some(generation) = registry.next_generation(slot_id) else {
                continue;
            };
            let task_id = TaskId::for_binding(&self.task_prefix, slot_id, generation);
            let endpoint = Endpoint {
                agent_id: placed.agent_id.clone(),
                hostname: placed.hostname.clone(),
                ports: placed.ports,
            };

            match registry.bind(slot_id, task_id.clone(), endpoint) {
                Ok(generation) => {
                    debug!(
                        slot_id,
                        generation,
                        %task_id,
                        host = %placed.hostname,
                        ports = %placed.ports,
                        "launch planned"
                    );
                    requests.push(LaunchRequest {
                        task_id,
                        slot_id,
                        generation,
                        offer_id: placed.offer_id,
                        agent_id: placed.agent_id,
                        hostname: placed.hostname,
                        cpus: resources.cpus,
                        mem_mb: resources.mem_mb,
                        ports: placed.ports,
                        command: self.command.clone(),
                    });
                }
                Err(e) => {
                    error!(slot_id, error = %e, "failed to bind slot; halting launch planning");
                    store_failed = true;
                    break;
                }
            }
        }

        let unused_offers: Vec<String> = offers
            .iter()
            .filter(|o| !requests.iter().any(|r| r.offer_id == o.offer_id))
            .map(|o| o.offer_id.clone())
            .collect();

        let remaining = deficit.saturating_sub(requests.len() as u32);
        if remaining > 0 && !store_failed {
            info!(
                planned = requests.len(),
                unplaced,
                remaining,
                "deficit outstanding after offer cycle"
            );
        }

        LaunchPlan {
            requests,
            unused_offers,
            store_failed,
        }
    }
}

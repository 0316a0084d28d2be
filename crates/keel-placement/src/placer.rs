//! Placement engine — spreads executors over a batch of offers.
//!
//! Greedy: each executor goes to the best-scoring offer that still fits,
//! earlier offers winning ties. Resources taken by one placement are
//! subtracted before the next executor is considered, so a large offer can
//! host several executors without port collisions.

use tracing::{debug, info};

use keel_state::{PortPair, ResourceRequirements};

use crate::scorer::{Offer, OfferCapacity, score_offer};

/// One executor assigned to one offer.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub offer_id: String,
    pub agent_id: String,
    pub hostname: String,
    pub ports: PortPair,
    /// The ports came from the required pairs rather than a free-port pick.
    pub exact_ports: bool,
}

/// Result of placing a batch of executors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlacementPlan {
    pub placements: Vec<Placement>,
    /// Offers nothing was placed on.
    pub unused_offers: Vec<String>,
    /// Executors that did not fit anywhere.
    pub unplaced: u32,
}

/// Place up to `count` executors on `offers`.
pub fn compute_placement(
    req: &ResourceRequirements,
    count: u32,
    offers: &[Offer],
) -> PlacementPlan {
    let mut capacities: Vec<OfferCapacity> = offers.iter().map(OfferCapacity::from_offer).collect();
    let mut used = vec![false; offers.len()];
    let mut placements = Vec::new();
    let mut remaining = count;

    while remaining > 0 {
        let best = capacities
            .iter()
            .enumerate()
            .filter_map(|(idx, cap)| score_offer(cap, req).map(|(score, fit)| (idx, score, fit)))
            .fold(None, |best: Option<(usize, f64, _)>, candidate| match best {
                Some(b) if b.1 >= candidate.1 => Some(b),
                _ => Some(candidate),
            });

        let Some((idx, score, fit)) = best else {
            break;
        };

        let offer = &offers[idx];
        capacities[idx].consume(req, fit.pair());
        used[idx] = true;
        remaining -= 1;

        debug!(
            offer = %offer.offer_id,
            host = %offer.hostname,
            ports = %fit.pair(),
            score,
            "placed executor"
        );
        placements.push(Placement {
            offer_id: offer.offer_id.clone(),
            agent_id: offer.agent_id.clone(),
            hostname: offer.hostname.clone(),
            ports: fit.pair(),
            exact_ports: fit.is_exact(),
        });
    }

    if remaining > 0 {
        info!(
            remaining,
            offers = offers.len(),
            "offers insufficient; leaving deficit for the next offer cycle"
        );
    }

    let unused_offers = offers
        .iter()
        .zip(&used)
        .filter(|(_, used)| !**used)
        .map(|(o, _)| o.offer_id.clone())
        .collect();

    PlacementPlan {
        placements,
        unused_offers,
        unplaced: remaining,
    }
}

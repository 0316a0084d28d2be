//! Offer scoring for placement decisions.
//!
//! An offer fits an executor when it has enough CPU and memory left and a
//! usable port pair. Offers that contain one of the required port pairs
//! exactly score higher than offers where free ports have to be picked,
//! so co-located executors do not collide on well-known ports.

use serde::{Deserialize, Serialize};

use keel_state::{PortPair, ResourceRequirements};

const CPU_EPSILON: f64 = 1e-9;

/// Inclusive range of ports advertised in an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(begin: u16, end: u16) -> Self {
        Self { begin, end }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.begin <= port && port <= self.end
    }
}

/// A unit of available resources advertised by the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub offer_id: String,
    pub agent_id: String,
    pub hostname: String,
    pub cpus: f64,
    pub mem_mb: u64,
    pub ports: Vec<PortRange>,
}

/// How an executor's ports were chosen from an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFit {
    /// One of the required pairs is fully available.
    Exact(PortPair),
    /// Two free ports were picked.
    Dynamic(PortPair),
}

impl PortFit {
    pub fn pair(self) -> PortPair {
        match self {
            PortFit::Exact(p) | PortFit::Dynamic(p) => p,
        }
    }

    pub fn is_exact(self) -> bool {
        matches!(self, PortFit::Exact(_))
    }
}

/// What is left of an offer after earlier placements consumed part of it.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferCapacity {
    pub cpus: f64,
    pub mem_mb: u64,
    pub ports: Vec<PortRange>,
}

impl OfferCapacity {
    pub fn from_offer(offer: &Offer) -> Self {
        let mut ports = offer.ports.clone();
        ports.sort_by_key(|r| r.begin);
        Self {
            cpus: offer.cpus,
            mem_mb: offer.mem_mb,
            ports,
        }
    }

    pub fn has_port(&self, port: u16) -> bool {
        self.ports.iter().any(|r| r.contains(port))
    }

    /// Remove resources for one executor.
    pub fn consume(&mut self, req: &ResourceRequirements, pair: PortPair) {
        self.cpus = (self.cpus - req.cpus).max(0.0);
        self.mem_mb = self.mem_mb.saturating_sub(req.mem_mb);
        self.take_port(pair.client);
        self.take_port(pair.transport);
    }

    fn take_port(&mut self, port: u16) {
        let Some(idx) = self.ports.iter().position(|r| r.contains(port)) else {
            return;
        };
        let range = self.ports.remove(idx);
        if port < range.end {
            self.ports.insert(idx, PortRange::new(port + 1, range.end));
        }
        if port > range.begin {
            self.ports.insert(idx, PortRange::new(range.begin, port - 1));
        }
    }

    fn lowest_free(&self, count: usize) -> Vec<u16> {
        self.ports
            .iter()
            .flat_map(|r| r.begin..=r.end)
            .take(count)
            .collect()
    }
}

/// Choose a port pair from the remaining capacity of an offer.
pub fn select_ports(capacity: &OfferCapacity, req: &ResourceRequirements) -> Option<PortFit> {
    if let Some(pair) = req
        .ports
        .iter()
        .find(|p| capacity.has_port(p.client) && capacity.has_port(p.transport))
    {
        return Some(PortFit::Exact(*pair));
    }
    if req.strict_ports {
        return None;
    }
    match capacity.lowest_free(2).as_slice() {
        [client, transport] => Some(PortFit::Dynamic(PortPair::new(*client, *transport))),
        _ => None,
    }
}

/// Score an offer for one executor. `None` if it does not fit.
///
/// Exact port matches score 2.0, dynamic picks 1.0.
pub fn score_offer(capacity: &OfferCapacity, req: &ResourceRequirements) -> Option<(f64, PortFit)> {
    if capacity.cpus + CPU_EPSILON < req.cpus || capacity.mem_mb < req.mem_mb {
        return None;
    }
    let fit = select_ports(capacity, req)?;
    let score = if fit.is_exact() { 2.0 } else { 1.0 };
    Some((score, fit))
}

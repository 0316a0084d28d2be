//! Keel offer matching — turns resource offers into executor placements.
//!
//! This crate only decides *where* executors fit. It does not bind slots
//! or talk to the resource manager (that's `keel-scheduler`).
//!
//! # Components
//!
//! - **`scorer`** — Offer model, port selection, and fit scoring
//! - **`placer`** — Greedy placement across a batch of offers

pub mod placer;
pub mod scorer;

pub use placer::{Placement, PlacementPlan, compute_placement};
pub use scorer::{Offer, OfferCapacity, PortFit, PortRange, score_offer, select_ports};

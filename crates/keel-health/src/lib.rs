//! keel-health — executor liveness checking for Keel.
//!
//! Every running executor gets its own background probe task, so one slow
//! executor never delays detection for the others.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── Per-slot background task
//!   │   ├── HealthTracker (grace window, acknowledgment deadline)
//!   │   ├── Prober::probe() → ProbeResult
//!   │   └── HealthCallback(HealthSignal::Ack | HealthSignal::Expired)
//!   └── Callback routes signals into the scheduler's event loop
//! ```
//!
//! # Policy
//!
//! A slot is overdue once `now - last_ack > delay + timeout`, where the
//! monitor start time stands in for `last_ack` until the first successful
//! probe. The monitor never signals expiry inside the delay window, and it
//! never writes slot state itself: the scheduler decides what to do with a
//! signal.

pub mod checker;
pub mod monitor;

pub use checker::{
    BoxFuture, HealthTracker, HealthVerdict, HttpProber, ProbeResult, ProbeTarget, Prober,
    http_probe,
};
pub use monitor::{HealthCallback, HealthMonitor, HealthSignal};

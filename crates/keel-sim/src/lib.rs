//! keel-sim — an in-process cluster resource manager.
//!
//! `SimCluster` models agents, resource offers, and task lifecycles closely
//! enough to drive the scheduler end to end: offers are sent on a timer,
//! launched tasks move through staging to running, and reconciliation
//! requests are answered from the simulated task table. Tests reach in to
//! crash tasks, stall health checks, or sever the scheduler's link.
//!
//! Each `SimCluster` is an independent handle; create one per test.

pub mod cluster;
pub mod driver;
pub mod prober;
pub mod wait;

pub use cluster::{SimAgent, SimCluster, SimConfig, SimTask};
pub use driver::SimDriver;
pub use prober::SimProber;
pub use wait::{WaitTimeout, wait_until};

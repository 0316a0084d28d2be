pub mod config;

pub use config::{
    ExecutorCommand, HealthSettings, KeelConfig, ReconcileSettings, SchedulerSettings,
};

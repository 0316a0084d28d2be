//! keel.toml configuration parser.
//!
//! Every field is optional in the file; [`KeelConfig::resolve`] fills in
//! defaults and validates the result into [`SchedulerSettings`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use keel_state::{DesiredSpec, PortPair, ResourceRequirements, epoch_secs};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeelConfig {
    pub framework: Option<FrameworkConfig>,
    pub executors: Option<ExecutorsConfig>,
    pub executor: Option<CommandConfig>,
    pub health: Option<HealthConfig>,
    pub reconciliation: Option<ReconciliationConfig>,
    pub state: Option<StateConfig>,
    pub api: Option<ApiConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkConfig {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorsConfig {
    pub desired_count: Option<u32>,
    pub cpu_per_executor: Option<f64>,
    pub mem_per_executor: Option<u64>,
    pub ports_per_executor: Option<PortsConfig>,
    pub strict_ports: Option<bool>,
}

/// `ports_per_executor = [9200, 9300]` or `[[9200, 9300], [9201, 9301]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortsConfig {
    Single([u16; 2]),
    Many(Vec<[u16; 2]>),
}

impl PortsConfig {
    fn pairs(&self) -> Vec<PortPair> {
        match self {
            PortsConfig::Single([c, t]) => vec![PortPair::new(*c, *t)],
            PortsConfig::Many(list) => list.iter().map(|[c, t]| PortPair::new(*c, *t)).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandConfig {
    pub image: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthConfig {
    pub health_delay_seconds: Option<u64>,
    pub health_timeout_seconds: Option<u64>,
    pub probe_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    pub sweep_interval_seconds: Option<u64>,
    pub launch_timeout_seconds: Option<u64>,
    pub kill_retry_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    pub listen: Option<String>,
}

/// How executors are started. Passed to the launch planner as a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorCommand {
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Health probe policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    /// Grace period after launch before an acknowledgment is expected.
    pub delay: Duration,
    /// How long past the grace period a missing acknowledgment is tolerated.
    pub timeout: Duration,
    /// Probe cadence.
    pub interval: Duration,
}

/// Reconciliation timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Periodic safety sweep.
    pub sweep_interval: Duration,
    /// How long a slot may stay `launch_pending` without a status update.
    pub launch_timeout: Duration,
    /// Minimum spacing between repeated kills of the same task.
    pub kill_retry: Duration,
}

/// Fully resolved scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub framework_name: String,
    pub desired: DesiredSpec,
    pub command: ExecutorCommand,
    pub health: HealthSettings,
    pub reconcile: ReconcileSettings,
    pub data_dir: PathBuf,
    pub listen: String,
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Override the desired executor count.
    pub fn set_desired_count(&mut self, count: u32) {
        self.executors.get_or_insert_with(Default::default).desired_count = Some(count);
    }

    /// Override the data directory.
    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.state.get_or_insert_with(Default::default).data_dir = Some(dir);
    }

    /// Override the API listen address.
    pub fn set_listen(&mut self, listen: String) {
        self.api.get_or_insert_with(Default::default).listen = Some(listen);
    }

    /// Fill in defaults and validate.
    pub fn resolve(&self) -> anyhow::Result<SchedulerSettings> {
        let framework = self.framework.clone().unwrap_or_default();
        let executors = self.executors.clone().unwrap_or_default();
        let command = self.executor.clone().unwrap_or_default();
        let health = self.health.clone().unwrap_or_default();
        let recon = self.reconciliation.clone().unwrap_or_default();

        let framework_name = framework.name.unwrap_or_else(|| "keel".to_string());
        if framework_name.is_empty() || framework_name.contains('.') {
            bail!("framework name must be non-empty and contain no '.': {framework_name:?}");
        }

        let desired = DesiredSpec {
            count: executors.desired_count.unwrap_or(3),
            resources: ResourceRequirements {
                cpus: executors.cpu_per_executor.unwrap_or(0.5),
                mem_mb: executors.mem_per_executor.unwrap_or(256),
                ports: executors
                    .ports_per_executor
                    .map(|p| p.pairs())
                    .unwrap_or_default(),
                strict_ports: executors.strict_ports.unwrap_or(false),
            },
            updated_at: epoch_secs(),
        };
        if let Err(reason) = desired.validate() {
            bail!("invalid [executors] section: {reason}");
        }

        let health = HealthSettings {
            delay: secs(health.health_delay_seconds, 30, "health_delay_seconds")?,
            timeout: secs(health.health_timeout_seconds, 60, "health_timeout_seconds")?,
            interval: secs(health.probe_interval_seconds, 5, "probe_interval_seconds")?,
        };

        let reconcile = ReconcileSettings {
            sweep_interval: secs(recon.sweep_interval_seconds, 60, "sweep_interval_seconds")?,
            launch_timeout: secs(recon.launch_timeout_seconds, 120, "launch_timeout_seconds")?,
            kill_retry: secs(recon.kill_retry_seconds, 30, "kill_retry_seconds")?,
        };

        Ok(SchedulerSettings {
            framework_name,
            desired,
            command: ExecutorCommand {
                image: command
                    .image
                    .unwrap_or_else(|| "keel/executor:latest".to_string()),
                args: command.args.unwrap_or_default(),
                env: command.env.unwrap_or_default(),
            },
            health,
            reconcile,
            data_dir: self
                .state
                .as_ref()
                .and_then(|s| s.data_dir.clone())
                .unwrap_or_else(|| PathBuf::from("/var/lib/keel")),
            listen: self
                .api
                .as_ref()
                .and_then(|a| a.listen.clone())
                .unwrap_or_else(|| "0.0.0.0:8480".to_string()),
        })
    }
}

fn secs(value: Option<u64>, default: u64, field: &str) -> anyhow::Result<Duration> {
    let v = value.unwrap_or(default);
    if v == 0 {
        bail!("{field} must be greater than zero");
    }
    Ok(Duration::from_secs(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let settings = KeelConfig::default().resolve().unwrap();
        assert_eq!(settings.framework_name, "keel");
        assert_eq!(settings.desired.count, 3);
        assert!(settings.desired.resources.ports.is_empty());
        assert_eq!(settings.health.delay, Duration::from_secs(30));
        assert_eq!(settings.reconcile.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn parse_operator_options() {
        let toml_str = r#"
[framework]
name = "elasticsearch"

[executors]
desired_count = 3
cpu_per_executor = 0.2
mem_per_executor = 256
ports_per_executor = [9200, 9300]

[health]
health_delay_seconds = 99
health_timeout_seconds = 100
"#;
        let settings = KeelConfig::from_toml_str(toml_str).unwrap().resolve().unwrap();
        assert_eq!(settings.framework_name, "elasticsearch");
        assert_eq!(settings.desired.resources.cpus, 0.2);
        assert_eq!(settings.desired.resources.mem_mb, 256);
        assert_eq!(
            settings.desired.resources.ports,
            vec![PortPair::new(9200, 9300)]
        );
        assert_eq!(settings.health.delay, Duration::from_secs(99));
        assert_eq!(settings.health.timeout, Duration::from_secs(100));
    }

    #[test]
    fn parse_multiple_port_pairs() {
        let toml_str = r#"
[executors]
ports_per_executor = [[9200, 9300], [9201, 9301]]
strict_ports = true
"#;
        let settings = KeelConfig::from_toml_str(toml_str).unwrap().resolve().unwrap();
        assert_eq!(settings.desired.resources.ports.len(), 2);
        assert!(settings.desired.resources.strict_ports);
    }

    #[test]
    fn overrides_apply() {
        let mut config = KeelConfig::default();
        config.set_desired_count(7);
        config.set_data_dir(PathBuf::from("/tmp/keel"));
        config.set_listen("127.0.0.1:9000".to_string());

        let settings = config.resolve().unwrap();
        assert_eq!(settings.desired.count, 7);
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/keel"));
        assert_eq!(settings.listen, "127.0.0.1:9000");
    }

    #[test]
    fn rejects_invalid_values() {
        let bad_ports = "[executors]\nports_per_executor = [9200, 9200]\n";
        assert!(KeelConfig::from_toml_str(bad_ports).unwrap().resolve().is_err());

        let zero_timeout = "[health]\nhealth_timeout_seconds = 0\n";
        assert!(KeelConfig::from_toml_str(zero_timeout).unwrap().resolve().is_err());

        let dotted = "[framework]\nname = \"a.b\"\n";
        assert!(KeelConfig::from_toml_str(dotted).unwrap().resolve().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = KeelConfig::default();
        config.set_desired_count(2);
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("desired_count = 2"));
        let parsed = KeelConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.resolve().unwrap().desired.count, 2);
    }
}

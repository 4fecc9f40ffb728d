//! Controller configuration (`vmscale.toml`) parser and validation.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env::expand_vars;
use crate::error::{ConfigError, ConfigResult};
use crate::types::{AggregationMethod, HypervisorKind, Protocol, ReplacementKind, Resources};

/// Config file versions this build understands.
pub const SUPPORTED_VERSIONS: &[&str] = &["v1alpha1"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub version: String,
    pub controller: Controller,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Controller {
    pub databases: Databases,
    pub platform: PlatformConfig,
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    pub autoscale: Autoscale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Databases {
    /// Seconds between host metric collection rounds.
    pub collection_interval: u64,
    /// Upper bound in seconds on any single hypervisor call.
    pub host_connection_timeout: u64,
    /// Concurrent host connections used by the metrics collector.
    pub max_host_connection_threads: usize,
    pub state: StateDatabase,
    pub timeseries: TimeSeriesDatabase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDatabase {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesDatabase {
    pub path: PathBuf,
    /// Number of most recent samples per metric used by the reconciler.
    pub trailing: usize,
    /// Samples older than this many seconds are pruned.
    #[serde(default = "default_retention")]
    pub retention: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    pub actions_queue_max_size: usize,
    /// Outbound message buffer between the core and the platform sink.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationConfig {
    /// Seconds between reconciliation cycles.
    pub interval: u64,
    #[serde(default = "default_poll_interval")]
    pub replacement_poll_interval: u64,
    #[serde(default = "default_poll_attempts")]
    pub replacement_poll_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    pub workers: usize,
    pub max_attempts: u32,
    /// First retry delay in seconds; doubles per attempt.
    pub backoff_base: u64,
    /// Delay before retrying an action whose host is busy.
    pub contention_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            backoff_base: 1,
            contention_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Autoscale {
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub groups: BTreeMap<String, AutoscalingGroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
    pub hypervisor: HypervisorKind,
    #[serde(default)]
    pub user: Option<String>,
    pub resources: Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingGroupConfig {
    pub image: String,
    /// Domain name template; supports `{group}` and `{index}`.
    pub domain_name: String,
    #[serde(default)]
    pub cloud_init: Option<CloudInit>,
    /// Names of hosts (from `autoscale.hosts`) this group may place VMs on.
    pub hosts: Vec<String>,
    pub replacement: HostReplacementStrategy,
    #[serde(default)]
    pub networking: Option<Network>,
    pub scaling: ScaleStrategy,
    /// Allocation for each VM in the group.
    pub vm: Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CloudInit {
    pub user_data: String,
    #[serde(default)]
    pub meta_data: String,
    #[serde(default)]
    pub network_data: String,
    #[serde(default)]
    pub vendor_data: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostReplacementStrategy {
    #[serde(default)]
    pub strategy: ReplacementKind,
    pub max_unavailable: u32,
    pub max_surge: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub dhcp: bool,
    pub gateway: String,
    pub netmask: String,
    pub subnet: String,
    #[serde(default)]
    pub address_range: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleStrategy {
    pub min: u32,
    pub max: u32,
    pub desired: u32,
    pub increment: u32,
    /// Seconds between scaling decisions.
    pub cooldown: u64,
    #[serde(default)]
    pub method: AggregationMethod,
    /// Metric name → target utilization percent.
    pub target_utilization: BTreeMap<String, f64>,
    /// Every metric below `target * scale_down_ratio` allows a scale-down.
    #[serde(default = "default_scale_down_ratio")]
    pub scale_down_ratio: f64,
}

impl ScaleStrategy {
    pub fn clamp(&self, n: u32) -> u32 {
        n.clamp(self.min, self.max)
    }
}

fn default_retention() -> u64 {
    86_400
}

fn default_buffer_size() -> usize {
    1024
}

fn default_poll_interval() -> u64 {
    5
}

fn default_poll_attempts() -> u32 {
    6
}

fn default_scale_down_ratio() -> f64 {
    0.5
}

impl ControllerConfig {
    /// Parse a config file without validating it.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Parse, expand environment variables, and validate.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut config = Self::from_file(path)?;
        config.expand_env();
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the scaffold to `path` if nothing exists there yet.
    ///
    /// Returns true if a file was written.
    pub fn write_default(path: &Path) -> ConfigResult<bool> {
        if path.exists() {
            return Ok(false);
        }
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let body = Self::scaffold().to_toml_string()?;
        std::fs::write(path, body).map_err(write_err)?;
        Ok(true)
    }

    /// Expand `$VAR` references in credential-like fields.
    pub fn expand_env(&mut self) {
        let platform = &mut self.controller.platform;
        platform.domain = platform.domain.as_deref().map(expand_vars);
        platform.token = platform.token.as_deref().map(expand_vars);
        for host in &mut self.controller.autoscale.hosts {
            host.user = host.user.as_deref().map(expand_vars);
            host.address = expand_vars(&host.address);
        }
    }

    /// Reject configurations the control loop cannot run safely.
    pub fn validate(&self) -> ConfigResult<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            return Err(ConfigError::UnsupportedVersion(self.version.clone()));
        }

        let c = &self.controller;
        if c.reconciliation.interval == 0 {
            return Err(invalid("reconciliation.interval", "must be greater than 0"));
        }
        if c.platform.actions_queue_max_size == 0 {
            return Err(invalid("platform.actionsQueueMaxSize", "must be greater than 0"));
        }
        if c.platform.buffer_size == 0 {
            return Err(invalid("platform.bufferSize", "must be greater than 0"));
        }
        if c.executor.workers == 0 {
            return Err(invalid("executor.workers", "must be greater than 0"));
        }
        if c.executor.max_attempts == 0 {
            return Err(invalid("executor.maxAttempts", "must be greater than 0"));
        }
        if c.databases.max_host_connection_threads == 0 {
            return Err(invalid(
                "databases.maxHostConnectionThreads",
                "must be greater than 0",
            ));
        }
        if c.databases.host_connection_timeout == 0 {
            return Err(invalid(
                "databases.hostConnectionTimeout",
                "must be greater than 0",
            ));
        }
        if c.databases.timeseries.trailing == 0 {
            return Err(invalid("databases.timeseries.trailing", "must be greater than 0"));
        }

        let mut host_names = HashSet::new();
        for host in &c.autoscale.hosts {
            if !host_names.insert(host.name.as_str()) {
                return Err(invalid(
                    &format!("autoscale.hosts.{}", host.name),
                    "duplicate host name",
                ));
            }
        }

        for (name, group) in &c.autoscale.groups {
            let ctx = |field: &str| format!("autoscale.groups.{name}.{field}");
            let s = &group.scaling;

            if !(s.min <= s.desired && s.desired <= s.max) {
                return Err(invalid(
                    &ctx("scaling"),
                    &format!(
                        "expected min <= desired <= max, got {} / {} / {}",
                        s.min, s.desired, s.max
                    ),
                ));
            }
            if s.increment == 0 {
                return Err(invalid(&ctx("scaling.increment"), "must be greater than 0"));
            }
            if s.target_utilization.is_empty() {
                return Err(invalid(&ctx("scaling.targetUtilization"), "must not be empty"));
            }
            if let Some((metric, _)) = s
                .target_utilization
                .iter()
                .find(|(_, t)| !(t.is_finite() && **t > 0.0))
            {
                return Err(invalid(
                    &ctx(&format!("scaling.targetUtilization.{metric}")),
                    "must be a positive percentage",
                ));
            }
            if !(s.scale_down_ratio > 0.0 && s.scale_down_ratio <= 1.0) {
                return Err(invalid(&ctx("scaling.scaleDownRatio"), "must be in (0, 1]"));
            }

            let r = &group.replacement;
            if r.max_surge == 0 && r.max_unavailable == 0 {
                return Err(invalid(
                    &ctx("replacement"),
                    "maxSurge and maxUnavailable cannot both be 0",
                ));
            }

            if group.hosts.is_empty() {
                return Err(invalid(&ctx("hosts"), "must name at least one host"));
            }
            if let Some(unknown) = group.hosts.iter().find(|h| !host_names.contains(h.as_str())) {
                return Err(invalid(&ctx("hosts"), &format!("unknown host '{unknown}'")));
            }

            if let Some(net) = &group.networking
                && net.dhcp
                && net.address_range.is_none()
            {
                return Err(invalid(
                    &ctx("networking.addressRange"),
                    "required when dhcp is enabled",
                ));
            }

            if group.domain_name.trim().is_empty() {
                return Err(invalid(&ctx("domainName"), "must not be empty"));
            }
        }

        Ok(())
    }

    pub fn host(&self, name: &str) -> Option<&HostConfig> {
        self.controller.autoscale.hosts.iter().find(|h| h.name == name)
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.controller.reconciliation.interval)
    }

    pub fn host_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.controller.databases.host_connection_timeout)
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.controller.databases.collection_interval)
    }

    /// Scaffold a minimal single-host, single-group configuration.
    pub fn scaffold() -> Self {
        let mut targets = BTreeMap::new();
        targets.insert("cpu".to_string(), 70.0);
        targets.insert("memory".to_string(), 80.0);

        let mut groups = BTreeMap::new();
        groups.insert(
            "default".to_string(),
            AutoscalingGroupConfig {
                image: "/var/lib/libvirt/images/ubuntu-24.04.qcow2".to_string(),
                domain_name: "{group}-{index}".to_string(),
                cloud_init: Some(CloudInit {
                    user_data: "#cloud-config\n".to_string(),
                    ..Default::default()
                }),
                hosts: vec!["hv-1".to_string()],
                replacement: HostReplacementStrategy {
                    strategy: ReplacementKind::RollingUpdate,
                    max_unavailable: 1,
                    max_surge: 1,
                },
                networking: None,
                scaling: ScaleStrategy {
                    min: 1,
                    max: 4,
                    desired: 2,
                    increment: 1,
                    cooldown: 300,
                    method: AggregationMethod::Mean,
                    target_utilization: targets,
                    scale_down_ratio: default_scale_down_ratio(),
                },
                vm: Resources::new(2, 2048, 20),
            },
        );

        ControllerConfig {
            version: "v1alpha1".to_string(),
            controller: Controller {
                databases: Databases {
                    collection_interval: 30,
                    host_connection_timeout: 30,
                    max_host_connection_threads: 4,
                    state: StateDatabase {
                        path: PathBuf::from("/var/lib/vmscale/state.redb"),
                    },
                    timeseries: TimeSeriesDatabase {
                        path: PathBuf::from("/var/lib/vmscale/metrics.redb"),
                        trailing: 10,
                        retention: default_retention(),
                    },
                },
                platform: PlatformConfig {
                    domain: None,
                    token: Some("${VMSCALE_PLATFORM_TOKEN}".to_string()),
                    actions_queue_max_size: 100,
                    buffer_size: default_buffer_size(),
                },
                reconciliation: ReconciliationConfig {
                    interval: 60,
                    replacement_poll_interval: default_poll_interval(),
                    replacement_poll_attempts: default_poll_attempts(),
                },
                executor: ExecutorConfig::default(),
                autoscale: Autoscale {
                    hosts: vec![HostConfig {
                        name: "hv-1".to_string(),
                        address: "192.168.1.10".to_string(),
                        protocol: Protocol::Ssh,
                        port: 22,
                        hypervisor: HypervisorKind::Qemu,
                        user: Some("${USER}".to_string()),
                        resources: Resources::new(16, 65536, 1000),
                    }],
                    groups,
                },
            },
        }
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

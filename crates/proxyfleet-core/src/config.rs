use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default location of the rendered HAProxy configuration.
pub const DEFAULT_HAPROXY_CONFIG: &str = "/haproxy.cfg";

/// Controller configuration, loaded from TOML and/or assembled from CLI flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Directory holding the HAProxy templates.
    pub templates_dir: PathBuf,
    /// Template name within `templates_dir`.
    pub template: String,
    /// Where the rendered HAProxy config is written.
    #[serde(default = "default_haproxy_config")]
    pub haproxy_config: PathBuf,
    /// SSH private key used for every tunnel.
    pub key_file: PathBuf,
    /// Provider key pair name injected into new instances.
    pub key_name: String,
    pub instance_type: String,
    pub image_id: String,
    pub security_group: String,
    /// Number of instances to keep alive.
    pub target_instances: usize,
    /// Age after which a running instance may be rotated out.
    pub ttl_secs: u64,
    pub tunnels_per_instance: usize,
    #[serde(default = "default_loop_interval")]
    pub loop_interval_secs: u64,
    /// First local port handed to tunnels.
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// One past the last local port handed to tunnels.
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Instances allowed above target while scaling up.
    #[serde(default)]
    pub surge: usize,
    #[serde(default = "default_provision_attempts")]
    pub provision_attempts: u32,
    #[serde(default = "default_provision_delay_ms")]
    pub provision_delay_ms: u64,
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
    #[serde(default = "default_haproxy_program")]
    pub haproxy_program: String,
    #[serde(default = "default_aws_program")]
    pub aws_program: String,
    #[serde(default)]
    pub aws_region: Option<String>,
    #[serde(default)]
    pub aws_profile: Option<String>,
}

fn default_haproxy_config() -> PathBuf {
    PathBuf::from(DEFAULT_HAPROXY_CONFIG)
}
fn default_loop_interval() -> u64 {
    60
}
fn default_port_range_start() -> u16 {
    8080
}
fn default_port_range_end() -> u16 {
    8980
}
fn default_provision_attempts() -> u32 {
    5
}
fn default_provision_delay_ms() -> u64 {
    1000
}
fn default_ssh_program() -> String {
    "ssh".to_string()
}
fn default_haproxy_program() -> String {
    "haproxy".to_string()
}
fn default_aws_program() -> String {
    "aws".to_string()
}

impl FleetConfig {
    /// Config with every required field set and everything else defaulted.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        templates_dir: impl Into<PathBuf>,
        template: impl Into<String>,
        key_file: impl Into<PathBuf>,
        key_name: impl Into<String>,
        instance_type: impl Into<String>,
        image_id: impl Into<String>,
        security_group: impl Into<String>,
        target_instances: usize,
        ttl_secs: u64,
        tunnels_per_instance: usize,
    ) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            template: template.into(),
            haproxy_config: default_haproxy_config(),
            key_file: key_file.into(),
            key_name: key_name.into(),
            instance_type: instance_type.into(),
            image_id: image_id.into(),
            security_group: security_group.into(),
            target_instances,
            ttl_secs,
            tunnels_per_instance,
            loop_interval_secs: default_loop_interval(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            surge: 0,
            provision_attempts: default_provision_attempts(),
            provision_delay_ms: default_provision_delay_ms(),
            ssh_program: default_ssh_program(),
            haproxy_program: default_haproxy_program(),
            aws_program: default_aws_program(),
            aws_region: None,
            aws_profile: None,
        }
    }

    /// Load and validate a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fleet config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "Failed to parse fleet config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_instances == 0 {
            anyhow::bail!("target_instances must be at least 1");
        }
        if self.tunnels_per_instance == 0 {
            anyhow::bail!("tunnels_per_instance must be at least 1");
        }
        if self.ttl_secs == 0 {
            anyhow::bail!("ttl_secs must be greater than 0");
        }
        if self.loop_interval_secs == 0 {
            anyhow::bail!("loop_interval_secs must be greater than 0");
        }
        if self.port_range_start >= self.port_range_end {
            anyhow::bail!(
                "Port range {}..{} is empty",
                self.port_range_start,
                self.port_range_end
            );
        }
        let instances = self
            .target_instances
            .checked_add(self.surge)
            .ok_or_else(|| anyhow::anyhow!("target_instances + surge is too large"))?;
        let needed = instances
            .checked_mul(self.tunnels_per_instance)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "{} instances x {} tunnels is too large",
                    instances,
                    self.tunnels_per_instance
                )
            })?;
        let have = self.port_range().len();
        if needed > have {
            anyhow::bail!(
                "Port range {}..{} holds {} ports but {} instances x {} tunnels need {}",
                self.port_range_start,
                self.port_range_end,
                have,
                instances,
                self.tunnels_per_instance,
                needed
            );
        }
        if self.template.is_empty() {
            anyhow::bail!("template name must not be empty");
        }
        Ok(())
    }

    pub fn port_range(&self) -> Range<u16> {
        self.port_range_start..self.port_range_end
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_secs)
    }

    pub fn provision_delay(&self) -> Duration {
        Duration::from_millis(self.provision_delay_ms)
    }

    /// Upper bound on pending + running that scale-up works towards.
    pub fn scale_ceiling(&self) -> usize {
        self.target_instances.saturating_add(self.surge)
    }
}

//! HAProxy configuration rendering and graceful reload.
//!
//! The template is re-read on every render so edits are picked up without
//! restarting the controller. A reload launches a fresh HAProxy with
//! `-sf <old pid>` and keeps the old handle until it has drained.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::node::Node;
use crate::process::{ProcessLauncher, Supervised, terminate_all};
use proxyfleet_core::config::FleetConfig;
use proxyfleet_core::instance::InstanceRecord;
use proxyfleet_core::naming::login_user_for_image;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancerSettings {
    pub templates_dir: PathBuf,
    pub template: String,
    /// Rendered config; HAProxy is always pointed at this path.
    pub config_path: PathBuf,
    pub program: String,
}

impl BalancerSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            templates_dir: config.templates_dir.clone(),
            template: config.template.clone(),
            config_path: config.haproxy_config.clone(),
            program: config.haproxy_program.clone(),
        }
    }
}

/// What a template sees for each running node (`instances` variable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeView {
    pub instance_id: String,
    pub address: String,
    pub login_user: String,
    pub image_id: String,
    pub ports: Vec<u16>,
    pub launch_time: DateTime<Utc>,
}

impl NodeView {
    pub fn from_node(node: &Node) -> Self {
        Self::from_record(node.record(), node.ports().to_vec())
    }

    pub fn from_record(record: &InstanceRecord, ports: Vec<u16>) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            address: record.public_address.clone(),
            login_user: login_user_for_image(&record.image_id).to_string(),
            image_id: record.image_id.clone(),
            ports,
            launch_time: record.launch_time,
        }
    }
}

/// Render the template with `nodes` sorted by instance id.
pub fn render_template(settings: &BalancerSettings, nodes: &[NodeView]) -> Result<String> {
    let template_path = settings.templates_dir.join(&settings.template);
    let template_str = std::fs::read_to_string(&template_path)
        .with_context(|| format!("Failed to read template {}", template_path.display()))?;

    let mut tera = tera::Tera::default();
    tera.autoescape_on(vec![]);
    tera.add_raw_template(&settings.template, &template_str)
        .map_err(|e| anyhow::anyhow!("Failed to parse template {}: {}", settings.template, e))?;

    let mut sorted: Vec<&NodeView> = nodes.iter().collect();
    sorted.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    let mut ctx = tera::Context::new();
    ctx.insert("instances", &sorted);

    tera.render(&settings.template, &ctx)
        .map_err(|e| anyhow::anyhow!("Failed to render template {}: {}", settings.template, e))
}

/// The load-balancer configurator: owns the rendered file and the HAProxy processes.
pub struct LoadBalancer {
    settings: BalancerSettings,
    launcher: Arc<dyn ProcessLauncher>,
    live: Option<Box<dyn Supervised>>,
    draining: Vec<Box<dyn Supervised>>,
    reloads: u64,
}

impl LoadBalancer {
    pub fn new(settings: BalancerSettings, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            settings,
            launcher,
            live: None,
            draining: Vec::new(),
            reloads: 0,
        }
    }

    pub fn live_pid(&self) -> Option<u32> {
        self.live.as_ref().map(|p| p.pid())
    }

    pub fn draining_pids(&self) -> Vec<u32> {
        self.draining.iter().map(|p| p.pid()).collect()
    }

    /// Number of successful reloads since construction.
    pub fn reloads(&self) -> u64 {
        self.reloads
    }

    /// Write the rendered config for `nodes` to the config path.
    pub fn render<'a>(&self, nodes: impl IntoIterator<Item = &'a Node>) -> Result<()> {
        let views: Vec<NodeView> = nodes.into_iter().map(NodeView::from_node).collect();
        let output = render_template(&self.settings, &views)?;
        std::fs::write(&self.settings.config_path, output).with_context(|| {
            format!(
                "Failed to write HAProxy config {}",
                self.settings.config_path.display()
            )
        })?;
        debug!(
            path = %self.settings.config_path.display(),
            nodes = views.len(),
            "Rendered HAProxy config"
        );
        Ok(())
    }

    fn config_arg(&self) -> String {
        self.settings.config_path.display().to_string()
    }

    /// Launch the first HAProxy instance on the current config.
    pub fn start(&mut self) -> Result<()> {
        if self.live.is_some() {
            anyhow::bail!("HAProxy is already running");
        }
        let args = vec![
            "-db".to_string(),
            "-q".to_string(),
            "-f".to_string(),
            self.config_arg(),
        ];
        let process = self
            .launcher
            .launch(&self.settings.program, &args)
            .context("Failed to start HAProxy")?;
        info!(pid = process.pid(), "HAProxy started");
        self.live = Some(process);
        Ok(())
    }

    /// Hand the listening sockets over to a new HAProxy on the current config.
    pub fn reload(&mut self) -> Result<()> {
        self.reap_draining();

        let Some(old_pid) = self.live_pid() else {
            return self.start();
        };
        let args = vec![
            "-db".to_string(),
            "-f".to_string(),
            self.config_arg(),
            "-sf".to_string(),
            old_pid.to_string(),
        ];
        let process = self
            .launcher
            .launch(&self.settings.program, &args)
            .with_context(|| format!("Failed to reload HAProxy (old pid {})", old_pid))?;
        info!(old_pid, new_pid = process.pid(), "HAProxy reloaded");

        if let Some(old) = self.live.replace(process) {
            self.draining.push(old);
        }
        self.reloads += 1;
        Ok(())
    }

    /// Render then reload, so the live process always serves the given set.
    pub fn regenerate<'a>(&mut self, nodes: impl IntoIterator<Item = &'a Node>) -> Result<()> {
        self.render(nodes)?;
        self.reload()
    }

    /// Forget old instances that have finished draining.
    fn reap_draining(&mut self) {
        self.draining.retain_mut(|p| match p.try_exit() {
            Ok(Some(status)) => {
                debug!(pid = p.pid(), %status, "Old HAProxy exited");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = p.pid(), error = %e, "Failed to poll old HAProxy");
                false
            }
        });
    }

    /// Terminate the live and every draining instance.
    pub fn stop(&mut self) {
        let mut processes: Vec<Box<dyn Supervised>> =
            self.live.take().into_iter().chain(self.draining.drain(..)).collect();
        let pids: Vec<u32> = processes.iter().map(|p| p.pid()).collect();
        let failures = terminate_all(processes.iter_mut());
        for (pid, e) in &failures {
            warn!(pid, error = %format!("{:#}", e), "Failed to stop HAProxy");
        }
        if !pids.is_empty() {
            info!(pids = ?pids, "HAProxy stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_mock::FakeLauncher;
    use chrono::TimeZone;
    use proxyfleet_core::instance::InstanceState;
    use proxyfleet_core::ports::PortAllocator;

    const TEMPLATE: &str = "{% for i in instances %}server {{ i.instance_id }} {{ i.address }}{% for p in i.ports %} 127.0.0.1:{{ p }}{% endfor %}\n{% endfor %}";

    fn settings(dir: &tempfile::TempDir) -> BalancerSettings {
        std::fs::write(dir.path().join("haproxy.cfg.tera"), TEMPLATE).unwrap();
        BalancerSettings {
            templates_dir: dir.path().to_path_buf(),
            template: "haproxy.cfg.tera".to_string(),
            config_path: dir.path().join("haproxy.cfg"),
            program: "haproxy".to_string(),
        }
    }

    fn record(id: &str) -> InstanceRecord {
        InstanceRecord {
            instance_id: id.to_string(),
            public_address: format!("{}.example", id),
            state: InstanceState::Running,
            launch_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            image_id: "ami-1".to_string(),
        }
    }

    #[test]
    fn test_render_sorted_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let views = vec![
            NodeView::from_record(&record("i-b"), vec![8081]),
            NodeView::from_record(&record("i-a"), vec![8080]),
        ];
        let out = render_template(&settings, &views).unwrap();
        assert_eq!(
            out,
            "server i-a i-a.example 127.0.0.1:8080\nserver i-b i-b.example 127.0.0.1:8081\n"
        );
    }

    #[test]
    fn test_render_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(render_template(&settings(&dir), &[]).unwrap(), "");
    }

    #[test]
    fn test_render_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(&dir);
        settings.template = "absent.tera".to_string();
        let err = render_template(&settings, &[]).unwrap_err();
        assert!(err.to_string().contains("Failed to read template"));
    }

    #[test]
    fn test_render_writes_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let lb = LoadBalancer::new(settings.clone(), Arc::new(FakeLauncher::new()));
        let mut alloc = PortAllocator::new(9000..9010);
        let node = Node::new(record("i-a"), alloc.allocate(2).unwrap());

        lb.render([&node]).unwrap();
        let written = std::fs::read_to_string(&settings.config_path).unwrap();
        assert_eq!(written, "server i-a i-a.example 127.0.0.1:9000 127.0.0.1:9001\n");
    }

    #[test]
    fn test_reload_hands_off_from_previous_pid() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new();
        let mut lb = LoadBalancer::new(settings(&dir), Arc::new(launcher.clone()));

        lb.start().unwrap();
        let first = lb.live_pid().unwrap();
        lb.reload().unwrap();
        let second = lb.live_pid().unwrap();

        assert_ne!(first, second);
        let launched = launcher.launched("haproxy");
        assert_eq!(launched.len(), 2);
        assert!(launched[0].args.contains(&"-q".to_string()));
        let reload_args = &launched[1].args;
        let sf = reload_args.iter().position(|a| a == "-sf").unwrap();
        assert_eq!(reload_args[sf + 1], first.to_string());
        assert_eq!(lb.draining_pids(), vec![first]);
        assert_eq!(lb.reloads(), 1);
    }

    #[test]
    fn test_reload_reaps_exited_draining_processes() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new();
        let mut lb = LoadBalancer::new(settings(&dir), Arc::new(launcher.clone()));
        lb.start().unwrap();
        let first = lb.live_pid().unwrap();
        lb.reload().unwrap();

        launcher.kill(first);
        lb.reload().unwrap();
        assert_eq!(lb.draining_pids().len(), 1);
        assert!(!lb.draining_pids().contains(&first));
    }

    #[test]
    fn test_reload_without_live_process_starts() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new();
        let mut lb = LoadBalancer::new(settings(&dir), Arc::new(launcher.clone()));
        lb.reload().unwrap();
        assert!(lb.live_pid().is_some());
        assert!(!launcher.launched("haproxy")[0].args.contains(&"-sf".to_string()));
    }

    #[test]
    fn test_stop_terminates_live_and_draining() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new();
        let mut lb = LoadBalancer::new(settings(&dir), Arc::new(launcher.clone()));
        lb.start().unwrap();
        lb.reload().unwrap();
        lb.stop();

        assert!(lb.live_pid().is_none());
        assert!(lb.draining_pids().is_empty());
        assert!(launcher.live("haproxy").is_empty());
    }

    #[test]
    fn test_start_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut lb = LoadBalancer::new(settings(&dir), Arc::new(FakeLauncher::new()));
        lb.start().unwrap();
        assert!(lb.start().is_err());
    }
}

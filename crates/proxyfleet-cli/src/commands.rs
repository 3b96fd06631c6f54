use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand};

use crate::display::InstanceRow;
use crate::logging::{self, LogFormat};
use crate::output::{self, OutputFormat};
use crate::ui;

use proxyfleet_core::config::FleetConfig;
use proxyfleet_core::error::is_drift;
use proxyfleet_core::instance::InstanceState;
use proxyfleet_core::ports::PortAllocator;
use proxyfleet_runtime::balancer::{self, BalancerSettings, NodeView};
use proxyfleet_runtime::process::OsLauncher;
use proxyfleet_runtime::provider::{AwsCliProvider, CloudProvider};
use proxyfleet_runtime::reconcile::Reconciler;
use proxyfleet_runtime::shutdown::ShutdownSignal;

#[derive(Parser)]
#[command(
    name = "proxyfleet",
    version,
    about = "Keep a TTL-rotated pool of EC2 SOCKS proxies behind HAProxy"
)]
struct Cli {
    /// Output format: table, json
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: String,

    /// Log format: human, json
    #[arg(long, global = true, default_value = "human")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconcile loop until interrupted
    Run {
        #[command(flatten)]
        fleet: FleetArgs,
    },
    /// List the provider's instances
    Status {
        /// AWS region (defaults to the CLI's configured region)
        #[arg(long)]
        region: Option<String>,
        /// AWS named profile
        #[arg(long)]
        profile: Option<String>,
        /// Program used to reach the provider
        #[arg(long, default_value = "aws")]
        aws_program: String,
    },
    /// Print the HAProxy config for the currently running instances
    Render {
        #[command(flatten)]
        fleet: FleetArgs,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Fleet settings from flags, optionally layered over a TOML file.
#[derive(Args, Debug, Default, Clone)]
struct FleetArgs {
    /// Fleet config file (TOML); flags given alongside override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding HAProxy templates
    #[arg(long, alias = "templates_dir", required_unless_present = "config")]
    templates_dir: Option<PathBuf>,

    /// HAProxy template name inside the templates directory
    #[arg(long, alias = "haproxy_template", required_unless_present = "config")]
    template: Option<String>,

    /// SSH private key used for every tunnel
    #[arg(long, alias = "keyfile", required_unless_present = "config")]
    key_file: Option<PathBuf>,

    /// EC2 key pair name injected into new instances
    #[arg(long, alias = "ami_keyname", required_unless_present = "config")]
    key_name: Option<String>,

    /// EC2 instance type
    #[arg(long, alias = "ec2_type", required_unless_present = "config")]
    instance_type: Option<String>,

    /// Image to boot new instances from
    #[arg(long, alias = "ec2_img", required_unless_present = "config")]
    image_id: Option<String>,

    /// Security group for new instances
    #[arg(long, alias = "sec_group", required_unless_present = "config")]
    security_group: Option<String>,

    /// Number of instances to keep running
    #[arg(long, alias = "required_instances", required_unless_present = "config")]
    target_instances: Option<usize>,

    /// Seconds after which an instance is replaced
    #[arg(long = "ttl", alias = "instances_ttl", required_unless_present = "config")]
    ttl_secs: Option<u64>,

    /// SOCKS tunnels opened to each instance
    #[arg(long, alias = "tunnels_by_instance", required_unless_present = "config")]
    tunnels_per_instance: Option<usize>,

    /// Seconds between reconcile passes [default: 60]
    #[arg(long = "loop-interval", alias = "loop_time")]
    loop_interval_secs: Option<u64>,

    /// Where the rendered HAProxy config is written [default: /haproxy.cfg]
    #[arg(long)]
    haproxy_config: Option<PathBuf>,

    /// Extra instances allowed above target while scaling up [default: 0]
    #[arg(long)]
    surge: Option<usize>,

    /// AWS region
    #[arg(long)]
    region: Option<String>,

    /// AWS named profile
    #[arg(long)]
    profile: Option<String>,
}

fn required<T>(value: Option<T>, flag: &str) -> Result<T> {
    value.with_context(|| format!("--{} is required without --config", flag))
}

impl FleetArgs {
    /// Merge file values and flags into a validated config.
    fn resolve(self) -> Result<FleetConfig> {
        let mut config = match &self.config {
            Some(path) => FleetConfig::from_file(path)?,
            None => FleetConfig::new(
                required(self.templates_dir.clone(), "templates-dir")?,
                required(self.template.clone(), "template")?,
                required(self.key_file.clone(), "key-file")?,
                required(self.key_name.clone(), "key-name")?,
                required(self.instance_type.clone(), "instance-type")?,
                required(self.image_id.clone(), "image-id")?,
                required(self.security_group.clone(), "security-group")?,
                required(self.target_instances, "target-instances")?,
                required(self.ttl_secs, "ttl")?,
                required(self.tunnels_per_instance, "tunnels-per-instance")?,
            ),
        };

        if let Some(v) = self.templates_dir {
            config.templates_dir = v;
        }
        if let Some(v) = self.template {
            config.template = v;
        }
        if let Some(v) = self.key_file {
            config.key_file = v;
        }
        if let Some(v) = self.key_name {
            config.key_name = v;
        }
        if let Some(v) = self.instance_type {
            config.instance_type = v;
        }
        if let Some(v) = self.image_id {
            config.image_id = v;
        }
        if let Some(v) = self.security_group {
            config.security_group = v;
        }
        if let Some(v) = self.target_instances {
            config.target_instances = v;
        }
        if let Some(v) = self.ttl_secs {
            config.ttl_secs = v;
        }
        if let Some(v) = self.tunnels_per_instance {
            config.tunnels_per_instance = v;
        }
        if let Some(v) = self.loop_interval_secs {
            config.loop_interval_secs = v;
        }
        if let Some(v) = self.haproxy_config {
            config.haproxy_config = v;
        }
        if let Some(v) = self.surge {
            config.surge = v;
        }
        if self.region.is_some() {
            config.aws_region = self.region;
        }
        if self.profile.is_some() {
            config.aws_profile = self.profile;
        }

        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Command dispatch
// ============================================================================

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    logging::init(LogFormat::from_str_arg(&cli.log_format));
    let out_fmt = OutputFormat::from_str_arg(&cli.output);

    match cli.command {
        Commands::Run { fleet } => cmd_run(fleet),
        Commands::Status {
            region,
            profile,
            aws_program,
        } => cmd_status(&aws_program, region, profile, out_fmt),
        Commands::Render { fleet } => cmd_render(fleet),
        Commands::Completions { shell } => cmd_completions(shell),
    }
}

/// Fail early if a program the controller shells out to is missing.
fn preflight(config: &FleetConfig) -> Result<()> {
    for program in [
        &config.ssh_program,
        &config.haproxy_program,
        &config.aws_program,
    ] {
        which::which(program)
            .map_err(|_| anyhow::anyhow!("'{}' not found on PATH", program))?;
    }
    Ok(())
}

fn cmd_run(args: FleetArgs) -> Result<()> {
    let config = args.resolve()?;
    preflight(&config)?;

    ui::info(&format!(
        "Keeping {} instance(s) with {} tunnel(s) each, TTL {}s, checking every {}s",
        config.target_instances,
        config.tunnels_per_instance,
        config.ttl_secs,
        config.loop_interval_secs
    ));

    let shutdown = ShutdownSignal::install()?;
    let provider = AwsCliProvider::from_config(&config);
    let mut fleet = Reconciler::new(config, Box::new(provider), Arc::new(OsLauncher));

    match fleet.run(&shutdown) {
        Ok(()) => {
            ui::success("Tunnels and HAProxy stopped");
            Ok(())
        }
        Err(e) if is_drift(&e) => {
            ui::error("Untracked instances detected; stopped without touching them");
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn cmd_status(
    aws_program: &str,
    region: Option<String>,
    profile: Option<String>,
    out_fmt: OutputFormat,
) -> Result<()> {
    let provider = AwsCliProvider::new(aws_program).with_region(region).with_profile(profile);
    let mut records = provider.describe_instances(None)?;
    records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    if records.is_empty() && out_fmt == OutputFormat::Table {
        ui::warn("No instances reported by the provider");
        return Ok(());
    }

    let now = Utc::now();
    let rows: Vec<InstanceRow> = records.iter().map(|r| InstanceRow::new(r, now)).collect();
    output::render_list(&rows, out_fmt);
    Ok(())
}

/// Render for the running instances, assigning ports the way startup would.
fn render_running(provider: &dyn CloudProvider, config: &FleetConfig) -> Result<String> {
    let mut records: Vec<_> = provider
        .describe_instances(None)?
        .into_iter()
        .filter(|r| r.state.is_active())
        .collect();
    records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    let mut ports = PortAllocator::new(config.port_range());
    let mut views = Vec::new();
    for record in &records {
        let block = ports.allocate(config.tunnels_per_instance)?;
        if record.state == InstanceState::Running {
            views.push(NodeView::from_record(record, block.ports().to_vec()));
        }
    }
    balancer::render_template(&BalancerSettings::from_config(config), &views)
}

fn cmd_render(args: FleetArgs) -> Result<()> {
    let config = args.resolve()?;
    let provider = AwsCliProvider::from_config(&config);
    print!("{}", render_running(&provider, &config)?);
    Ok(())
}

fn cmd_completions(shell: clap_complete::Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "proxyfleet", &mut std::io::stdout());
    Ok(())
}

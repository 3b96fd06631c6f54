//! Cloud provisioning API.
//!
//! `AwsCliProvider` shells out to the `aws` CLI and decodes its JSON output.
//! `provider_mock::FakeCloud` is the in-memory double used by tests.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::shell;
use proxyfleet_core::config::FleetConfig;
use proxyfleet_core::instance::{InstanceRecord, InstanceState};

/// Parameters for launching one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image_id: String,
    pub key_name: String,
    pub security_group: String,
    pub instance_type: String,
}

impl LaunchSpec {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            image_id: config.image_id.clone(),
            key_name: config.key_name.clone(),
            security_group: config.security_group.clone(),
            instance_type: config.instance_type.clone(),
        }
    }
}

/// The three provider calls the controller depends on.
pub trait CloudProvider: Send {
    /// Describe the given instances, or every instance when `ids` is `None`.
    fn describe_instances(&self, ids: Option<&[String]>) -> Result<Vec<InstanceRecord>>;

    /// Request a single new instance and return its identifier.
    fn create_instance(&self, spec: &LaunchSpec) -> Result<String>;

    fn terminate_instances(&self, ids: &[String]) -> Result<()>;
}

/// EC2 through the `aws` command line client.
pub struct AwsCliProvider {
    program: String,
    region: Option<String>,
    profile: Option<String>,
}

impl AwsCliProvider {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            region: None,
            profile: None,
        }
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(config.aws_program.clone())
            .with_region(config.aws_region.clone())
            .with_profile(config.aws_profile.clone())
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    /// `ec2 <subcommand> --output json` plus region/profile selection.
    fn ec2_args(&self, subcommand: &str) -> Vec<String> {
        let mut args = vec![
            "ec2".to_string(),
            subcommand.to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        if let Some(region) = &self.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        if let Some(profile) = &self.profile {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        args
    }
}

impl CloudProvider for AwsCliProvider {
    fn describe_instances(&self, ids: Option<&[String]>) -> Result<Vec<InstanceRecord>> {
        let mut args = self.ec2_args("describe-instances");
        if let Some(ids) = ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            args.push("--instance-ids".to_string());
            args.extend(ids.iter().cloned());
        }
        let output: DescribeOutput = shell::run_host_json(&self.program, &args)
            .with_context(|| "Failed to describe instances")?;
        output.into_records()
    }

    fn create_instance(&self, spec: &LaunchSpec) -> Result<String> {
        let mut args = self.ec2_args("run-instances");
        args.extend([
            "--image-id".to_string(),
            spec.image_id.clone(),
            "--key-name".to_string(),
            spec.key_name.clone(),
            "--security-group-ids".to_string(),
            spec.security_group.clone(),
            "--instance-type".to_string(),
            spec.instance_type.clone(),
            "--count".to_string(),
            "1".to_string(),
        ]);
        let output: RunOutput = shell::run_host_json(&self.program, &args)
            .with_context(|| format!("Failed to create instance from {}", spec.image_id))?;
        output.instance_id()
    }

    fn terminate_instances(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = self.ec2_args("terminate-instances");
        args.push("--instance-ids".to_string());
        args.extend(ids.iter().cloned());
        shell::run_host_stdout(&self.program, &args)
            .with_context(|| format!("Failed to terminate {}", ids.join(", ")))?;
        Ok(())
    }
}

// ============================================================================
// EC2 JSON shapes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    image_id: String,
    state: Ec2State,
    launch_time: DateTime<Utc>,
    #[serde(default)]
    public_dns_name: Option<String>,
    #[serde(default)]
    public_ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2State {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunOutput {
    #[serde(default)]
    instances: Vec<RunInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstance {
    instance_id: String,
}

impl DescribeOutput {
    fn into_records(self) -> Result<Vec<InstanceRecord>> {
        self.reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(Ec2Instance::into_record)
            .collect()
    }
}

impl Ec2Instance {
    fn into_record(self) -> Result<InstanceRecord> {
        let state: InstanceState = self
            .state
            .name
            .parse()
            .with_context(|| format!("Instance {}", self.instance_id))?;
        let public_address = self
            .public_dns_name
            .filter(|s| !s.is_empty())
            .or(self.public_ip_address)
            .unwrap_or_default();
        Ok(InstanceRecord {
            instance_id: self.instance_id,
            public_address,
            state,
            launch_time: self.launch_time,
            image_id: self.image_id,
        })
    }
}

impl RunOutput {
    fn instance_id(self) -> Result<String> {
        self.instances
            .into_iter()
            .next()
            .map(|i| i.instance_id)
            .context("run-instances returned no instances")
    }
}

/// Decode `aws ec2 describe-instances` output.
pub fn parse_describe_output(json: &str) -> Result<Vec<InstanceRecord>> {
    let output: DescribeOutput =
        serde_json::from_str(json).with_context(|| "Invalid describe-instances JSON")?;
    output.into_records()
}

/// Decode `aws ec2 run-instances` output into the new instance's identifier.
pub fn parse_run_output(json: &str) -> Result<String> {
    let output: RunOutput =
        serde_json::from_str(json).with_context(|| "Invalid run-instances JSON")?;
    output.instance_id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxyfleet_core::error::FleetError;

    const DESCRIBE: &str = r#"{
        "Reservations": [
            {
                "Instances": [
                    {
                        "InstanceId": "i-0a1b2c3d",
                        "ImageId": "ami-9cc0d5f8",
                        "State": { "Code": 16, "Name": "running" },
                        "LaunchTime": "2024-05-01T10:00:00+00:00",
                        "PublicDnsName": "ec2-1-2-3-4.compute.amazonaws.com",
                        "PublicIpAddress": "1.2.3.4"
                    }
                ]
            },
            {
                "Instances": [
                    {
                        "InstanceId": "i-0e0f0000",
                        "ImageId": "ami-11111111",
                        "State": { "Code": 0, "Name": "pending" },
                        "LaunchTime": "2024-05-01T10:05:00.000Z",
                        "PublicDnsName": ""
                    },
                    {
                        "InstanceId": "i-0e0f0001",
                        "ImageId": "ami-11111111",
                        "State": { "Code": 16, "Name": "running" },
                        "LaunchTime": "2024-05-01T10:06:00.000Z",
                        "PublicDnsName": "",
                        "PublicIpAddress": "5.6.7.8"
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_describe_flattens_reservations() {
        let records = parse_describe_output(DESCRIBE).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].instance_id, "i-0a1b2c3d");
        assert_eq!(records[0].state, InstanceState::Running);
        assert_eq!(records[0].public_address, "ec2-1-2-3-4.compute.amazonaws.com");
        assert_eq!(records[1].state, InstanceState::Pending);
        assert_eq!(records[1].public_address, "");
        // Falls back to the public IP when there is no DNS name.
        assert_eq!(records[2].public_address, "5.6.7.8");
    }

    #[test]
    fn test_parse_describe_launch_time() {
        let records = parse_describe_output(DESCRIBE).unwrap();
        assert_eq!(
            records[0].launch_time.to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
        assert!(records[0].launch_time < records[1].launch_time);
    }

    #[test]
    fn test_parse_describe_empty() {
        assert!(parse_describe_output(r#"{"Reservations": []}"#)
            .unwrap()
            .is_empty());
        assert!(parse_describe_output("{}").unwrap().is_empty());
    }

    #[test]
    fn test_parse_describe_unknown_state() {
        let json = DESCRIBE.replace("\"pending\"", "\"hibernating\"");
        let err = parse_describe_output(&json).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FleetError>(),
            Some(FleetError::UnknownInstanceState(s)) if s == "hibernating"
        ));
    }

    #[test]
    fn test_parse_run_output() {
        let json = r#"{"Groups": [], "Instances": [{"InstanceId": "i-0new", "State": {"Name": "pending"}}]}"#;
        assert_eq!(parse_run_output(json).unwrap(), "i-0new");
        assert!(parse_run_output(r#"{"Instances": []}"#).is_err());
    }

    #[test]
    fn test_ec2_args_with_region_and_profile() {
        let mut provider = AwsCliProvider::new("aws");
        assert_eq!(
            provider.ec2_args("describe-instances"),
            vec!["ec2", "describe-instances", "--output", "json"]
        );
        provider.region = Some("eu-west-1".to_string());
        provider.profile = Some("proxies".to_string());
        let args = provider.ec2_args("terminate-instances");
        assert!(args.ends_with(&[
            "--region".to_string(),
            "eu-west-1".to_string(),
            "--profile".to_string(),
            "proxies".to_string()
        ]));
    }

    #[test]
    fn test_empty_id_lists_skip_the_cli() {
        let provider = AwsCliProvider::new("proxyfleet-no-such-binary");
        assert!(provider.describe_instances(Some(&[])).unwrap().is_empty());
        provider.terminate_instances(&[]).unwrap();
    }

    #[test]
    fn test_launch_spec_from_config() {
        let config = FleetConfig::new(
            "/t", "h.tera", "/k.pem", "kp", "t2.micro", "ami-1", "sg-1", 1, 60, 1,
        );
        let spec = LaunchSpec::from_config(&config);
        assert_eq!(spec.image_id, "ami-1");
        assert_eq!(spec.key_name, "kp");
        assert_eq!(spec.security_group, "sg-1");
        assert_eq!(spec.instance_type, "t2.micro");
    }
}

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::process::{Command, Output};

/// Run a command on the host, capturing output.
pub fn run_host(cmd: &str, args: &[String]) -> Result<Output> {
    Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run: {}", display_command(cmd, args)))
}

/// Run a command on the host and fail on a non-zero exit, returning stdout.
pub fn run_host_stdout(cmd: &str, args: &[String]) -> Result<String> {
    let output = run_host(cmd, args)?;
    if !output.status.success() {
        anyhow::bail!(
            "Command failed (exit {}): {}: {}",
            output.status.code().unwrap_or(-1),
            display_command(cmd, args),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Run a command whose stdout is a JSON document and decode it.
pub fn run_host_json<T: DeserializeOwned>(cmd: &str, args: &[String]) -> Result<T> {
    let stdout = run_host_stdout(cmd, args)?;
    serde_json::from_str(&stdout)
        .with_context(|| format!("Failed to parse JSON from: {}", display_command(cmd, args)))
}

/// Render a command line for log and error messages.
pub fn display_command(cmd: &str, args: &[String]) -> String {
    if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{} {}", cmd, args.join(" "))
    }
}

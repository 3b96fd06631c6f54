use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FleetError;

/// Provider-side lifecycle state of a compute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    /// Pending or running: the instance costs money and must be tracked.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl FromStr for InstanceState {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "shutting-down" => Ok(Self::ShuttingDown),
            "terminated" => Ok(Self::Terminated),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            other => Err(FleetError::UnknownInstanceState(other.to_string())),
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting-down"),
            Self::Terminated => write!(f, "terminated"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Immutable snapshot of what the provider last said about an instance.
///
/// Replaced wholesale on every poll, never patched field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    /// Public DNS name, or public IP when the provider has no DNS name.
    pub public_address: String,
    pub state: InstanceState,
    pub launch_time: DateTime<Utc>,
    pub image_id: String,
}

/// Controller-side phase of a tracked node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePhase {
    Pending,
    Running,
    Removed,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// What the reconciler must do with a node after a provider refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing changes this tick.
    Stay,
    /// Pending -> Running: start tunnels, join the load balancer.
    Promote,
    /// Running -> Removed: tear down and leave the load balancer.
    Demote,
    /// Pending -> Removed: the instance died before it ever ran.
    Discard,
}

/// The single transition function for the node state machine.
///
/// Every provider state is matched explicitly, so a new variant fails to
/// compile here instead of falling through.
pub fn next_transition(phase: NodePhase, observed: InstanceState) -> Transition {
    match (phase, observed) {
        (NodePhase::Pending, InstanceState::Pending) => Transition::Stay,
        (NodePhase::Pending, InstanceState::Running) => Transition::Promote,
        (
            NodePhase::Pending,
            InstanceState::ShuttingDown
            | InstanceState::Terminated
            | InstanceState::Stopping
            | InstanceState::Stopped,
        ) => Transition::Discard,
        (NodePhase::Running, InstanceState::Running) => Transition::Stay,
        (
            NodePhase::Running,
            InstanceState::Pending
            | InstanceState::ShuttingDown
            | InstanceState::Terminated
            | InstanceState::Stopping
            | InstanceState::Stopped,
        ) => Transition::Demote,
        (NodePhase::Removed, _) => Transition::Stay,
    }
}

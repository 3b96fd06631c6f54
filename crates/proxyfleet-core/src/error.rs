use thiserror::Error;

/// Faults the controller must be able to tell apart by type.
///
/// Everything else travels as plain `anyhow::Error` with context attached.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FleetError {
    #[error("port pool exhausted: requested {requested} ports, {available} available")]
    PortPoolExhausted { requested: usize, available: usize },

    #[error(
        "provider reports {reported} active instances but only {tracked} are tracked; refusing to continue"
    )]
    Drift { reported: usize, tracked: usize },

    #[error("unknown instance state reported by provider: {0:?}")]
    UnknownInstanceState(String),

    #[error("tunnels for instance {0} are already running; stop them first")]
    TunnelsAlreadyRunning(String),

    #[error("instance {0} is already tracked")]
    DuplicateNode(String),

    #[error("instance {0} is no longer reported by the provider")]
    InstanceVanished(String),
}

/// True if `err` (or anything in its context chain) is a drift halt.
pub fn is_drift(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::Drift { .. })
    )
}

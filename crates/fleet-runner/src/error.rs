use thiserror::Error;

/// Fatal failure classes of a batch session. Per-run failures are not errors
/// at this level; they are recorded in [`crate::RunStatus::Failed`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FleetError {
    /// Invalid request, detected before any filesystem side effect.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Sandbox creation, copy or manifest failure.
    #[error("provisioning error: {0}")]
    Provisioning(String),
    /// Worker pool could not be started or lost its workers.
    #[error("worker pool error: {0}")]
    Pool(String),
}

impl FleetError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Provisioning(_) => "provisioning",
            Self::Pool(_) => "pool",
        }
    }
}

pub(crate) fn config_error(message: impl Into<String>) -> anyhow::Error {
    FleetError::Configuration(message.into()).into()
}

pub(crate) fn provisioning_error(err: anyhow::Error) -> anyhow::Error {
    if err.downcast_ref::<FleetError>().is_some() {
        return err;
    }
    FleetError::Provisioning(format!("{:#}", err)).into()
}

pub(crate) fn pool_error(message: impl Into<String>) -> anyhow::Error {
    FleetError::Pool(message.into()).into()
}

/// Returns the classification of a fatal error, if it carries one.
pub fn error_kind(err: &anyhow::Error) -> Option<&'static str> {
    err.downcast_ref::<FleetError>().map(FleetError::kind)
}

use kalypso_contract::ContractError;

/// Every way a registry operation or a dispatch can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Unknown model name.
    #[error("model '{0}' not found")]
    NotFound(String),
    /// Known model, unknown version.
    #[error("model '{model}' has no version {version}")]
    VersionNotFound {
        /// model name
        model: String,
        /// requested version
        version: u64,
    },
    /// The version exists but is not serving.
    #[error("model '{model}' version {version} is not ready")]
    NotReady {
        /// model name
        model: String,
        /// version that was resolved
        version: u64,
    },
    /// The request does not satisfy the model contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Concurrency limit exceeded.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The executor failed or broke its contract.
    #[error("internal error: {0}")]
    Internal(String),
    /// Caller aborted the request before execution started.
    #[error("request cancelled")]
    Cancelled,
    /// Registering a version that is already present.
    #[error("model '{model}' version {version} already exists")]
    AlreadyExists {
        /// model name
        model: String,
        /// version
        version: u64,
    },
}

impl Error {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::VersionNotFound { .. } => "version_not_found",
            Error::NotReady { .. } => "not_ready",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Unavailable(_) => "unavailable",
            Error::Internal(_) => "internal",
            Error::Cancelled => "cancelled",
            Error::AlreadyExists { .. } => "already_exists",
        }
    }
}

impl From<ContractError> for Error {
    fn from(err: ContractError) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

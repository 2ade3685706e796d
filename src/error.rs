use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Notification store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Backend request timed out")]
    Timeout,
    #[error("Transient backend error {code}: {description}")]
    Transient { code: String, description: String },
    #[error("Backend rejected notification {code}: {description}")]
    BackendRejected { code: String, description: String },
    #[error("Credential expired: {0}")]
    CredentialExpired(String),
    #[error("Credential revoked: {0}")]
    CredentialRevoked(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors worth another attempt later. The notification is not failed outright.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Connection(_) | Self::Timeout | Self::Transient { .. })
    }

    /// Errors that stop delivery for a whole app until its credentials are replaced.
    #[must_use]
    pub const fn is_app_fatal(&self) -> bool {
        matches!(self, Self::CredentialExpired(_) | Self::CredentialRevoked(_))
    }

    /// Short machine-readable code, stored on failed notifications.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::StoreUnavailable(_) => "store_unavailable".to_string(),
            Self::Connection(_) => "connection_error".to_string(),
            Self::Timeout => "timeout".to_string(),
            Self::Transient { code, .. } | Self::BackendRejected { code, .. } => code.clone(),
            Self::CredentialExpired(_) => "credential_expired".to_string(),
            Self::CredentialRevoked(_) => "credential_revoked".to_string(),
            Self::Configuration(_) => "configuration_error".to_string(),
            Self::NotFound(_) => "not_found".to_string(),
            Self::Internal(_) => "internal_error".to_string(),
        }
    }

    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::Transient { description, .. } | Self::BackendRejected { description, .. } => description.clone(),
            other => other.to_string(),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::StoreUnavailable(format!("corrupt record: {e}"))
    }
}

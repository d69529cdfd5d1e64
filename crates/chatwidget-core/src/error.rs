use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable failure code carried by every [`WidgetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConfigurationError,
    ContainerNotFound,
    IframeLoadFailed,
    AuthFailed,
    PopupBlocked,
    NetworkError,
    Timeout,
    CrossOriginError,
    InitializationFailed,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::ContainerNotFound => "CONTAINER_NOT_FOUND",
            Self::IframeLoadFailed => "IFRAME_LOAD_FAILED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::PopupBlocked => "POPUP_BLOCKED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::CrossOriginError => "CROSS_ORIGIN_ERROR",
            Self::InitializationFailed => "INITIALIZATION_FAILED",
        }
    }

    /// Transient codes; the init sequence may succeed if re-run.
    #[must_use]
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::Timeout | Self::IframeLoadFailed | Self::ContainerNotFound
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message} ({code}, retryable={retryable})")]
pub struct WidgetError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl WidgetError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.default_retryable(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }

    pub fn container_not_found(container_id: &str) -> Self {
        Self::new(
            ErrorCode::ContainerNotFound,
            format!("mount element #{container_id} was not found"),
        )
    }

    pub fn iframe_load_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::IframeLoadFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// The browser refused to deliver a message to the chat frame.
    pub fn cross_origin(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CrossOriginError, message)
    }

    pub fn initialization_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InitializationFailed, message)
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

use core::fmt;

use serde::Serialize;

use crate::app_state::FromTruncated;

/// Bounded description attached to [`ConnectionStatus::Error`]
pub type StatusReason = heapless::String<64>;

/// Connection state of one source connector.
///
/// `Disconnected -> Connecting -> Connected`, `Connected -> Error -> Connecting`
/// while retrying, and back to `Disconnected` only on explicit shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(StatusReason),
}

impl ConnectionStatus {
    /// Build an error status, truncating long reasons on a char boundary
    pub fn error(reason: impl fmt::Display) -> Self {
        Self::Error(StatusReason::from_truncated(reason.to_string().as_str()))
    }

    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Get a short label for display
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Error(_) => "Connection error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "{}: {}", self.label(), reason),
            other => f.write_str(other.label()),
        }
    }
}

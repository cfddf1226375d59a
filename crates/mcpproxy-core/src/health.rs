//! Runtime status types shared by [`crate::connection::CoreConnection`],
//! [`crate::managed_client::ManagedClient`] and [`crate::diagnostics`].

use serde::{Deserialize, Serialize};

/// Connection lifecycle state of one [`crate::managed_client::ManagedClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Error,
}

/// Authentication state of one managed client, independent of whether the
/// transport itself is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthState {
    None,
    Authenticated,
    Expired,
    Error,
}

/// The single next-action enum consumed by the REST surface and the
/// diagnostics aggregator. `""` means no action is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthAction {
    Login,
    Restart,
    Enable,
    Approve,
    ViewLogs,
    SetSecret,
    Configure,
    None,
}

impl HealthAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Restart => "restart",
            Self::Enable => "enable",
            Self::Approve => "approve",
            Self::ViewLogs => "view_logs",
            Self::SetSecret => "set_secret",
            Self::Configure => "configure",
            Self::None => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
}

/// Unified health for one managed client. `action` is the single
/// source of truth the REST surface and [`crate::diagnostics`] consume —
/// everything else here is presentation detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub level: HealthLevel,
    pub admin_state: AdminState,
    pub summary: String,
    pub detail: Option<String>,
    pub action: HealthAction,
}

/// Administrative posture of a server, independent of its runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminState {
    Enabled,
    Disabled,
    Quarantined,
}

impl HealthStatus {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            level: HealthLevel::Disabled,
            admin_state: AdminState::Disabled,
            summary: "server is disabled".to_string(),
            detail: None,
            action: HealthAction::Enable,
        }
    }

    #[must_use]
    pub fn quarantined() -> Self {
        Self {
            level: HealthLevel::Disabled,
            admin_state: AdminState::Quarantined,
            summary: "server is quarantined".to_string(),
            detail: None,
            action: HealthAction::Approve,
        }
    }

    #[must_use]
    pub fn healthy() -> Self {
        Self {
            level: HealthLevel::Healthy,
            admin_state: AdminState::Enabled,
            summary: "connected".to_string(),
            detail: None,
            action: HealthAction::None,
        }
    }

    #[must_use]
    pub fn auth_required(detail: impl Into<String>) -> Self {
        Self {
            level: HealthLevel::Degraded,
            admin_state: AdminState::Enabled,
            summary: "authentication required".to_string(),
            detail: Some(detail.into()),
            action: HealthAction::Login,
        }
    }

    #[must_use]
    pub fn needs_restart(detail: impl Into<String>) -> Self {
        Self {
            level: HealthLevel::Unhealthy,
            admin_state: AdminState::Enabled,
            summary: "connection broken".to_string(),
            detail: Some(detail.into()),
            action: HealthAction::Restart,
        }
    }

    #[must_use]
    pub fn missing_secret(detail: impl Into<String>) -> Self {
        Self {
            level: HealthLevel::Degraded,
            admin_state: AdminState::Enabled,
            summary: "missing required secret".to_string(),
            detail: Some(detail.into()),
            action: HealthAction::SetSecret,
        }
    }

    #[must_use]
    pub fn misconfigured(detail: impl Into<String>) -> Self {
        Self {
            level: HealthLevel::Degraded,
            admin_state: AdminState::Enabled,
            summary: "configuration issue".to_string(),
            detail: Some(detail.into()),
            action: HealthAction::Configure,
        }
    }

    /// True when `action` is one of the values the universal startup
    /// property allows as an alternative to `ready`.
    #[must_use]
    pub fn is_acceptable_non_ready(&self) -> bool {
        matches!(
            self.action,
            HealthAction::Login
                | HealthAction::Configure
                | HealthAction::SetSecret
                | HealthAction::Restart
                | HealthAction::ViewLogs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_health_suggests_enable() {
        assert_eq!(HealthStatus::disabled().action, HealthAction::Enable);
    }

    #[test]
    fn auth_required_is_an_acceptable_non_ready_state() {
        assert!(HealthStatus::auth_required("token expired").is_acceptable_non_ready());
    }

    #[test]
    fn healthy_has_no_action() {
        assert_eq!(HealthStatus::healthy().action.as_str(), "");
    }
}

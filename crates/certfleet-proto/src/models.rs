//! Instance and managed-item models shared across the fleet

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Identity and liveness info reported by an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    /// Stable instance identifier; empty until identity binding completes
    pub instance_id: String,
    /// Human-readable name shown on the dashboard
    pub title: String,
    pub os: String,
    pub client_version: String,
    /// Last time this instance answered the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reported: Option<DateTime<Utc>>,
}

impl Default for InstanceInfo {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            title: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            last_reported: None,
        }
    }
}

impl InstanceInfo {
    /// Placeholder registered for a connection that has not answered
    /// `GetInstanceInfo` yet
    pub fn pending() -> Self {
        Self {
            instance_id: String::new(),
            title: "(pending identification)".to_string(),
            os: String::new(),
            client_version: String::new(),
            last_reported: None,
        }
    }

    pub fn is_identified(&self) -> bool {
        !self.instance_id.is_empty()
    }
}

/// Health of one managed item, as last reported by its instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub enum ItemHealth {
    /// Certificate present and renewing normally
    Ok,
    /// Renewal succeeded with warnings or is due soon
    Warning,
    /// Last renewal attempt failed
    Error,
    /// Blocked on a manual step (DNS challenge, account approval)
    AwaitingUser,
    /// No certificate has been requested yet
    #[default]
    NoCertificate,
}

impl ItemHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemHealth::Ok => "ok",
            ItemHealth::Warning => "warning",
            ItemHealth::Error => "error",
            ItemHealth::AwaitingUser => "awaitingUser",
            ItemHealth::NoCertificate => "noCertificate",
        }
    }
}

impl std::fmt::Display for ItemHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One certificate (or certificate request) managed by an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ManagedItem {
    pub id: String,
    pub name: String,
    /// Domains covered by this item, primary first
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub health: ItemHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_expiry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_renewed: Option<DateTime<Utc>>,
    /// Message from the most recent renewal or test run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status_message: Option<String>,
    #[serde(default = "default_true")]
    pub auto_renew: bool,
}

fn default_true() -> bool {
    true
}

impl ManagedItem {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            domains: Vec::new(),
            health: ItemHealth::NoCertificate,
            date_expiry: None,
            date_renewed: None,
            last_status_message: None,
            auto_renew: true,
        }
    }

    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }

    pub fn with_health(mut self, health: ItemHealth) -> Self {
        self.health = health;
        self
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.date_expiry = Some(expiry);
        self
    }

    /// Primary domain, when any is configured
    pub fn primary_domain(&self) -> Option<&str> {
        self.domains.first().map(|d| d.as_str())
    }
}

/// Payload of a `GetInstanceItems` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct InstanceItems {
    pub instance_id: String,
    pub items: Vec<ManagedItem>,
}

/// One row of output from a configuration test run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ActionStep {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub has_error: bool,
    #[serde(default)]
    pub has_warning: bool,
}

impl ActionStep {
    pub fn ok(title: &str, description: &str) -> Self {
        Self {
            title: title.to_string(),
            description: description.to_string(),
            has_error: false,
            has_warning: false,
        }
    }

    pub fn error(title: &str, description: &str) -> Self {
        Self {
            has_error: true,
            ..Self::ok(title, description)
        }
    }

    pub fn warning(title: &str, description: &str) -> Self {
        Self {
            has_warning: true,
            ..Self::ok(title, description)
        }
    }
}

/// Health counters for a set of managed items
///
/// Computed on demand from cached items; a fleet-wide summary is the
/// column-wise sum over connected instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub total: u32,
    pub error: u32,
    pub warning: u32,
    pub awaiting_user: u32,
    pub healthy: u32,
    pub no_certificate: u32,
}

impl StatusSummary {
    /// Summarize one instance's item list
    pub fn of(items: &[ManagedItem]) -> Self {
        let mut summary = Self {
            total: items.len() as u32,
            ..Self::default()
        };
        for item in items {
            match item.health {
                ItemHealth::Ok => summary.healthy += 1,
                ItemHealth::Warning => summary.warning += 1,
                ItemHealth::Error => summary.error += 1,
                ItemHealth::AwaitingUser => summary.awaiting_user += 1,
                ItemHealth::NoCertificate => summary.no_certificate += 1,
            }
        }
        summary
    }

    /// Accumulate another instance's counters into this one
    pub fn merge(&mut self, other: &StatusSummary) {
        self.total += other.total;
        self.error += other.error;
        self.warning += other.warning;
        self.awaiting_user += other.awaiting_user;
        self.healthy += other.healthy;
        self.no_certificate += other.no_certificate;
    }
}

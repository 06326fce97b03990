//! Management facade over the hub and registry
//!
//! Every remote operation here is a correlated round trip: register a
//! waiter, dispatch over the push channel, await the result under a bounded
//! timeout. A command that never gets an answer yields an explicit empty
//! result instead of hanging, and leaves no correlation state behind.

use certfleet_hub::{HubError, ManagementHub};
use certfleet_proto::{
    ActionStep, CommandRequest, CommandResult, InstanceInfo, ManagedItem, StatusSummary,
};
use std::time::Duration;
use tracing::{debug, warn};

/// Default bound for one command round trip
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

/// Upper cap on log lines fetched per request
const MAX_LOG_LINES: usize = 1000;

/// Errors surfaced by management operations
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("instance {0} is not connected")]
    InstanceNotConnected(String),

    #[error("instance {0} did not respond in time")]
    NoResponse(String),

    #[error("instance returned an unusable payload: {0}")]
    BadPayload(#[from] certfleet_proto::ProtoError),

    #[error("push channel send failed: {0}")]
    ChannelClosed(String),
}

impl From<HubError> for CommandError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::InstanceNotConnected(id) => CommandError::InstanceNotConnected(id),
            HubError::ConnectionNotAttached(id) => CommandError::InstanceNotConnected(id),
            HubError::ChannelClosed(reason) => CommandError::ChannelClosed(reason),
        }
    }
}

/// High-level management operations for API callers
#[derive(Clone)]
pub struct ManagementApi {
    hub: ManagementHub,
    command_timeout: Duration,
}

impl ManagementApi {
    pub fn new(hub: ManagementHub) -> Self {
        Self {
            hub,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    /// Run one command against an instance and wait for its result
    ///
    /// Fails fast when the instance is not connected. On timeout the waiter
    /// and the awaited entry are purged and the caller gets an explicit
    /// empty result; a late answer then falls through as unmatched.
    pub async fn get_command_result(
        &self,
        instance_id: &str,
        request: CommandRequest,
    ) -> Result<CommandResult, CommandError> {
        let command_id = request.command_id;
        let command_type = request.command_type;
        let rx = self.hub.waiters().register(command_id);

        if let Err(e) = self.hub.dispatch(instance_id, request).await {
            self.hub.waiters().cancel(command_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => {
                // Waiter sender dropped without a result; treat as no response.
                self.hub.registry().take_awaited(&command_id);
                Ok(CommandResult::empty(command_id))
            }
            Err(_) => {
                warn!(
                    instance_id = %instance_id,
                    command_id = %command_id,
                    command_type = %command_type,
                    timeout_secs = self.command_timeout.as_secs(),
                    "Command timed out without a response"
                );
                self.hub.waiters().cancel(command_id);
                self.hub.registry().take_awaited(&command_id);
                Ok(CommandResult::empty(command_id))
            }
        }
    }

    /// Fetch one managed certificate live from its instance
    pub async fn get_managed_certificate(
        &self,
        instance_id: &str,
        item_id: &str,
    ) -> Result<ManagedItem, CommandError> {
        let result = self
            .get_command_result(instance_id, CommandRequest::get_managed_item(item_id))
            .await?;
        let result = self.expect_payload(instance_id, result)?;
        Ok(result.decode()?)
    }

    /// Store or update one managed certificate on its instance
    ///
    /// The cache picks up the post-update state only when the instance
    /// confirms the store.
    pub async fn update_managed_certificate(
        &self,
        instance_id: &str,
        item: ManagedItem,
    ) -> Result<ManagedItem, CommandError> {
        let request = CommandRequest::update_managed_item(&item)?;
        let result = self.get_command_result(instance_id, request).await?;
        let result = self.expect_payload(instance_id, result)?;

        let updated: ManagedItem = result.decode()?;
        self.hub
            .registry()
            .update_cached_item(instance_id, updated.clone());
        debug!(
            instance_id = %instance_id,
            item_id = %updated.id,
            "Updated managed certificate"
        );
        Ok(updated)
    }

    /// Delete one managed certificate on its instance
    ///
    /// The cached copy is evicted regardless of the remote outcome; the
    /// next poll cycle reconciles whatever actually happened.
    pub async fn remove_managed_certificate(
        &self,
        instance_id: &str,
        item_id: &str,
    ) -> Result<bool, CommandError> {
        let result = self
            .get_command_result(instance_id, CommandRequest::delete_managed_item(item_id))
            .await?;

        if self.hub.registry().remove_cached_item(instance_id, item_id) {
            debug!(
                instance_id = %instance_id,
                item_id = %item_id,
                "Evicted cached managed certificate"
            );
        }

        match result.has_value() {
            true => Ok(result.decode()?),
            false => Err(CommandError::NoResponse(instance_id.to_string())),
        }
    }

    /// Fleet-wide health summary over the cached items of connected instances
    ///
    /// Pure aggregation; nothing is dispatched.
    pub fn get_managed_certificate_summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for instance in self.hub.registry().connected_instances() {
            let items = self.hub.registry().managed_items(&instance.instance_id);
            summary.merge(&StatusSummary::of(&items));
        }
        summary
    }

    /// Fetch the tail of one managed item's log
    pub async fn get_item_log(
        &self,
        instance_id: &str,
        item_id: &str,
        max_lines: usize,
    ) -> Result<Vec<String>, CommandError> {
        let max_lines = max_lines.clamp(1, MAX_LOG_LINES);
        let result = self
            .get_command_result(instance_id, CommandRequest::get_item_log(item_id, max_lines))
            .await?;
        let result = self.expect_payload(instance_id, result)?;
        Ok(result.decode()?)
    }

    /// Dry-run the configuration checks for an item on its instance
    pub async fn test_managed_certificate_configuration(
        &self,
        instance_id: &str,
        item: ManagedItem,
    ) -> Result<Vec<ActionStep>, CommandError> {
        let request = CommandRequest::test_managed_item(&item)?;
        let result = self.get_command_result(instance_id, request).await?;
        let result = self.expect_payload(instance_id, result)?;
        Ok(result.decode()?)
    }

    /// Snapshot of connected identified instances
    pub fn connected_instances(&self) -> Vec<InstanceInfo> {
        self.hub.registry().connected_instances()
    }

    /// Whether an instance currently holds a live connection
    pub fn is_connected(&self, instance_id: &str) -> bool {
        self.hub
            .registry()
            .connection_for_instance(instance_id)
            .is_some()
    }

    /// Cached items for one instance
    pub fn cached_items(&self, instance_id: &str) -> Vec<ManagedItem> {
        self.hub.registry().managed_items(instance_id)
    }

    /// Commands currently awaiting results
    pub fn pending_commands(&self) -> usize {
        self.hub.registry().awaited_count()
    }

    fn expect_payload(
        &self,
        instance_id: &str,
        result: CommandResult,
    ) -> Result<CommandResult, CommandError> {
        if result.has_value() {
            Ok(result)
        } else {
            Err(CommandError::NoResponse(instance_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certfleet_proto::ItemHealth;
    use certfleet_registry::{CommandWaiters, InstanceRegistry};

    fn identified(instance_id: &str) -> InstanceInfo {
        InstanceInfo {
            instance_id: instance_id.to_string(),
            title: format!("host-{}", instance_id),
            os: "linux".to_string(),
            client_version: "1.0.0".to_string(),
            last_reported: None,
        }
    }

    fn item(id: &str, health: ItemHealth) -> ManagedItem {
        let mut item = ManagedItem::new(id).with_health(health);
        item.id = id.to_string();
        item
    }

    fn api_over(registry: InstanceRegistry) -> ManagementApi {
        ManagementApi::new(ManagementHub::new(registry, CommandWaiters::new()))
    }

    #[tokio::test]
    async fn test_command_against_unknown_instance_fails_fast() {
        let api = api_over(InstanceRegistry::new());

        let err = api
            .get_command_result("ghost", CommandRequest::get_instance_items())
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::InstanceNotConnected(_)));
        // The failed dispatch must leave no waiter or awaited entry behind.
        assert_eq!(api.hub.waiters().waiting(), 0);
        assert_eq!(api.hub.registry().awaited_count(), 0);
    }

    #[tokio::test]
    async fn test_get_managed_certificate_not_connected() {
        let api = api_over(InstanceRegistry::new());
        let err = api
            .get_managed_certificate("ghost", "cert-1")
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InstanceNotConnected(_)));
    }

    #[tokio::test]
    async fn test_summary_aggregates_connected_instances() {
        let registry = InstanceRegistry::new();
        registry.update_instance_connection("conn-1", identified("inst-a"));
        registry.update_instance_connection("conn-2", identified("inst-b"));
        registry.update_instance_items(
            "inst-a",
            vec![item("a1", ItemHealth::Ok), item("a2", ItemHealth::Error)],
        );
        registry.update_instance_items(
            "inst-b",
            vec![
                item("b1", ItemHealth::Ok),
                item("b2", ItemHealth::Warning),
                item("b3", ItemHealth::AwaitingUser),
            ],
        );
        // A disconnected instance's leftovers must not count.
        registry.update_instance_items("inst-gone", vec![item("x1", ItemHealth::Error)]);

        let api = api_over(registry);
        let summary = api.get_managed_certificate_summary();

        assert_eq!(summary.total, 5);
        assert_eq!(summary.healthy, 2);
        assert_eq!(summary.error, 1);
        assert_eq!(summary.warning, 1);
        assert_eq!(summary.awaiting_user, 1);
        assert_eq!(summary.no_certificate, 0);
    }

    #[tokio::test]
    async fn test_summary_empty_fleet_is_zero() {
        let api = api_over(InstanceRegistry::new());
        assert_eq!(api.get_managed_certificate_summary(), StatusSummary::default());
    }

    #[tokio::test]
    async fn test_is_connected_ignores_placeholders() {
        let registry = InstanceRegistry::new();
        registry.register_pending("conn-1");
        let api = api_over(registry);

        assert!(!api.is_connected(""));
        assert!(!api.is_connected("inst-a"));
    }

    #[test]
    fn test_hub_error_mapping() {
        let err: CommandError = HubError::InstanceNotConnected("x".to_string()).into();
        assert!(matches!(err, CommandError::InstanceNotConnected(_)));

        let err: CommandError = HubError::ChannelClosed("closed".to_string()).into();
        assert!(matches!(err, CommandError::ChannelClosed(_)));
    }
}

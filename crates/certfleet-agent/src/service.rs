//! Instance-side certificate operations
//!
//! [`InstanceService`] is the seam between the push channel client and
//! whatever actually manages certificates on this host. [`LocalStoreService`]
//! is the built-in in-memory implementation used by the standalone agent.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use certfleet_proto::{ActionStep, InstanceInfo, ManagedItem};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("managed item {0} not found")]
    ItemNotFound(String),
}

/// Operations the hub can invoke on this instance
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstanceService: Send + Sync {
    /// Identity reported to the hub on attach
    async fn instance_info(&self) -> InstanceInfo;

    /// Full managed item inventory
    async fn managed_items(&self) -> Vec<ManagedItem>;

    async fn managed_item(&self, item_id: &str) -> Result<ManagedItem, ServiceError>;

    /// Store or replace an item; returns the stored version
    async fn update_managed_item(&self, item: ManagedItem) -> Result<ManagedItem, ServiceError>;

    /// Returns whether an item was actually removed
    async fn delete_managed_item(&self, item_id: &str) -> Result<bool, ServiceError>;

    /// Tail of the item's activity log, newest last
    async fn item_log(&self, item_id: &str, max_lines: usize)
        -> Result<Vec<String>, ServiceError>;

    /// Dry-run the configuration checks without touching anything
    async fn test_managed_item(&self, item: ManagedItem) -> Result<Vec<ActionStep>, ServiceError>;
}

/// In-memory managed item store with a per-item activity log
pub struct LocalStoreService {
    info: InstanceInfo,
    items: RwLock<HashMap<String, ManagedItem>>,
    logs: RwLock<HashMap<String, Vec<String>>>,
}

impl LocalStoreService {
    pub fn new(instance_id: impl Into<String>, title: impl Into<String>) -> Self {
        let info = InstanceInfo {
            instance_id: instance_id.into(),
            title: title.into(),
            ..InstanceInfo::default()
        };

        Self {
            info,
            items: RwLock::new(HashMap::new()),
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Seed an item at construction time
    pub fn with_item(mut self, item: ManagedItem) -> Self {
        self.items.get_mut().insert(item.id.clone(), item);
        self
    }

    async fn append_log(&self, item_id: &str, message: String) {
        let line = format!("{} {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), message);
        let mut logs = self.logs.write().await;
        logs.entry(item_id.to_string()).or_default().push(line);
    }
}

#[async_trait]
impl InstanceService for LocalStoreService {
    async fn instance_info(&self) -> InstanceInfo {
        self.info.clone()
    }

    async fn managed_items(&self) -> Vec<ManagedItem> {
        self.items.read().await.values().cloned().collect()
    }

    async fn managed_item(&self, item_id: &str) -> Result<ManagedItem, ServiceError> {
        self.items
            .read()
            .await
            .get(item_id)
            .cloned()
            .ok_or_else(|| ServiceError::ItemNotFound(item_id.to_string()))
    }

    async fn update_managed_item(&self, item: ManagedItem) -> Result<ManagedItem, ServiceError> {
        self.items
            .write()
            .await
            .insert(item.id.clone(), item.clone());
        self.append_log(&item.id, format!("Item '{}' stored", item.name))
            .await;
        Ok(item)
    }

    async fn delete_managed_item(&self, item_id: &str) -> Result<bool, ServiceError> {
        let removed = self.items.write().await.remove(item_id).is_some();
        if removed {
            self.append_log(item_id, "Item deleted".to_string()).await;
        }
        Ok(removed)
    }

    async fn item_log(
        &self,
        item_id: &str,
        max_lines: usize,
    ) -> Result<Vec<String>, ServiceError> {
        let logs = self.logs.read().await;
        let lines = logs.get(item_id).cloned().unwrap_or_default();
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines[skip..].to_vec())
    }

    async fn test_managed_item(&self, item: ManagedItem) -> Result<Vec<ActionStep>, ServiceError> {
        let mut steps = Vec::new();

        if item.name.trim().is_empty() {
            steps.push(ActionStep::error("Name", "Item has no name"));
        } else {
            steps.push(ActionStep::ok("Name", &format!("Item name '{}'", item.name)));
        }

        if item.domains.is_empty() {
            steps.push(ActionStep::error("Domains", "No domains configured"));
        } else {
            steps.push(ActionStep::ok(
                "Domains",
                &format!("{} domain(s) configured", item.domains.len()),
            ));
        }

        if let Some(expiry) = item.date_expiry {
            if expiry < Utc::now() {
                steps.push(ActionStep::warning(
                    "Expiry",
                    "Certificate has already expired",
                ));
            } else {
                steps.push(ActionStep::ok(
                    "Expiry",
                    &format!("Certificate valid until {}", expiry.format("%Y-%m-%d")),
                ));
            }
        }

        if !item.auto_renew {
            steps.push(ActionStep::warning(
                "Renewal",
                "Automatic renewal is disabled",
            ));
        }

        self.append_log(&item.id, format!("Configuration test ran for '{}'", item.name))
            .await;

        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certfleet_proto::ItemHealth;

    fn store_with_item() -> (LocalStoreService, String) {
        let item = ManagedItem::new("web-frontend")
            .with_domains(vec!["example.com".to_string()])
            .with_health(ItemHealth::Ok);
        let item_id = item.id.clone();
        let service = LocalStoreService::new("site-a", "Site A").with_item(item);
        (service, item_id)
    }

    #[tokio::test]
    async fn test_instance_info_uses_configured_identity() {
        let service = LocalStoreService::new("site-a", "Site A");
        let info = service.instance_info().await;
        assert_eq!(info.instance_id, "site-a");
        assert_eq!(info.title, "Site A");
        assert!(!info.client_version.is_empty());
    }

    #[tokio::test]
    async fn test_item_lookup() {
        let (service, item_id) = store_with_item();

        let found = service.managed_item(&item_id).await.unwrap();
        assert_eq!(found.name, "web-frontend");

        let missing = service.managed_item("no-such-id").await;
        assert!(matches!(missing, Err(ServiceError::ItemNotFound(_))));
    }

    #[tokio::test]
    async fn test_update_replaces_and_logs() {
        let (service, item_id) = store_with_item();

        let mut changed = service.managed_item(&item_id).await.unwrap();
        changed.name = "web-frontend-renamed".to_string();
        service.update_managed_item(changed).await.unwrap();

        let stored = service.managed_item(&item_id).await.unwrap();
        assert_eq!(stored.name, "web-frontend-renamed");

        let log = service.item_log(&item_id, 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].contains("stored"));
    }

    #[tokio::test]
    async fn test_delete_reports_outcome() {
        let (service, item_id) = store_with_item();

        assert!(service.delete_managed_item(&item_id).await.unwrap());
        // Second delete finds nothing
        assert!(!service.delete_managed_item(&item_id).await.unwrap());
        assert!(service.managed_items().await.is_empty());
    }

    #[tokio::test]
    async fn test_log_tail_is_bounded() {
        let (service, item_id) = store_with_item();

        for i in 0..10 {
            service
                .append_log(&item_id, format!("entry {}", i))
                .await;
        }

        let tail = service.item_log(&item_id, 3).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail[2].contains("entry 9"));

        let all = service.item_log(&item_id, 100).await.unwrap();
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn test_configuration_checks_flag_problems() {
        let service = LocalStoreService::new("site-a", "Site A");

        let mut item = ManagedItem::new("bare");
        item.auto_renew = false;
        let steps = service.test_managed_item(item).await.unwrap();

        assert!(steps.iter().any(|s| s.has_error && s.title == "Domains"));
        assert!(steps.iter().any(|s| s.has_warning && s.title == "Renewal"));
    }

    #[tokio::test]
    async fn test_configuration_checks_pass_for_complete_item() {
        let service = LocalStoreService::new("site-a", "Site A");

        let item = ManagedItem::new("good")
            .with_domains(vec!["example.com".to_string()])
            .with_expiry(Utc::now() + chrono::Duration::days(60));
        let steps = service.test_managed_item(item).await.unwrap();

        assert!(steps.iter().all(|s| !s.has_error));
        assert!(steps.iter().any(|s| s.title == "Expiry" && !s.has_warning));
    }
}

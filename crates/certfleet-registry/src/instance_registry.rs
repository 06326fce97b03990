//! Instance registry for push channel connections
//!
//! This module tracks which instances currently hold a live push channel
//! connection, keeps the last reported managed items per instance, and
//! records which command ids the server is still willing to accept
//! results for.

use certfleet_proto::{CommandRequest, InstanceInfo, ManagedItem};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Registry for connected instances and their cached state
///
/// All maps are concurrent; clones share the same underlying state so the
/// hub, the worker and API handlers can hold their own handle.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    /// Maps connection id -> last known identity for that connection
    connections: Arc<DashMap<String, InstanceInfo>>,
    /// Maps instance id -> most recently reported managed items
    items: Arc<DashMap<String, Vec<ManagedItem>>>,
    /// Maps command id -> dispatched request awaiting a result, with
    /// registration time so abandoned entries can be purged
    awaited: Arc<DashMap<Uuid, (CommandRequest, Instant)>>,
}

impl InstanceRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            items: Arc::new(DashMap::new()),
            awaited: Arc::new(DashMap::new()),
        }
    }

    /// Record a fresh connection that has not identified itself yet
    pub fn register_pending(&self, connection_id: &str) {
        self.connections
            .insert(connection_id.to_string(), InstanceInfo::pending());
        tracing::debug!(connection_id = %connection_id, "Registered pending connection");
    }

    /// Bind (or rebind) a connection to an instance identity
    ///
    /// Any other connection currently mapped to the same instance id is
    /// evicted first: a reconnecting instance supersedes its stale
    /// connection. Returns the evicted connection ids.
    pub fn update_instance_connection(
        &self,
        connection_id: &str,
        info: InstanceInfo,
    ) -> Vec<String> {
        let mut superseded = Vec::new();

        if info.is_identified() {
            // Collect first, then remove: removal under an open iterator
            // can contend on the same shard.
            for entry in self.connections.iter() {
                if entry.key() != connection_id && entry.value().instance_id == info.instance_id {
                    superseded.push(entry.key().clone());
                }
            }
            for stale in &superseded {
                self.connections.remove(stale);
                tracing::info!(
                    instance_id = %info.instance_id,
                    old_connection_id = %stale,
                    new_connection_id = %connection_id,
                    "Reconnection superseded stale connection"
                );
            }
        }

        let replaced = self
            .connections
            .insert(connection_id.to_string(), info.clone());

        match replaced {
            Some(old) if old.is_identified() => {
                tracing::info!(
                    connection_id = %connection_id,
                    instance_id = %info.instance_id,
                    "Refreshed instance identity"
                );
            }
            _ => {
                tracing::info!(
                    connection_id = %connection_id,
                    instance_id = %info.instance_id,
                    title = %info.title,
                    "Bound connection to instance"
                );
            }
        }

        superseded
    }

    /// Drop one connection mapping
    ///
    /// Returns the identity that was bound to it, if any.
    pub fn remove_connection(&self, connection_id: &str) -> Option<InstanceInfo> {
        let removed = self.connections.remove(connection_id).map(|(_, info)| info);
        if let Some(ref info) = removed {
            tracing::debug!(
                connection_id = %connection_id,
                instance_id = %info.instance_id,
                "Removed connection mapping"
            );
        }
        removed
    }

    /// Identity bound to a connection, if the connection is known
    pub fn instance_for_connection(&self, connection_id: &str) -> Option<InstanceInfo> {
        self.connections.get(connection_id).map(|e| e.value().clone())
    }

    /// Connection currently serving an instance
    ///
    /// Unidentified placeholder entries never match.
    pub fn connection_for_instance(&self, instance_id: &str) -> Option<String> {
        if instance_id.is_empty() {
            return None;
        }
        for entry in self.connections.iter() {
            if entry.value().instance_id == instance_id {
                tracing::debug!(
                    instance_id = %instance_id,
                    connection_id = %entry.key(),
                    "Resolved connection for instance"
                );
                return Some(entry.key().clone());
            }
        }
        tracing::debug!(instance_id = %instance_id, "No connection for instance");
        None
    }

    /// Snapshot of all identified connected instances
    pub fn connected_instances(&self) -> Vec<InstanceInfo> {
        self.connections
            .iter()
            .filter(|e| e.value().is_identified())
            .map(|e| e.value().clone())
            .collect()
    }

    /// All current connection ids, identified or not
    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Total connection mappings, including pending ones
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Refresh the last-reported timestamp for an instance
    pub fn touch_instance(&self, instance_id: &str) {
        if instance_id.is_empty() {
            return;
        }
        for mut entry in self.connections.iter_mut() {
            if entry.value().instance_id == instance_id {
                entry.value_mut().last_reported = Some(chrono::Utc::now());
            }
        }
    }

    /// Replace the cached item list for an instance
    pub fn update_instance_items(&self, instance_id: &str, items: Vec<ManagedItem>) {
        tracing::debug!(
            instance_id = %instance_id,
            items = items.len(),
            "Updated cached managed items"
        );
        self.items.insert(instance_id.to_string(), items);
    }

    /// Cached managed items for an instance (empty when nothing cached)
    pub fn managed_items(&self, instance_id: &str) -> Vec<ManagedItem> {
        self.items
            .get(instance_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// One cached item by id
    pub fn cached_item(&self, instance_id: &str, item_id: &str) -> Option<ManagedItem> {
        self.items
            .get(instance_id)
            .and_then(|e| e.value().iter().find(|i| i.id == item_id).cloned())
    }

    /// Insert or replace one item in an instance's cache
    pub fn update_cached_item(&self, instance_id: &str, item: ManagedItem) {
        let mut entry = self.items.entry(instance_id.to_string()).or_default();
        match entry.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => entry.push(item),
        }
    }

    /// Drop one item from an instance's cache
    ///
    /// Returns true when something was removed.
    pub fn remove_cached_item(&self, instance_id: &str, item_id: &str) -> bool {
        match self.items.get_mut(instance_id) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|i| i.id != item_id);
                before != entry.len()
            }
            None => false,
        }
    }

    /// Drop the whole item cache for an instance
    pub fn remove_instance_items(&self, instance_id: &str) {
        if self.items.remove(instance_id).is_some() {
            tracing::debug!(instance_id = %instance_id, "Dropped cached managed items");
        }
    }

    /// Record a dispatched command so its result will be accepted
    pub fn add_awaited(&self, request: &CommandRequest) {
        tracing::debug!(
            command_id = %request.command_id,
            command_type = %request.command_type,
            "Awaiting command result"
        );
        self.awaited
            .insert(request.command_id, (request.clone(), Instant::now()));
    }

    /// Consume the awaited entry for a command id
    ///
    /// Returns None for unknown ids and for ids whose result was already
    /// consumed, so duplicate results fall through as no-ops.
    pub fn take_awaited(&self, command_id: &Uuid) -> Option<CommandRequest> {
        self.awaited
            .remove(command_id)
            .map(|(_, (request, _))| request)
    }

    /// Drop awaited entries older than `max_age`
    ///
    /// Fire-and-forget polls leave entries behind when an instance never
    /// answers; the periodic sweep reclaims them. Returns the number purged.
    pub fn purge_awaited_older_than(&self, max_age: Duration) -> usize {
        let before = self.awaited.len();
        self.awaited.retain(|_, entry| entry.1.elapsed() < max_age);
        let purged = before.saturating_sub(self.awaited.len());
        if purged > 0 {
            tracing::debug!(purged, "Purged abandoned awaited commands");
        }
        purged
    }

    /// Number of commands still awaiting results
    pub fn awaited_count(&self) -> usize {
        self.awaited.len()
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

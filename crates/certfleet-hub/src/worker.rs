//! Timer-driven item poller

use crate::hub::ManagementHub;
use certfleet_proto::CommandRequest;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Default delay between poll cycles
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Awaited entries older than this many poll intervals get purged
const AWAITED_TTL_CYCLES: u32 = 5;

/// Polls every connected instance for its managed items
///
/// Results are fire and forget: they land in the item cache through the hub's
/// result routing, no caller blocks on them. Each cycle also reconciles
/// registry state left behind by detached sockets.
pub struct ManagementWorker {
    hub: ManagementHub,
    poll_interval: Duration,
}

impl ManagementWorker {
    pub fn new(hub: ManagementHub) -> Self {
        Self {
            hub,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run the poll loop forever
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.poll_interval.as_secs(),
            "Management worker started"
        );

        loop {
            ticker.tick().await;
            self.poll_cycle().await;
        }
    }

    /// One poll pass; returns the number of instances polled
    pub async fn poll_cycle(&self) -> usize {
        let swept = self.hub.sweep_stale();
        if swept > 0 {
            debug!(swept, "Reconciled stale connection mappings");
        }
        self.hub
            .registry()
            .purge_awaited_older_than(self.poll_interval * AWAITED_TTL_CYCLES);

        let instances = self.hub.registry().connected_instances();
        let mut polled = 0;
        for instance in &instances {
            match self
                .hub
                .dispatch(&instance.instance_id, CommandRequest::get_instance_items())
                .await
            {
                Ok(()) => polled += 1,
                Err(e) => {
                    warn!(
                        instance_id = %instance.instance_id,
                        error = %e,
                        "Item poll dispatch failed"
                    );
                }
            }
        }

        let cached_items: usize = instances
            .iter()
            .map(|i| self.hub.registry().managed_items(&i.instance_id).len())
            .sum();
        info!(
            instances = instances.len(),
            polled, cached_items, "Poll cycle complete"
        );

        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certfleet_registry::{CommandWaiters, InstanceRegistry};

    #[test]
    fn test_default_interval() {
        let hub = ManagementHub::new(InstanceRegistry::new(), CommandWaiters::new());
        let worker = ManagementWorker::new(hub);
        assert_eq!(worker.poll_interval(), DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_with_poll_interval() {
        let hub = ManagementHub::new(InstanceRegistry::new(), CommandWaiters::new());
        let worker = ManagementWorker::new(hub).with_poll_interval(Duration::from_secs(5));
        assert_eq!(worker.poll_interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_poll_cycle_with_no_instances() {
        let hub = ManagementHub::new(InstanceRegistry::new(), CommandWaiters::new());
        let worker = ManagementWorker::new(hub);
        assert_eq!(worker.poll_cycle().await, 0);
    }

    #[tokio::test]
    async fn test_poll_cycle_sweeps_dead_mappings() {
        let registry = InstanceRegistry::new();
        registry.update_instance_connection(
            "conn-dead",
            certfleet_proto::InstanceInfo {
                instance_id: "inst-a".to_string(),
                title: "host-a".to_string(),
                os: "linux".to_string(),
                client_version: "1.0.0".to_string(),
                last_reported: None,
            },
        );

        let hub = ManagementHub::new(registry, CommandWaiters::new());
        let worker = ManagementWorker::new(hub);

        // The mapping has no live socket: the cycle sweeps it before
        // polling, so nothing is dispatched.
        assert_eq!(worker.poll_cycle().await, 0);
        assert_eq!(worker.hub.registry().connection_count(), 0);
    }
}

//! Background recovery of failed scale set instances.
//!
//! After the state machine submits an update or reimage it starts a watchdog
//! for that scale set. The watchdog polls instance provisioning states and
//! reimages instances that end up Failed, until every instance is Succeeded.
//!
//! Watchdogs are registered by `resource_group/scale_set`. Starting one while
//! another runs for the same scale set is a no-op, and the termination step
//! cancels the watchdog before it deletes instances.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deployment::ProvisioningState;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::scale::{all_instances_succeeded, ScaleSetClient};

/// Watchdog timing
#[derive(Clone, Debug, PartialEq)]
pub struct WatchdogConfig {
    /// Delay between instance polls
    pub poll_interval: Duration,
    /// Reimage attempts per failed batch
    pub reimage_attempts: u32,
    /// Fixed delay between reimage attempts
    pub reimage_backoff: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            reimage_attempts: 3,
            reimage_backoff: Duration::from_secs(10),
        }
    }
}

struct Watchdog {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Running watchdogs, at most one per scale set
pub struct WatchdogRegistry {
    config: WatchdogConfig,
    tasks: DashMap<String, Watchdog>,
}

impl WatchdogRegistry {
    /// Create an empty registry
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            tasks: DashMap::new(),
        }
    }

    fn key(resource_group: &str, scale_set: &str) -> String {
        format!("{resource_group}/{scale_set}")
    }

    /// Start watching a scale set.
    ///
    /// Returns `false` if a watchdog for the scale set is already running.
    pub fn start(
        &self,
        client: Arc<dyn ScaleSetClient>,
        resource_group: &str,
        scale_set: &str,
    ) -> bool {
        match self.tasks.entry(Self::key(resource_group, scale_set)) {
            Entry::Occupied(running) if !running.get().handle.is_finished() => {
                debug!(scale_set, "watchdog already running");
                false
            }
            entry => {
                let token = CancellationToken::new();
                let handle = tokio::spawn(watch(
                    client,
                    resource_group.to_string(),
                    scale_set.to_string(),
                    self.config.clone(),
                    token.clone(),
                ));
                info!(scale_set, "started instance watchdog");
                entry.insert(Watchdog { token, handle });
                true
            }
        }
    }

    /// Stop the watchdog of a scale set, if any.
    ///
    /// Returns `true` if a running watchdog was cancelled.
    pub fn cancel(&self, resource_group: &str, scale_set: &str) -> bool {
        match self.tasks.remove(&Self::key(resource_group, scale_set)) {
            Some((_, watchdog)) => {
                watchdog.token.cancel();
                let was_running = !watchdog.handle.is_finished();
                if was_running {
                    info!(scale_set, "cancelled instance watchdog");
                }
                was_running
            }
            None => false,
        }
    }

    /// True while a watchdog for the scale set has not exited
    pub fn is_running(&self, resource_group: &str, scale_set: &str) -> bool {
        self.tasks
            .get(&Self::key(resource_group, scale_set))
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel every watchdog and wait for them to exit
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, watchdog)) = self.tasks.remove(&key) {
                watchdog.token.cancel();
                if let Err(e) = watchdog.handle.await {
                    warn!(watchdog = %key, error = %e, "watchdog task panicked");
                }
            }
        }
    }
}

async fn watch(
    client: Arc<dyn ScaleSetClient>,
    resource_group: String,
    scale_set: String,
    config: WatchdogConfig,
    token: CancellationToken,
) {
    let retry = RetryConfig::fixed(config.reimage_attempts, config.reimage_backoff);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(scale_set = %scale_set, "watchdog cancelled");
                return;
            }
            _ = tokio::time::sleep(config.poll_interval) => {}
        }

        let instances = match client.list_instances(&resource_group, &scale_set).await {
            Ok(instances) => instances,
            Err(e) if e.is_not_found() => {
                warn!(scale_set = %scale_set, "scale set disappeared, stopping watchdog");
                return;
            }
            Err(e) => {
                warn!(scale_set = %scale_set, error = %e, "failed to list instances");
                continue;
            }
        };

        if all_instances_succeeded(&instances) {
            info!(scale_set = %scale_set, "all instances succeeded, watchdog done");
            return;
        }

        let failed: Vec<String> = instances
            .iter()
            .filter(|i| i.provisioning_state == ProvisioningState::Failed)
            .map(|i| i.instance_id.clone())
            .collect();
        if failed.is_empty() {
            continue;
        }

        warn!(scale_set = %scale_set, instances = ?failed, "reimaging failed instances");
        let reimage = retry_with_backoff(&retry, "reimage failed instances", || {
            client.reimage_instances(&resource_group, &scale_set, &failed)
        });

        tokio::select! {
            _ = token.cancelled() => {
                debug!(scale_set = %scale_set, "watchdog cancelled during reimage");
                return;
            }
            result = reimage => {
                if let Err(e) = result {
                    error!(scale_set = %scale_set, error = %e, "giving up on failed instances");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale::{MockScaleSetClient, VmssInstance};
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn instance(id: &str, state: ProvisioningState) -> VmssInstance {
        VmssInstance {
            instance_id: id.to_string(),
            latest_model_applied: true,
            provisioning_state: state,
            computer_name: None,
        }
    }

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            poll_interval: Duration::from_secs(1),
            reimage_attempts: 3,
            reimage_backoff: Duration::from_secs(1),
        }
    }

    async fn wait_for_exit(registry: &WatchdogRegistry) {
        for _ in 0..100 {
            if !registry.is_running("rg", "vmss") {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        panic!("watchdog did not exit");
    }

    /// Story: A failed instance is reimaged and the watchdog exits once healthy
    #[tokio::test(start_paused = true)]
    async fn story_failed_instance_is_reimaged_until_healthy() {
        let polls = Arc::new(AtomicUsize::new(0));
        let polls_seen = polls.clone();

        let mut client = MockScaleSetClient::new();
        client.expect_list_instances().returning(move |_, _| {
            let n = polls_seen.fetch_add(1, Ordering::SeqCst);
            let state = if n == 0 {
                ProvisioningState::Failed
            } else {
                ProvisioningState::Succeeded
            };
            Ok(vec![instance("0", ProvisioningState::Succeeded), instance("1", state)])
        });
        client
            .expect_reimage_instances()
            .withf(|_, _, ids| ids.len() == 1 && ids[0] == "1")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let registry = WatchdogRegistry::new(config());
        assert!(registry.start(Arc::new(client), "rg", "vmss"));
        wait_for_exit(&registry).await;
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    /// Story: Reimage failures are retried a bounded number of times, then logged
    #[tokio::test(start_paused = true)]
    async fn story_reimage_retries_are_bounded() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_seen = attempts.clone();
        let polls = Arc::new(AtomicUsize::new(0));
        let polls_seen = polls.clone();

        let mut client = MockScaleSetClient::new();
        client.expect_list_instances().returning(move |_, _| {
            let n = polls_seen.fetch_add(1, Ordering::SeqCst);
            let state = if n == 0 {
                ProvisioningState::Failed
            } else {
                ProvisioningState::Succeeded
            };
            Ok(vec![instance("1", state)])
        });
        client.expect_reimage_instances().returning(move |_, _, _| {
            attempts_seen.fetch_add(1, Ordering::SeqCst);
            Err(Error::cloud("reimage", Some(500), "boom"))
        });

        let registry = WatchdogRegistry::new(config());
        registry.start(Arc::new(client), "rg", "vmss");
        wait_for_exit(&registry).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_watchdog_per_scale_set() {
        let mut client = MockScaleSetClient::new();
        client
            .expect_list_instances()
            .returning(|_, _| Ok(vec![instance("0", ProvisioningState::Updating)]));
        let client: Arc<dyn ScaleSetClient> = Arc::new(client);

        let registry = WatchdogRegistry::new(config());
        assert!(registry.start(client.clone(), "rg", "vmss"));
        assert!(!registry.start(client.clone(), "rg", "vmss"));
        assert!(registry.start(client, "rg", "other-vmss"));

        assert!(registry.cancel("rg", "vmss"));
        assert!(!registry.cancel("rg", "vmss"));
        registry.shutdown().await;
        assert!(!registry.is_running("rg", "other-vmss"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_scale_set_stops_watchdog() {
        let mut client = MockScaleSetClient::new();
        client
            .expect_list_instances()
            .times(1)
            .returning(|_, _| Err(Error::not_found("scale set", "vmss")));

        let registry = WatchdogRegistry::new(config());
        registry.start(Arc::new(client), "rg", "vmss");
        wait_for_exit(&registry).await;
    }
}

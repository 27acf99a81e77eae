//! Named resource pools with usage thresholds
//!
//! [`ResourceMonitor`] is the seam to whatever tracks resource usage in the
//! host process. A monitor lists its pools and arms a usage threshold on the
//! ones that support it. While a pool sits at or above its threshold, every
//! usage sample is published to subscribers as a [`ThresholdNotification`],
//! and so is the first sample that brings it back below. Subscribers watching
//! higher levels on the same pool can then tell when usage reaches them.
//!
//! [`ResourcePools`] is the in-memory implementation: the host registers
//! pools and feeds usage samples with [`ResourcePools::record_usage`].

use std::collections::BTreeMap;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub used: u64,
    pub committed: u64,
    pub max: Option<u64>,
}

impl PoolUsage {
    pub fn new(used: u64, committed: u64, max: Option<u64>) -> Self {
        Self { used, committed, max }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub name: String,
    pub supports_threshold: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdNotification {
    pub pool: String,
    pub usage: PoolUsage,
    /// Number of times this pool has risen to its threshold
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Receiving end of a monitor subscription
///
/// The receiver disconnects once the monitor drops the subscription.
pub struct Subscription {
    pub id: SubscriptionId,
    pub notifications: Receiver<ThresholdNotification>,
}

pub trait ResourceMonitor: Send + Sync {
    fn pools(&self) -> Vec<PoolInfo>;

    /// Arm `pool` at `threshold`; false if the pool is unknown or does not
    /// support thresholds
    fn set_usage_threshold(&self, pool: &str, threshold: u64) -> bool;

    fn subscribe(&self) -> Subscription;

    fn unsubscribe(&self, id: SubscriptionId);
}

struct Pool {
    supports_threshold: bool,
    threshold: Option<u64>,
    above: bool,
    crossings: u64,
    usage: PoolUsage,
}

#[derive(Default)]
struct PoolsState {
    pools: BTreeMap<String, Pool>,
    subscribers: Vec<(SubscriptionId, Sender<ThresholdNotification>)>,
    next_subscription: u64,
}

#[derive(Default)]
pub struct ResourcePools {
    state: Mutex<PoolsState>,
}

impl ResourcePools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool; registering an existing name keeps its usage and threshold
    pub fn register(&self, name: impl Into<String>, supports_threshold: bool) {
        self.state.lock().pools.entry(name.into()).or_insert(Pool {
            supports_threshold,
            threshold: None,
            above: false,
            crossings: 0,
            usage: PoolUsage::default(),
        });
    }

    /// Record a usage sample for `pool`
    ///
    /// Published while usage is at or above the armed threshold, plus the
    /// first sample back below it. Returns whether a notification was
    /// published.
    pub fn record_usage(&self, pool: &str, usage: PoolUsage) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.pools.get_mut(pool) else {
            debug!("Usage sample for unknown pool {pool}");
            return false;
        };
        entry.usage = usage;
        let Some(threshold) = entry.threshold else {
            return false;
        };
        let reached = usage.used >= threshold;
        let was_above = std::mem::replace(&mut entry.above, reached);
        if !reached && !was_above {
            return false;
        }
        if reached && !was_above {
            entry.crossings += 1;
        }
        let notification =
            ThresholdNotification { pool: pool.to_string(), usage, count: entry.crossings };
        // Subscribers whose receiver is gone are pruned here
        state.subscribers.retain(|(_, tx)| tx.send(notification.clone()).is_ok());
        true
    }

    pub fn usage(&self, pool: &str) -> Option<PoolUsage> {
        self.state.lock().pools.get(pool).map(|p| p.usage)
    }

    pub fn threshold(&self, pool: &str) -> Option<u64> {
        self.state.lock().pools.get(pool).and_then(|p| p.threshold)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

impl ResourceMonitor for ResourcePools {
    fn pools(&self) -> Vec<PoolInfo> {
        self.state
            .lock()
            .pools
            .iter()
            .map(|(name, pool)| PoolInfo {
                name: name.clone(),
                supports_threshold: pool.supports_threshold,
            })
            .collect()
    }

    fn set_usage_threshold(&self, pool: &str, threshold: u64) -> bool {
        let mut state = self.state.lock();
        match state.pools.get_mut(pool) {
            Some(entry) if entry.supports_threshold => {
                entry.threshold = Some(threshold);
                entry.above = false;
                true
            }
            _ => false,
        }
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = unbounded();
        let mut state = self.state.lock();
        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);
        state.subscribers.push((id, tx));
        Subscription { id, notifications: rx }
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.state.lock().subscribers.retain(|(sub, _)| *sub != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_published_while_above_threshold() {
        let pools = ResourcePools::new();
        pools.register("heap", true);
        assert!(pools.set_usage_threshold("heap", 100));
        let sub = pools.subscribe();

        assert!(!pools.record_usage("heap", PoolUsage::new(50, 200, None)));
        assert!(pools.record_usage("heap", PoolUsage::new(120, 200, None)));
        assert!(pools.record_usage("heap", PoolUsage::new(150, 200, None)));
        assert!(pools.record_usage("heap", PoolUsage::new(10, 200, None)));
        assert!(!pools.record_usage("heap", PoolUsage::new(5, 200, None)));
        assert!(pools.record_usage("heap", PoolUsage::new(101, 200, Some(400))));

        let seen: Vec<(u64, u64)> =
            sub.notifications.try_iter().map(|n| (n.usage.used, n.count)).collect();
        assert_eq!(seen, vec![(120, 1), (150, 1), (10, 1), (101, 2)]);
    }

    #[test]
    fn test_arming_over_current_usage_counts_next_sample() {
        let pools = ResourcePools::new();
        pools.register("heap", true);
        pools.record_usage("heap", PoolUsage::new(80, 100, None));
        pools.set_usage_threshold("heap", 50);
        let sub = pools.subscribe();

        assert!(pools.record_usage("heap", PoolUsage::new(85, 100, None)));
        let first = sub.notifications.try_recv().unwrap();
        assert_eq!((first.usage.used, first.count), (85, 1));
    }

    #[test]
    fn test_unsupported_and_unknown_pools_are_not_armed() {
        let pools = ResourcePools::new();
        pools.register("code", false);
        assert!(!pools.set_usage_threshold("code", 1));
        assert!(!pools.set_usage_threshold("missing", 1));
        assert!(!pools.record_usage("missing", PoolUsage::default()));
        assert_eq!(pools.threshold("code"), None);
    }

    #[test]
    fn test_unsubscribe_disconnects_receiver() {
        let pools = ResourcePools::new();
        let sub = pools.subscribe();
        assert_eq!(pools.subscriber_count(), 1);
        pools.unsubscribe(sub.id);
        assert_eq!(pools.subscriber_count(), 0);
        assert!(sub.notifications.recv().is_err());
    }
}

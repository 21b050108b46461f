//! Unavailable offerings cache
//!
//! Negative cache of (shape, zone, pricing model) tuples that recently
//! reported a stock-out. The engine writes entries when a launch fails for
//! capacity; instance-type providers read them to mark offerings unavailable
//! before candidates are built.
//!
//! Entries expire after [`UNAVAILABLE_OFFERINGS_TTL`]. A sweeper task started
//! with [`UnavailableOfferings::start_sweeper`] drops expired entries every
//! [`UNAVAILABLE_OFFERINGS_CLEANUP_INTERVAL`] until its shutdown signal fires.

use crate::cache::{TtlCache, UNAVAILABLE_OFFERINGS_CLEANUP_INTERVAL, UNAVAILABLE_OFFERINGS_TTL};
use chrono::{DateTime, Utc};
use ecs_provisioner_core::{InstanceShape, PricingModel};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OfferingKey {
    /// Shape name
    pub shape: String,
    /// Zone id
    pub zone: String,
    /// Pricing model
    pub pricing_model: PricingModel,
}

impl OfferingKey {
    /// Build a key
    pub fn new(shape: impl Into<String>, zone: impl Into<String>, pricing_model: PricingModel) -> Self {
        Self {
            shape: shape.into(),
            zone: zone.into(),
            pricing_model,
        }
    }
}

/// Why and when an offering was marked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnavailabilityEntry {
    /// Upstream reason (error message)
    pub reason: String,
    /// Last time a stock-out refreshed this entry
    pub marked_at: DateTime<Utc>,
}

/// Negative cache of capacity-constrained offerings
#[derive(Debug)]
pub struct UnavailableOfferings {
    cache: TtlCache<OfferingKey, UnavailabilityEntry>,
    cleanup_interval: Duration,
    seq_num: AtomicU64,
}

impl UnavailableOfferings {
    /// Cache with the default TTL and sweep interval
    pub fn new() -> Self {
        Self::with_timings(UNAVAILABLE_OFFERINGS_TTL, UNAVAILABLE_OFFERINGS_CLEANUP_INTERVAL)
    }

    /// Cache with explicit TTL and sweep interval
    pub fn with_timings(ttl: Duration, cleanup_interval: Duration) -> Self {
        Self {
            cache: TtlCache::new(ttl),
            cleanup_interval,
            seq_num: AtomicU64::new(0),
        }
    }

    /// Insert or refresh the entry for (shape, zone, pricing model)
    pub fn mark_unavailable(
        &self,
        reason: &str,
        shape: &str,
        zone: &str,
        pricing_model: PricingModel,
    ) {
        info!(
            reason = %reason,
            instance_type = %shape,
            zone = %zone,
            capacity_type = %pricing_model,
            ttl = ?self.cache.ttl(),
            "removing offering from offerings"
        );
        self.cache.insert(
            OfferingKey::new(shape, zone, pricing_model),
            UnavailabilityEntry {
                reason: reason.to_string(),
                marked_at: Utc::now(),
            },
        );
        self.seq_num.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether the tuple is currently negative-cached
    pub fn is_unavailable(&self, shape: &str, zone: &str, pricing_model: PricingModel) -> bool {
        self.cache
            .contains_key(&OfferingKey::new(shape, zone, pricing_model))
    }

    /// Live entry for the tuple
    pub fn entry(&self, shape: &str, zone: &str, pricing_model: PricingModel) -> Option<UnavailabilityEntry> {
        self.cache.get(&OfferingKey::new(shape, zone, pricing_model))
    }

    /// Mark every cached offering of `shapes` as unavailable, in place
    pub fn apply_to(&self, shapes: &mut [InstanceShape]) {
        for shape in shapes.iter_mut() {
            let name = shape.name.clone();
            for offering in shape.offerings.iter_mut() {
                if offering.available && self.is_unavailable(&name, &offering.zone, offering.pricing_model) {
                    offering.available = false;
                }
            }
        }
    }

    /// Bumped on every write; consumers compare it to invalidate derived caches
    pub fn seq_num(&self) -> u64 {
        self.seq_num.load(Ordering::SeqCst)
    }

    /// Stored entries, including expired ones the sweeper has not reached
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// True if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Drop every entry
    pub fn flush(&self) {
        self.cache.clear();
        self.seq_num.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop expired entries now
    pub fn sweep(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Start the background sweep; it stops when `shutdown` flips to true or its sender drops
    pub fn start_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = self.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            debug!(interval = ?interval, "unavailable offerings sweeper starting");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = cache.sweep();
                        if purged > 0 {
                            debug!(purged, "expired unavailable offerings");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("unavailable offerings sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl Default for UnavailableOfferings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecs_provisioner_core::{Capacity, Offering};

    #[tokio::test(start_paused = true)]
    async fn test_entry_present_at_half_ttl_and_gone_after_sweep() {
        let cache = Arc::new(UnavailableOfferings::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = cache.start_sweeper(shutdown_rx);

        cache.mark_unavailable("NoInstanceStock", "ecs.g7.large", "cn-hangzhou-k", PricingModel::Spot);

        tokio::time::sleep(UNAVAILABLE_OFFERINGS_TTL / 2).await;
        assert!(cache.is_unavailable("ecs.g7.large", "cn-hangzhou-k", PricingModel::Spot));

        tokio::time::sleep(UNAVAILABLE_OFFERINGS_TTL / 2 + UNAVAILABLE_OFFERINGS_CLEANUP_INTERVAL).await;
        assert!(!cache.is_unavailable("ecs.g7.large", "cn-hangzhou-k", PricingModel::Spot));
        assert_eq!(cache.len(), 0, "sweeper should have purged the expired entry");

        shutdown_tx.send(true).unwrap();
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_refreshes_instead_of_duplicating() {
        let cache = UnavailableOfferings::new();
        cache.mark_unavailable("first", "ecs.g7.large", "cn-hangzhou-k", PricingModel::Spot);

        tokio::time::advance(Duration::from_secs(120)).await;
        cache.mark_unavailable("second", "ecs.g7.large", "cn-hangzhou-k", PricingModel::Spot);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(cache.len(), 1);
        let entry = cache
            .entry("ecs.g7.large", "cn-hangzhou-k", PricingModel::Spot)
            .unwrap();
        assert_eq!(entry.reason, "second");
        assert_eq!(cache.seq_num(), 2);
    }

    #[test]
    fn test_key_includes_pricing_model() {
        let cache = UnavailableOfferings::new();
        cache.mark_unavailable("stock", "ecs.g7.large", "cn-hangzhou-k", PricingModel::Spot);

        assert!(cache.is_unavailable("ecs.g7.large", "cn-hangzhou-k", PricingModel::Spot));
        assert!(!cache.is_unavailable("ecs.g7.large", "cn-hangzhou-k", PricingModel::OnDemand));
        assert!(!cache.is_unavailable("ecs.g7.large", "cn-hangzhou-j", PricingModel::Spot));
    }

    #[test]
    fn test_apply_to_marks_offerings() {
        let cache = UnavailableOfferings::new();
        cache.mark_unavailable("stock", "ecs.g7.large", "cn-hangzhou-k", PricingModel::Spot);

        let mut shapes = vec![
            InstanceShape::new("ecs.g7.large", Capacity::new(2, 8192))
                .with_offering(Offering::spot("cn-hangzhou-k", 0.03))
                .with_offering(Offering::on_demand("cn-hangzhou-k", 0.10)),
        ];
        cache.apply_to(&mut shapes);

        assert!(!shapes[0].offerings[0].available);
        assert!(shapes[0].offerings[1].available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_when_sender_dropped() {
        let cache = Arc::new(UnavailableOfferings::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = cache.start_sweeper(shutdown_rx);

        drop(shutdown_tx);
        sweeper.await.unwrap();
        assert_eq!(Arc::strong_count(&cache), 1);
    }

    #[test]
    fn test_flush() {
        let cache = UnavailableOfferings::new();
        cache.mark_unavailable("stock", "ecs.g7.large", "cn-hangzhou-k", PricingModel::Spot);
        cache.flush();

        assert!(cache.is_empty());
        assert_eq!(cache.seq_num(), 2);
    }
}

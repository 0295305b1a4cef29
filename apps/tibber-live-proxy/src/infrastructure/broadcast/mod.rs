//! Fan-Out Broadcaster
//!
//! Distributes live telemetry to a dynamic set of subscribers, each with its
//! own bounded queue registered under a caller-chosen [`SubscriberKey`].
//!
//! # Delivery Policy
//!
//! Publishing never waits. Each matching subscriber gets a `try_send`; a
//! subscriber whose queue is full (or whose receiver is gone) is evicted on
//! the spot, so a slow consumer never holds up the session loop.
//!
//! # Keys
//!
//! - `home-123`: device-scoped
//! - `home-123:<client>`: device-scoped, one per client connection
//! - `*:<client>`: firehose, receives every device
//!
//! Re-subscribing under an existing key replaces the old registration; the
//! old [`Subscription`] stream ends once its buffered items are drained.
//!
//! # Deduplication
//!
//! [`BroadcastHub::publish_update`] remembers the last timestamp published
//! per device and skips a record whose timestamp is unchanged.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::BroadcastSettings;
use crate::domain::telemetry::{DeviceId, LiveUpdate};
use crate::infrastructure::metrics;

const FIREHOSE_PREFIX: &str = "*:";

// =============================================================================
// Subscriber Keys
// =============================================================================

/// Registry key of one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberKey(String);

impl SubscriberKey {
    /// Use an arbitrary string as the key.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key that receives records for exactly one device.
    #[must_use]
    pub fn for_device(device: &DeviceId) -> Self {
        Self(device.as_str().to_string())
    }

    /// Key for one client's view of one device.
    #[must_use]
    pub fn for_device_client(device: &DeviceId, client: &str) -> Self {
        Self(format!("{device}:{client}"))
    }

    /// Key that receives records for every device.
    #[must_use]
    pub fn firehose(client: &str) -> Self {
        Self(format!("{FIREHOSE_PREFIX}{client}"))
    }

    /// Whether this key receives every device.
    #[must_use]
    pub fn is_firehose(&self) -> bool {
        self.0.starts_with(FIREHOSE_PREFIX)
    }

    /// Whether this key is scoped to `device` (exact id or `device:` prefix).
    #[must_use]
    pub fn is_scoped_to(&self, device: &DeviceId) -> bool {
        let id = device.as_str();
        self.0
            .strip_prefix(id)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
    }

    /// Whether a record for `device` should be delivered to this key.
    #[must_use]
    pub fn matches_device(&self, device: &DeviceId) -> bool {
        self.is_firehose() || self.is_scoped_to(device)
    }

    /// Borrow the raw key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for subscriber queues.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    /// Bounded queue capacity per subscriber.
    pub subscriber_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 64,
        }
    }
}

impl From<BroadcastSettings> for BroadcastConfig {
    fn from(settings: BroadcastSettings) -> Self {
        Self {
            subscriber_capacity: settings.subscriber_capacity,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

type Item = Arc<LiveUpdate>;

#[derive(Debug)]
struct Registration {
    id: u64,
    tx: mpsc::Sender<Item>,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    evicted: AtomicU64,
    duplicates: AtomicU64,
}

#[derive(Debug, Default)]
struct Registry {
    subscribers: Mutex<HashMap<SubscriberKey, Registration>>,
    last_published: Mutex<HashMap<DeviceId, DateTime<Utc>>>,
    next_id: AtomicU64,
    counters: Counters,
}

impl Registry {
    /// Remove `key` only if it still holds registration `id`.
    fn remove_if_current(&self, key: &SubscriberKey, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let current = subscribers.get(key).is_some_and(|reg| reg.id == id);
        if current {
            subscribers.remove(key);
            metrics::set_subscribers(subscribers.len());
        }
        current
    }
}

// =============================================================================
// Publish Results
// =============================================================================

/// Result of a single [`BroadcastHub::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that accepted the item.
    pub delivered: usize,
    /// Subscribers removed because they could not accept it.
    pub evicted: usize,
}

/// Result of [`BroadcastHub::publish_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Same timestamp as the last published record for the device.
    Duplicate,
    /// Fanned out to matching subscribers.
    Published(PublishReport),
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Receiving end of one registration.
///
/// Implements [`Stream`]. Dropping the handle unregisters it, unless the key
/// has since been taken over by a newer subscription.
#[derive(Debug)]
pub struct Subscription {
    key: SubscriberKey,
    id: u64,
    rx: mpsc::Receiver<Item>,
    registry: Arc<Registry>,
}

impl Subscription {
    /// Key this handle was registered under.
    #[must_use]
    pub const fn key(&self) -> &SubscriberKey {
        &self.key
    }

    /// Wait for the next item; `None` once replaced, evicted or unsubscribed.
    pub async fn recv(&mut self) -> Option<Item> {
        self.rx.recv().await
    }

    /// Take an item if one is buffered.
    pub fn try_recv(&mut self) -> Option<Item> {
        self.rx.try_recv().ok()
    }

    /// Remove this registration now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Stream for Subscription {
    type Item = Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.registry.remove_if_current(&self.key, self.id) {
            tracing::debug!(key = %self.key, "Subscriber detached");
        }
    }
}

// =============================================================================
// Broadcast Hub
// =============================================================================

/// Central registry of live-data subscribers.
///
/// # Example
///
/// ```rust
/// use tibber_live_proxy::infrastructure::broadcast::{
///     BroadcastConfig, BroadcastHub, SubscriberKey,
/// };
/// use tibber_live_proxy::domain::telemetry::DeviceId;
///
/// let hub = BroadcastHub::new(BroadcastConfig::default());
/// let subscription = hub.subscribe(SubscriberKey::for_device(&DeviceId::new("home-123")));
/// assert_eq!(hub.subscriber_count(), 1);
/// drop(subscription);
/// assert_eq!(hub.subscriber_count(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    config: BroadcastConfig,
    registry: Arc<Registry>,
}

impl BroadcastHub {
    /// Create a new broadcast hub with the given configuration.
    #[must_use]
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::default()),
        }
    }

    /// Create a new broadcast hub with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BroadcastConfig::default())
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a bounded queue under `key`, replacing any previous one.
    #[must_use]
    pub fn subscribe(&self, key: SubscriberKey) -> Subscription {
        let capacity = self.config.subscriber_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        let replaced = {
            let mut subscribers = self.registry.subscribers.lock();
            let replaced = subscribers.insert(key.clone(), Registration { id, tx });
            metrics::set_subscribers(subscribers.len());
            replaced.is_some()
        };

        if replaced {
            tracing::debug!(key = %key, "Subscriber replaced existing registration");
        } else {
            tracing::debug!(key = %key, "Subscriber attached");
        }

        Subscription {
            key,
            id,
            rx,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Remove whatever is registered under `key`. Idempotent.
    pub fn unsubscribe(&self, key: &SubscriberKey) -> bool {
        let mut subscribers = self.registry.subscribers.lock();
        let removed = subscribers.remove(key).is_some();
        metrics::set_subscribers(subscribers.len());
        removed
    }

    /// Whether `key` currently has a registration.
    #[must_use]
    pub fn is_subscribed(&self, key: &SubscriberKey) -> bool {
        self.registry.subscribers.lock().contains_key(key)
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.lock().len()
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Offer `item` to every subscriber whose key satisfies `matches`.
    ///
    /// Subscribers that cannot accept the item are evicted.
    pub fn publish<F>(&self, item: &Item, matches: F) -> PublishReport
    where
        F: Fn(&SubscriberKey) -> bool,
    {
        let mut report = PublishReport::default();
        let remaining = {
            let mut subscribers = self.registry.subscribers.lock();
            subscribers.retain(|key, registration| {
                if !matches(key) {
                    return true;
                }
                match registration.tx.try_send(Arc::clone(item)) {
                    Ok(()) => {
                        report.delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!(key = %key, "Evicting slow subscriber");
                        report.evicted += 1;
                        false
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!(key = %key, "Evicting closed subscriber");
                        report.evicted += 1;
                        false
                    }
                }
            });
            subscribers.len()
        };

        let counters = &self.registry.counters;
        counters.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
        if report.evicted > 0 {
            counters.evicted.fetch_add(report.evicted as u64, Ordering::Relaxed);
            metrics::record_evicted(report.evicted as u64);
            metrics::set_subscribers(remaining);
        }
        report
    }

    /// Deduplicate, then publish to the device's subscribers and every firehose key.
    pub fn publish_update(&self, update: LiveUpdate) -> PublishOutcome {
        {
            let mut last = self.registry.last_published.lock();
            if last.get(&update.home_id) == Some(&update.timestamp()) {
                self.registry
                    .counters
                    .duplicates
                    .fetch_add(1, Ordering::Relaxed);
                metrics::record_duplicate();
                return PublishOutcome::Duplicate;
            }
            last.insert(update.home_id.clone(), update.timestamp());
        }

        let device = update.home_id.clone();
        let item = Arc::new(update);
        let report = self.publish(&item, |key| key.matches_device(&device));

        self.registry
            .counters
            .published
            .fetch_add(1, Ordering::Relaxed);
        metrics::record_published();
        PublishOutcome::Published(report)
    }

    /// Drop every registration scoped to `device` and forget its dedup state.
    ///
    /// Firehose subscribers are left alone. Returns how many were removed.
    pub fn close_device(&self, device: &DeviceId) -> usize {
        self.registry.last_published.lock().remove(device);

        let mut subscribers = self.registry.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|key, _| !key.is_scoped_to(device));
        let removed = before - subscribers.len();
        metrics::set_subscribers(subscribers.len());
        removed
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Snapshot of hub counters.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        let counters = &self.registry.counters;
        BroadcastStats {
            subscribers: self.subscriber_count(),
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            duplicates: counters.duplicates.load(Ordering::Relaxed),
        }
    }
}

/// Shared broadcast hub reference.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

/// Statistics about the hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BroadcastStats {
    /// Registered subscribers.
    pub subscribers: usize,
    /// Records that passed deduplication.
    pub published: u64,
    /// Individual deliveries.
    pub delivered: u64,
    /// Subscribers evicted.
    pub evicted: u64,
    /// Records skipped as duplicates.
    pub duplicates: u64,
}

// =============================================================================
// Tests
// =============================================================================

//! Re-sync rate limiting
//!
//! When a peer announces new components we re-run discovery against it. Two
//! peers that react to each other's announcements could otherwise trigger a
//! handshake storm, so unsolicited re-syncs of the same remote are spaced by
//! a minimum interval.
//!
//! # Policy
//!
//! - **First request, or interval elapsed**: re-sync now
//! - **Within the interval**: re-sync later, once the interval has elapsed
//! - **A later re-sync is already scheduled**: coalesce into it
//!
//! A deferred re-sync is never dropped, so a component registered during the
//! quiet period still becomes visible.
//!
//! # Example
//!
//! ```
//! use birpc_common::resync::{ResyncConfig, ResyncDecision, ResyncLimiter};
//! use std::time::Duration;
//!
//! let limiter = ResyncLimiter::new(ResyncConfig::new(Duration::from_secs(2)));
//!
//! assert_eq!(limiter.check(&"peer"), ResyncDecision::Now);
//! assert!(matches!(limiter.check(&"peer"), ResyncDecision::Deferred { .. }));
//! assert_eq!(limiter.check(&"peer"), ResyncDecision::Coalesced);
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Configuration for re-sync rate limiting.
#[derive(Clone, Debug)]
pub struct ResyncConfig {
    /// Minimum time between two unsolicited re-syncs of the same remote
    pub min_interval: Duration,
}

impl ResyncConfig {
    /// Creates a new re-sync configuration.
    ///
    /// # Arguments
    ///
    /// * `min_interval` - Minimum spacing between re-syncs of one remote
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }

    /// A configuration that never defers.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

/// Outcome of a re-sync check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResyncDecision {
    /// Re-sync immediately
    Now,
    /// Re-sync after `retry_after`, then call [`ResyncLimiter::complete_deferred`]
    Deferred {
        /// Time until the interval has elapsed
        retry_after: Duration,
    },
    /// A deferred re-sync is already pending and will cover this request
    Coalesced,
}

impl ResyncDecision {
    /// Returns whether the re-sync should run right away.
    pub fn is_now(&self) -> bool {
        matches!(self, Self::Now)
    }

    /// Returns the delay if the re-sync was deferred.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Deferred { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Re-sync bookkeeping for a single remote.
#[derive(Debug, Default)]
struct ResyncSlot {
    /// Last time a re-sync was started
    last_run: Option<Instant>,
    /// Whether a deferred re-sync is waiting to run
    scheduled: bool,
}

impl ResyncSlot {
    fn decide(&mut self, config: &ResyncConfig, now: Instant) -> ResyncDecision {
        if self.scheduled {
            return ResyncDecision::Coalesced;
        }

        let elapsed = self
            .last_run
            .map(|last| now.duration_since(last))
            .unwrap_or(Duration::MAX);

        if elapsed >= config.min_interval {
            self.last_run = Some(now);
            ResyncDecision::Now
        } else {
            self.scheduled = true;
            ResyncDecision::Deferred {
                retry_after: config.min_interval - elapsed,
            }
        }
    }
}

/// Per-remote re-sync limiter.
///
/// Cloning is cheap: clones share the same underlying slots.
#[derive(Clone, Debug)]
pub struct ResyncLimiter<K> {
    config: ResyncConfig,
    slots: Arc<Mutex<HashMap<K, ResyncSlot>>>,
}

impl<K> ResyncLimiter<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new(config: ResyncConfig) -> Self {
        Self {
            config,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ResyncConfig {
        &self.config
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, ResyncSlot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decides what to do with a re-sync request for `key`.
    pub fn check(&self, key: &K) -> ResyncDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &K, now: Instant) -> ResyncDecision {
        let mut slots = self.slots();
        slots
            .entry(key.clone())
            .or_default()
            .decide(&self.config, now)
    }

    /// Marks a deferred re-sync as started.
    ///
    /// Must be called by whoever received [`ResyncDecision::Deferred`], right
    /// before running the re-sync.
    pub fn complete_deferred(&self, key: &K) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(key) {
            slot.scheduled = false;
            slot.last_run = Some(Instant::now());
        }
    }

    /// Drops all state for `key` (the remote went away).
    pub fn forget(&self, key: &K) {
        self.slots().remove(key);
    }

    /// Returns the number of remotes currently being tracked.
    pub fn tracked_count(&self) -> usize {
        self.slots().len()
    }
}

//! Deduplication of detections into unique-barcode events.

use super::Detection;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Which earlier detections count as "already seen".
///
/// Membership is always exact string equality on the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Accepting a new value clears the set, which then holds only that value.
    ///
    /// One barcode per scan window: `A A B A` yields `A B A`, because the earlier `A`
    /// was forgotten when `B` was accepted.
    #[default]
    ClearOnUnique,
    /// Every accepted value stays seen for the whole session: `A A B A` yields `A B`.
    Session,
    /// A value is suppressed while it keeps being sighted within `window_ms` of its
    /// previous sighting.
    Window {
        /// Quiet period after which a value counts as new again
        window_ms: u64,
    },
}

/// Stateful filter applying a [`DedupPolicy`].
///
/// Owned by the single consumer thread, so no locking is involved.
#[derive(Debug)]
pub struct Deduplicator {
    policy: DedupPolicy,
    seen: Vec<Seen>,
}

#[derive(Debug)]
struct Seen {
    payload: String,
    last_sighting: Instant,
}

impl Deduplicator {
    /// Empty filter.
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            seen: Vec::new(),
        }
    }

    /// Active policy.
    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    /// Payloads currently treated as seen, oldest first.
    pub fn seen(&self) -> Vec<&str> {
        self.seen.iter().map(|s| s.payload.as_str()).collect()
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    /// Decide whether `detection` is new; updates the seen set accordingly.
    pub fn accept(&mut self, detection: &Detection) -> bool {
        let now = detection.arrived_at;
        if let DedupPolicy::Window { window_ms } = self.policy {
            let window = Duration::from_millis(window_ms);
            self.seen
                .retain(|s| now.saturating_duration_since(s.last_sighting) < window);
        }

        if let Some(existing) = self
            .seen
            .iter_mut()
            .find(|s| s.payload == detection.payload)
        {
            existing.last_sighting = now;
            return false;
        }

        if self.policy == DedupPolicy::ClearOnUnique {
            self.seen.clear();
        }
        self.seen.push(Seen {
            payload: detection.payload.clone(),
            last_sighting: now,
        });
        true
    }
}

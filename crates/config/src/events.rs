//! Change notification for configuration mutations.
//!
//! Responsibilities:
//! - Describe effective mutations as [`ConfigChangeEvent`]s.
//! - Fan events out to registered subscribers.
//! - Retain a bounded in-memory history of recent events.
//!
//! Does NOT handle:
//! - Deciding what counts as an effective mutation (see `store`).
//!
//! Invariants:
//! - History never exceeds its configured limit; the oldest events drop first.
//! - Subscriber ids are unique for the lifetime of the bus and never reused.
//! - Callbacks are invoked outside any store lock, so a subscriber may call
//!   back into the store.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::constants::DEFAULT_EVENT_HISTORY_LIMIT;

/// What triggered a configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// An explicit `set_value` / `delete_value` call.
    Api,
    /// A section (re)load from disk.
    Load,
    /// A migration rewrote the section document.
    Migration,
    /// An import replaced or merged section data.
    Import,
    /// A reset restored schema defaults.
    Reset,
}

/// One effective configuration mutation.
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    pub section: String,
    /// Dotted key within the section, or `None` for whole-section changes.
    pub key: Option<String>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub source: ChangeSource,
}

impl ConfigChangeEvent {
    pub fn new(
        section: &str,
        key: Option<&str>,
        old_value: Option<Value>,
        new_value: Option<Value>,
        source: ChangeSource,
    ) -> Self {
        Self {
            section: section.to_string(),
            key: key.map(str::to_string),
            old_value,
            new_value,
            timestamp: Utc::now(),
            source,
        }
    }
}

/// Subscription handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Subscriber = Arc<dyn Fn(&ConfigChangeEvent) + Send + Sync>;

/// Subscriber registry plus bounded event history.
///
/// The bus itself is not synchronized; the store guards it with its own
/// lock and releases section locks before publishing.
pub struct EventBus {
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    history: VecDeque<ConfigChangeEvent>,
    history_limit: usize,
    next_id: u64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .field("history", &self.history.len())
            .field("history_limit", &self.history_limit)
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_HISTORY_LIMIT)
    }
}

impl EventBus {
    pub fn new(history_limit: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            history: VecDeque::with_capacity(history_limit.min(64)),
            history_limit,
            next_id: 0,
        }
    }

    pub fn subscribe(
        &mut self,
        callback: impl Fn(&ConfigChangeEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Arc::new(callback)));
        id
    }

    /// Removes a subscriber. Returns false when the id is unknown, which is
    /// not an error; double-unsubscribe is allowed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
        self.subscribers.len() != before
    }

    /// Records an event in the history and returns the callbacks to invoke.
    ///
    /// Callers invoke the returned closures after releasing their locks so
    /// a subscriber can call back into the store without deadlocking.
    #[must_use]
    pub fn publish(&mut self, event: ConfigChangeEvent) -> Vec<Subscriber> {
        tracing::debug!(
            section = %event.section,
            key = event.key.as_deref().unwrap_or("<section>"),
            source = ?event.source,
            "Config change"
        );

        if self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(event);

        self.subscribers
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }

    /// Most recent events, oldest first, capped at `limit`.
    pub fn recent(&self, limit: usize) -> Vec<ConfigChangeEvent> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// The event recorded for a publish; used with the subscriber list from
    /// [`EventBus::publish`].
    pub fn last(&self) -> Option<&ConfigChangeEvent> {
        self.history.back()
    }
}

/// Invokes subscriber callbacks for an event. Free function so callers can
/// run it after dropping the bus lock.
pub fn notify(subscribers: &[Subscriber], event: &ConfigChangeEvent) {
    for callback in subscribers {
        callback(event);
    }
}

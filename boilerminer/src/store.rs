// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU Common Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Common Public License for more details.
//
// You should have received a copy of the GNU Common Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Shared data plane
//!
//! A single in-process store holding the latest value per key plus a
//! bounded history, decoupling producers (poller, UI, persistence) from
//! consumers (regulator, UI). Subscriber callbacks run on the writer's
//! thread after the store lock has been released, so a callback may
//! re-enter the store; it must not block.

use ii_logging::macros::*;

use crate::poller::TemperatureReading;

use boilerminer_config::{Mode, TemperatureSettings};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Default bound of the per-key history
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// The closed set of runtime keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKey {
    Temperature,
    TemperatureSettings,
    SystemStatus,
    IpAddressAsic,
    Mode,
    CoolingState,
    ValveStateUpper,
    ValveStateLower,
    Error,
}

impl DataKey {
    pub const ALL: [DataKey; 9] = [
        DataKey::Temperature,
        DataKey::TemperatureSettings,
        DataKey::SystemStatus,
        DataKey::IpAddressAsic,
        DataKey::Mode,
        DataKey::CoolingState,
        DataKey::ValveStateUpper,
        DataKey::ValveStateLower,
        DataKey::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataKey::Temperature => "temperature",
            DataKey::TemperatureSettings => "temperature_settings",
            DataKey::SystemStatus => "system_status",
            DataKey::IpAddressAsic => "ip_address_asic",
            DataKey::Mode => "mode",
            DataKey::CoolingState => "cooling_state",
            DataKey::ValveStateUpper => "valve_state_upper",
            DataKey::ValveStateLower => "valve_state_lower",
            DataKey::Error => "error",
        }
    }
}

/// Value written under a key. The store is typed: each key carries one
/// variant, enforced by the producers.
#[derive(Debug, Clone)]
pub enum Value {
    Temperature(TemperatureReading),
    Settings(TemperatureSettings),
    Mode(Mode),
    Bool(bool),
    Text(String),
}

impl Value {
    pub fn as_temperature(&self) -> Option<&TemperatureReading> {
        match self {
            Value::Temperature(reading) => Some(reading),
            _ => None,
        }
    }

    pub fn as_settings(&self) -> Option<TemperatureSettings> {
        match self {
            Value::Settings(settings) => Some(*settings),
            _ => None,
        }
    }

    pub fn as_mode(&self) -> Option<Mode> {
        match self {
            Value::Mode(mode) => Some(*mode),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// One committed write
#[derive(Debug, Clone)]
pub struct DataEntry {
    pub value: Value,
    /// Monotonic commit time, used for freshness checks
    pub instant: Instant,
    /// Wall-clock commit time, used for display and logs
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub metadata: HashMap<String, String>,
}

impl DataEntry {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.instant)
    }
}

type Callback = Arc<dyn Fn(&DataEntry) + Send + Sync>;

/// Handle returned from `subscribe`, consumed by `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId {
    key: DataKey,
    id: u64,
}

#[derive(Debug, Clone)]
pub struct Statistics {
    pub total_updates: u64,
    pub updates_by_key: HashMap<DataKey, u64>,
    pub updates_by_source: HashMap<String, u64>,
    pub history_sizes: HashMap<DataKey, usize>,
    pub subscriber_counts: HashMap<DataKey, usize>,
    pub uptime: Duration,
}

struct Inner {
    latest: HashMap<DataKey, DataEntry>,
    history: HashMap<DataKey, VecDeque<DataEntry>>,
    subscribers: HashMap<DataKey, Vec<(u64, Callback)>>,
    next_subscriber_id: u64,
    total_updates: u64,
    updates_by_key: HashMap<DataKey, u64>,
    updates_by_source: HashMap<String, u64>,
    started: Instant,
}

pub struct DataStore {
    history_limit: usize,
    inner: Mutex<Inner>,
}

impl DataStore {
    pub fn new() -> Arc<Self> {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            history_limit,
            inner: Mutex::new(Inner {
                latest: HashMap::new(),
                history: HashMap::new(),
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
                total_updates: 0,
                updates_by_key: HashMap::new(),
                updates_by_source: HashMap::new(),
                started: Instant::now(),
            }),
        })
    }

    /// Atomically replace the latest entry under `key` and notify
    /// subscribers (outside the lock, in commit order).
    pub fn set(&self, key: DataKey, value: Value, source: &str, metadata: HashMap<String, String>) {
        self.set_at(key, value, source, metadata, Instant::now());
    }

    /// Same as `set` with an explicit commit instant (passed explicitly
    /// to facilitate testing of freshness-dependent consumers).
    pub fn set_at(
        &self,
        key: DataKey,
        value: Value,
        source: &str,
        metadata: HashMap<String, String>,
        now: Instant,
    ) {
        let entry = DataEntry {
            value,
            instant: now,
            timestamp: Utc::now(),
            source: source.to_string(),
            metadata,
        };

        let callbacks: Vec<Callback> = {
            let mut inner = self.inner.lock().expect("BUG: data store lock poisoned");

            inner.latest.insert(key, entry.clone());
            let history = inner.history.entry(key).or_insert_with(VecDeque::new);
            history.push_back(entry.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }

            inner.total_updates += 1;
            *inner.updates_by_key.entry(key).or_insert(0) += 1;
            *inner
                .updates_by_source
                .entry(entry.source.clone())
                .or_insert(0) += 1;

            inner
                .subscribers
                .get(&key)
                .map(|subscribers| subscribers.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };

        for callback in callbacks {
            callback(&entry);
        }
    }

    pub fn get(&self, key: DataKey) -> Option<DataEntry> {
        self.inner
            .lock()
            .expect("BUG: data store lock poisoned")
            .latest
            .get(&key)
            .cloned()
    }

    pub fn get_value(&self, key: DataKey) -> Option<Value> {
        self.get(key).map(|entry| entry.value)
    }

    /// Register a callback for writes under `key`. The callback runs on
    /// the writer's thread and must not block.
    pub fn subscribe<F>(&self, key: DataKey, callback: F) -> SubscriptionId
    where
        F: Fn(&DataEntry) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("BUG: data store lock poisoned");
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner
            .subscribers
            .entry(key)
            .or_insert_with(Vec::new)
            .push((id, Arc::new(callback)));
        SubscriptionId { key, id }
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        let mut inner = self.inner.lock().expect("BUG: data store lock poisoned");
        if let Some(subscribers) = inner.subscribers.get_mut(&subscription.key) {
            subscribers.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Snapshot of the history, oldest first
    pub fn history(
        &self,
        key: DataKey,
        limit: Option<usize>,
        since: Option<Instant>,
    ) -> Vec<DataEntry> {
        let inner = self.inner.lock().expect("BUG: data store lock poisoned");
        let mut entries: Vec<DataEntry> = inner
            .history
            .get(&key)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default();
        drop(inner);

        if let Some(since) = since {
            entries.retain(|entry| entry.instant >= since);
        }
        if let Some(limit) = limit {
            if entries.len() > limit {
                entries.drain(..entries.len() - limit);
            }
        }
        entries
    }

    /// An entry exists and is not older than `max_age`
    pub fn is_fresh(&self, key: DataKey, max_age: Duration) -> bool {
        self.is_fresh_at(key, max_age, Instant::now())
    }

    pub fn is_fresh_at(&self, key: DataKey, max_age: Duration, now: Instant) -> bool {
        match self.get(key) {
            Some(entry) => entry.age(now) <= max_age,
            None => false,
        }
    }

    pub fn statistics(&self) -> Statistics {
        let inner = self.inner.lock().expect("BUG: data store lock poisoned");
        Statistics {
            total_updates: inner.total_updates,
            updates_by_key: inner.updates_by_key.clone(),
            updates_by_source: inner.updates_by_source.clone(),
            history_sizes: inner
                .history
                .iter()
                .map(|(key, history)| (*key, history.len()))
                .collect(),
            subscriber_counts: inner
                .subscribers
                .iter()
                .map(|(key, subscribers)| (*key, subscribers.len()))
                .collect(),
            uptime: inner.started.elapsed(),
        }
    }

    pub fn clear_history(&self, key: Option<DataKey>) {
        let mut inner = self.inner.lock().expect("BUG: data store lock poisoned");
        match key {
            Some(key) => {
                if let Some(history) = inner.history.get_mut(&key) {
                    history.clear();
                }
            }
            None => inner.history.clear(),
        }
    }

    /// Consistent snapshot of the latest entry under every populated key
    pub fn all_latest(&self) -> HashMap<DataKey, DataEntry> {
        self.inner
            .lock()
            .expect("BUG: data store lock poisoned")
            .latest
            .clone()
    }

    /// Log-friendly dump of the latest entries, used by diagnostics
    pub fn dump_latest(&self) {
        let latest = self.all_latest();
        for key in DataKey::ALL.iter() {
            if let Some(entry) = latest.get(key) {
                debug!(
                    "store: {} = {:?} (source {}, age {:?})",
                    key.as_str(),
                    entry.value,
                    entry.source,
                    entry.age(Instant::now())
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bool_entry(store: &DataStore, key: DataKey, value: bool) {
        store.set(key, Value::Bool(value), "test", HashMap::new());
    }

    #[test]
    fn test_set_and_get() {
        let store = DataStore::new();
        assert!(store.get(DataKey::CoolingState).is_none());

        bool_entry(&store, DataKey::CoolingState, true);
        let entry = store.get(DataKey::CoolingState).unwrap();
        assert_eq!(entry.value.as_bool(), Some(true));
        assert_eq!(entry.source, "test");

        bool_entry(&store, DataKey::CoolingState, false);
        assert_eq!(
            store.get_value(DataKey::CoolingState).unwrap().as_bool(),
            Some(false)
        );
    }

    #[test]
    fn test_subscribers_see_writes_in_order() {
        let store = DataStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        store.subscribe(DataKey::Mode, move |entry| {
            sink.lock().unwrap().push(entry.value.as_mode().unwrap());
        });

        for mode in [Mode::Auto, Mode::Manual, Mode::Predictive].iter() {
            store.set(DataKey::Mode, Value::Mode(*mode), "test", HashMap::new());
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Mode::Auto, Mode::Manual, Mode::Predictive]
        );
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let store = DataStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let subscription = store.subscribe(DataKey::CoolingState, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bool_entry(&store, DataKey::CoolingState, true);
        store.unsubscribe(subscription);
        bool_entry(&store, DataKey::CoolingState, false);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// A callback that writes back into the store must not deadlock
    #[test]
    fn test_subscriber_may_reenter_store() {
        let store = DataStore::new();

        let reentrant = store.clone();
        store.subscribe(DataKey::Mode, move |_| {
            reentrant.set(
                DataKey::SystemStatus,
                Value::Text("mode changed".to_string()),
                "listener",
                HashMap::new(),
            );
        });

        store.set(
            DataKey::Mode,
            Value::Mode(Mode::Manual),
            "test",
            HashMap::new(),
        );
        assert_eq!(
            store
                .get_value(DataKey::SystemStatus)
                .unwrap()
                .as_text()
                .unwrap(),
            "mode changed"
        );
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let store = DataStore::with_history_limit(3);
        for i in 0..5 {
            bool_entry(&store, DataKey::CoolingState, i % 2 == 0);
        }
        let history = store.history(DataKey::CoolingState, None, None);
        assert_eq!(history.len(), 3);
        // Oldest entries were evicted: remaining are writes 2, 3, 4
        assert_eq!(history[0].value.as_bool(), Some(true));
        assert_eq!(history[1].value.as_bool(), Some(false));
        assert_eq!(history[2].value.as_bool(), Some(true));
    }

    #[test]
    fn test_history_limit_and_since() {
        let store = DataStore::new();
        let base = Instant::now();
        for i in 0..10u64 {
            store.set_at(
                DataKey::CoolingState,
                Value::Bool(true),
                "test",
                HashMap::new(),
                base + Duration::from_secs(i),
            );
        }
        assert_eq!(store.history(DataKey::CoolingState, Some(4), None).len(), 4);
        let recent = store.history(
            DataKey::CoolingState,
            None,
            Some(base + Duration::from_secs(7)),
        );
        assert_eq!(recent.len(), 3);
    }

    #[test]
    fn test_freshness() {
        let store = DataStore::new();
        let base = Instant::now();
        assert!(!store.is_fresh_at(DataKey::Temperature, Duration::from_secs(10), base));

        store.set_at(
            DataKey::CoolingState,
            Value::Bool(true),
            "test",
            HashMap::new(),
            base,
        );
        assert!(store.is_fresh_at(
            DataKey::CoolingState,
            Duration::from_secs(10),
            base + Duration::from_secs(10)
        ));
        assert!(!store.is_fresh_at(
            DataKey::CoolingState,
            Duration::from_secs(10),
            base + Duration::from_secs(11)
        ));
    }

    #[test]
    fn test_statistics_by_key_and_source() {
        let store = DataStore::new();
        bool_entry(&store, DataKey::CoolingState, true);
        bool_entry(&store, DataKey::CoolingState, false);
        store.set(
            DataKey::Mode,
            Value::Mode(Mode::Auto),
            "boot",
            HashMap::new(),
        );

        let stats = store.statistics();
        assert_eq!(stats.total_updates, 3);
        assert_eq!(stats.updates_by_key[&DataKey::CoolingState], 2);
        assert_eq!(stats.updates_by_key[&DataKey::Mode], 1);
        assert_eq!(stats.updates_by_source["test"], 2);
        assert_eq!(stats.updates_by_source["boot"], 1);
    }
}

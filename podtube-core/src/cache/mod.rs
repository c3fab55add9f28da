mod items;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use items::{
    expire_after, format_size, ArtifactCacheItem, AvailabilityVerdict, CachedItem,
};

/// Namespace holding converted audio files.
pub const AUDIO_FILES: &str = "AUDIO_FILES";
/// Namespace holding availability verdicts for video keys.
pub const VIDEO_LINKS: &str = "VIDEO_LINKS";

/// Anything the store can expire. `release` runs exactly once, when the item
/// leaves the store through `remove`, `remove_all` or `sweep_expired`.
pub trait CacheItem: Send + Sync {
    fn expire(&self) -> DateTime<Utc>;

    fn name(&self) -> Option<String> {
        None
    }

    /// Display name once an operator label is set.
    fn labelled(&self, label: &str) -> String {
        label.to_string()
    }

    fn release(&self) {}
}

struct Slot<I> {
    item: Arc<I>,
    label: Option<String>,
}

impl<I: CacheItem> Slot<I> {
    fn display_name(&self) -> Option<String> {
        match &self.label {
            Some(label) => Some(self.item.labelled(label)),
            None => self.item.name(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub key: String,
    pub label: Option<String>,
    pub expire: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceSnapshot {
    pub name: String,
    pub entries: Vec<EntrySnapshot>,
}

/// Namespaced key/value store of expiring items.
///
/// All operations take a single internal lock, so the store can be shared
/// between request handlers and conversion tasks behind an `Arc`. Release
/// hooks always run after the lock is dropped.
pub struct CacheStore<I> {
    namespaces: Mutex<HashMap<String, HashMap<String, Slot<I>>>>,
}

impl<I> Default for CacheStore<I> {
    fn default() -> Self {
        Self {
            namespaces: Mutex::new(HashMap::new()),
        }
    }
}

impl<I> std::fmt::Debug for CacheStore<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let namespaces = self.lock();
        let counts: HashMap<&str, usize> = namespaces
            .iter()
            .map(|(name, items)| (name.as_str(), items.len()))
            .collect();
        f.debug_struct("CacheStore")
            .field("namespaces", &counts)
            .finish()
    }
}

impl<I> CacheStore<I> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, Slot<I>>>> {
        self.namespaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<I: CacheItem> CacheStore<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<Arc<I>> {
        self.lock()
            .get(namespace)
            .and_then(|items| items.get(key))
            .map(|slot| Arc::clone(&slot.item))
    }

    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        self.lock()
            .get(namespace)
            .map(|items| items.contains_key(key))
            .unwrap_or(false)
    }

    /// Stores `item`, returning the item it replaced. The replaced item is
    /// handed back unreleased: a successor usually owns the same resource.
    pub fn set(&self, namespace: &str, key: &str, item: I) -> Option<Arc<I>> {
        self.lock()
            .entry(namespace.to_string())
            .or_default()
            .insert(
                key.to_string(),
                Slot {
                    item: Arc::new(item),
                    label: None,
                },
            )
            .map(|slot| slot.item)
    }

    /// Returns the stored item, building it with `factory` only when absent.
    /// `factory` runs under the store lock and must not call back into it.
    pub fn get_or_add<F>(&self, namespace: &str, key: &str, factory: F) -> Arc<I>
    where
        F: FnOnce() -> I,
    {
        let mut namespaces = self.lock();
        let slot = namespaces
            .entry(namespace.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| Slot {
                item: Arc::new(factory()),
                label: None,
            });
        Arc::clone(&slot.item)
    }

    pub fn remove(&self, namespace: &str, key: &str) -> bool {
        let removed = {
            let mut namespaces = self.lock();
            let Some(items) = namespaces.get_mut(namespace) else {
                return false;
            };
            let removed = items.remove(key);
            if items.is_empty() {
                namespaces.remove(namespace);
            }
            removed
        };
        match removed {
            Some(slot) => {
                slot.item.release();
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self, namespace: &str) -> usize {
        let removed = self.lock().remove(namespace);
        let Some(items) = removed else {
            return 0;
        };
        let count = items.len();
        for slot in items.into_values() {
            slot.item.release();
        }
        count
    }

    /// Removes and releases every item with `expire <= now`. Only namespaces
    /// that lost at least one item appear in the result.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> HashMap<String, usize> {
        let mut expired = Vec::new();
        let mut counts = HashMap::new();
        {
            let mut namespaces = self.lock();
            for (name, items) in namespaces.iter_mut() {
                let keys: Vec<String> = items
                    .iter()
                    .filter(|(_, slot)| slot.item.expire() <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                if keys.is_empty() {
                    continue;
                }
                counts.insert(name.clone(), keys.len());
                expired.extend(keys.iter().filter_map(|key| items.remove(key)));
            }
            namespaces.retain(|_, items| !items.is_empty());
        }
        for slot in expired {
            slot.item.release();
        }
        counts
    }

    /// Overrides the display label of an item. Returns false when absent.
    pub fn set_label(&self, namespace: &str, key: &str, label: impl Into<String>) -> bool {
        match self
            .lock()
            .get_mut(namespace)
            .and_then(|items| items.get_mut(key))
        {
            Some(slot) => {
                slot.label = Some(label.into());
                true
            }
            None => false,
        }
    }

    pub fn label(&self, namespace: &str, key: &str) -> Option<String> {
        let namespaces = self.lock();
        namespaces.get(namespace)?.get(key)?.display_name()
    }

    pub fn len(&self, namespace: &str) -> usize {
        self.lock().get(namespace).map(HashMap::len).unwrap_or(0)
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Point-in-time listing, newest expiry first within each namespace.
    pub fn snapshot(&self) -> Vec<NamespaceSnapshot> {
        let namespaces = self.lock();
        let mut snapshot: Vec<NamespaceSnapshot> = namespaces
            .iter()
            .map(|(name, items)| {
                let mut entries: Vec<EntrySnapshot> = items
                    .iter()
                    .map(|(key, slot)| EntrySnapshot {
                        key: key.clone(),
                        label: slot.display_name(),
                        expire: slot.item.expire(),
                    })
                    .collect();
                entries.sort_by(|a, b| b.expire.cmp(&a.expire).then_with(|| a.key.cmp(&b.key)));
                NamespaceSnapshot {
                    name: name.clone(),
                    entries,
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration;

    use super::*;

    struct Probe {
        expire: DateTime<Utc>,
        released: Arc<AtomicUsize>,
    }

    impl CacheItem for Probe {
        fn expire(&self) -> DateTime<Utc> {
            self.expire
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probe(expire: DateTime<Utc>, released: &Arc<AtomicUsize>) -> Probe {
        Probe {
            expire,
            released: Arc::clone(released),
        }
    }

    #[test]
    fn get_or_add_builds_once() {
        let store = CacheStore::new();
        let released = Arc::new(AtomicUsize::new(0));
        let built = AtomicUsize::new(0);
        let expire = Utc::now() + Duration::hours(1);
        for _ in 0..3 {
            store.get_or_add("ns", "k", || {
                built.fetch_add(1, Ordering::SeqCst);
                probe(expire, &released)
            });
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(store.len("ns"), 1);
    }

    #[test]
    fn remove_releases_and_prunes_namespace() {
        let store = CacheStore::new();
        let released = Arc::new(AtomicUsize::new(0));
        store.set("ns", "k", probe(Utc::now(), &released));
        assert!(store.remove("ns", "k"));
        assert!(!store.remove("ns", "k"));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(store.namespaces().is_empty());
    }

    #[test]
    fn remove_all_counts_items() {
        let store = CacheStore::new();
        let released = Arc::new(AtomicUsize::new(0));
        let expire = Utc::now() + Duration::minutes(5);
        store.set("a", "1", probe(expire, &released));
        store.set("a", "2", probe(expire, &released));
        store.set("b", "1", probe(expire, &released));
        assert_eq!(store.remove_all("a"), 2);
        assert_eq!(store.remove_all("missing"), 0);
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert_eq!(store.namespaces(), vec!["b".to_string()]);
    }

    #[test]
    fn set_returns_replaced_item_without_release() {
        let store = CacheStore::new();
        let released = Arc::new(AtomicUsize::new(0));
        let first = Utc::now();
        assert!(store.set("ns", "k", probe(first, &released)).is_none());
        let previous = store
            .set("ns", "k", probe(first + Duration::hours(1), &released))
            .expect("replaced item");
        assert_eq!(previous.expire(), first);
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sweep_removes_items_at_or_before_now() {
        let store = CacheStore::new();
        let released = Arc::new(AtomicUsize::new(0));
        let now = Utc::now();
        store.set("audio", "old", probe(now - Duration::seconds(1), &released));
        store.set("audio", "edge", probe(now, &released));
        store.set("audio", "fresh", probe(now + Duration::seconds(1), &released));
        store.set("links", "gone", probe(now - Duration::hours(1), &released));

        assert!(store.get("audio", "edge").is_some());
        let counts = store.sweep_expired(now);

        assert_eq!(counts.get("audio"), Some(&2));
        assert_eq!(counts.get("links"), Some(&1));
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert!(store.get("audio", "edge").is_none());
        assert!(store.get("audio", "fresh").is_some());
        assert_eq!(store.namespaces(), vec!["audio".to_string()]);
        assert!(store.sweep_expired(now).is_empty());
    }

    #[test]
    fn labels_override_item_names() {
        let store = CacheStore::new();
        let released = Arc::new(AtomicUsize::new(0));
        store.set("ns", "k", probe(Utc::now(), &released));
        assert_eq!(store.label("ns", "k"), None);
        assert!(store.set_label("ns", "k", "Episode 12"));
        assert!(!store.set_label("ns", "missing", "x"));
        assert_eq!(store.label("ns", "k").as_deref(), Some("Episode 12"));
    }

    #[test]
    fn snapshot_orders_by_expiry_descending() {
        let store = CacheStore::new();
        let released = Arc::new(AtomicUsize::new(0));
        let now = Utc::now();
        store.set("ns", "early", probe(now, &released));
        store.set("ns", "late", probe(now + Duration::hours(2), &released));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        let keys: Vec<&str> = snapshot[0].entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["late", "early"]);
    }
}

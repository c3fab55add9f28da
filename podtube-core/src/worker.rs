//! Background scheduling: the conversion worker drains the queue on a fixed
//! tick and the cache janitor sweeps expired items on its own period.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{interval, MissedTickBehavior};

use crate::artifact::ArtifactDir;
use crate::cache::{
    expire_after, ArtifactCacheItem, AvailabilityVerdict, CacheStore, CachedItem, AUDIO_FILES,
    VIDEO_LINKS,
};
use crate::classify::FailureClassifier;
use crate::config::PodtubeConfig;
use crate::convert::Converter;
use crate::queue::ConversionQueue;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_concurrent: usize,
    pub tick_interval: StdDuration,
    pub audio_ttl: Duration,
    pub verdict_ttl: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &PodtubeConfig) -> Self {
        Self {
            max_concurrent: config.conversion.max_concurrent,
            tick_interval: config.conversion.tick_interval(),
            audio_ttl: config.cache.audio_ttl(),
            verdict_ttl: config.cache.verdict_ttl(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&PodtubeConfig::default())
    }
}

/// Spawns one conversion task per pending key. Tasks share a semaphore of
/// `max_concurrent` permits, so queued keys beyond the cap wait for a slot.
#[derive(Clone)]
pub struct ConversionWorker {
    queue: Arc<ConversionQueue>,
    cache: Arc<CacheStore<CachedItem>>,
    artifacts: ArtifactDir,
    converter: Arc<dyn Converter>,
    classifier: Arc<FailureClassifier>,
    semaphore: Arc<Semaphore>,
    active: Arc<Mutex<HashSet<String>>>,
    settings: WorkerSettings,
}

impl ConversionWorker {
    pub fn new(
        queue: Arc<ConversionQueue>,
        cache: Arc<CacheStore<CachedItem>>,
        artifacts: ArtifactDir,
        converter: Arc<dyn Converter>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            cache,
            artifacts,
            converter,
            classifier: Arc::new(FailureClassifier::default()),
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            active: Arc::new(Mutex::new(HashSet::new())),
            settings,
        }
    }

    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    fn active(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keys with a spawned task, whether converting or waiting for a permit.
    pub fn in_flight(&self) -> usize {
        self.active().len()
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Claims every pending key without a task and spawns its conversion.
    /// Returns the claimed keys in spawn order.
    pub fn tick(&self) -> Vec<String> {
        let mut spawned = Vec::new();
        for key in self.queue.pending() {
            if !self.active().insert(key.clone()) {
                continue;
            }
            // In progress before the permit is acquired, so the next tick skips it.
            if !self.queue.mark_in_progress(&key) {
                self.active().remove(&key);
                continue;
            }
            let worker = self.clone();
            let task_key = key.clone();
            tokio::spawn(async move { worker.convert_one(task_key).await });
            spawned.push(key);
        }
        if !spawned.is_empty() {
            tracing::debug!(target: "conversion_worker", count = spawned.len(), "spawned conversions");
        }
        spawned
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            target: "conversion_worker",
            max_concurrent = self.settings.max_concurrent,
            "starting conversion worker"
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
        tracing::info!(target: "conversion_worker", "conversion worker stopped");
    }

    async fn convert_one(self, key: String) {
        let _claim = TaskClaim {
            queue: Arc::clone(&self.queue),
            active: Arc::clone(&self.active),
            key: key.clone(),
        };
        let Ok(_permit) = self.semaphore.acquire().await else {
            return;
        };
        tracing::info!(target: "conversion_worker", key = %key, "start converting");
        let destination = self.artifacts.artifact_path(&key);
        match self.converter.convert(&key, &destination).await {
            Ok(path) => match ArtifactCacheItem::from_file(&path, self.settings.audio_ttl) {
                Ok(item) => {
                    self.cache.set(AUDIO_FILES, &key, item.into());
                    tracing::info!(target: "conversion_worker", key = %key, "converted");
                }
                Err(err) => tracing::error!(
                    target: "conversion_worker",
                    key = %key,
                    path = %path.display(),
                    error = %err,
                    "converted file is unreadable"
                ),
            },
            Err(err) if !err.is_classifiable() => {
                tracing::error!(target: "conversion_worker", key = %key, error = %err, "conversion failed");
            }
            Err(err) => {
                let text = err.to_string();
                match self.classifier.classify(&text) {
                    Some(rule) => {
                        tracing::warn!(
                            target: "conversion_worker",
                            key = %key,
                            kind = %rule.kind,
                            reason = %rule.message,
                            "video unavailable"
                        );
                        let verdict = AvailabilityVerdict::new(
                            rule.kind,
                            rule.message.clone(),
                            expire_after(Utc::now(), self.settings.verdict_ttl),
                        );
                        self.cache.set(VIDEO_LINKS, &key, verdict.into());
                    }
                    None => tracing::error!(
                        target: "conversion_worker",
                        key = %key,
                        error = %text,
                        "conversion failed"
                    ),
                }
            }
        }
    }
}

/// Releases the queue entry and the task claim on every exit path,
/// unwinding included.
struct TaskClaim {
    queue: Arc<ConversionQueue>,
    active: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for TaskClaim {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        self.queue.remove(&self.key);
    }
}

/// Periodically evicts expired cache items, deleting artifacts as it goes.
pub struct CacheJanitor {
    cache: Arc<CacheStore<CachedItem>>,
    period: StdDuration,
}

impl CacheJanitor {
    pub fn new(cache: Arc<CacheStore<CachedItem>>, period: StdDuration) -> Self {
        Self { cache, period }
    }

    pub fn sweep(&self) -> HashMap<String, usize> {
        let removed = self.cache.sweep_expired(Utc::now());
        for (namespace, count) in &removed {
            tracing::info!(target: "cache_janitor", namespace = %namespace, removed = count, "cleaned expired items");
        }
        removed
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already rehydrated.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }
}

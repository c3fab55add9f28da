use std::io;
use std::path::{Path, PathBuf};

use chrono::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::{ArtifactCacheItem, CacheStore, CachedItem, AUDIO_FILES};
use crate::convert::STAGING_PREFIX;

const MAX_KEY_LEN: usize = 64;

/// Directory holding one `<key>.mp3` per converted video.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    root: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RehydrateReport {
    pub registered: Vec<String>,
    pub removed: Vec<PathBuf>,
}

/// Read-only view of the directory: finished artifacts and the leftovers of
/// interrupted conversions.
#[derive(Debug, Default)]
pub struct ArtifactScan {
    pub artifacts: Vec<(String, ArtifactCacheItem)>,
    pub leftovers: Vec<PathBuf>,
}

impl ArtifactDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys are path components, so only `[A-Za-z0-9_-]` is accepted.
    pub fn is_valid_key(key: &str) -> bool {
        !key.is_empty()
            && key.len() <= MAX_KEY_LEN
            && key
                .bytes()
                .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-')
    }

    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.mp3"))
    }

    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Lists artifacts (sorted by key) and leftovers without touching them.
    /// A missing directory scans as empty.
    pub fn scan(&self, ttl: Duration) -> io::Result<ArtifactScan> {
        let mut scan = ArtifactScan::default();
        if !self.root.is_dir() {
            return Ok(scan);
        }
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            let path = entry.path();
            if entry.file_type().is_dir() {
                if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                    scan.leftovers.push(path.to_path_buf());
                }
                continue;
            }
            match path.extension().and_then(|ext| ext.to_str()) {
                Some("tmp") => scan.leftovers.push(path.to_path_buf()),
                Some("mp3") => {
                    let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                        continue;
                    };
                    if !Self::is_valid_key(key) {
                        warn!(path = %path.display(), "skipping audio file with unexpected name");
                        continue;
                    }
                    let item = ArtifactCacheItem::from_file(path, ttl)?;
                    scan.artifacts.push((key.to_string(), item));
                }
                _ => debug!(path = %path.display(), "ignoring file in audio directory"),
            }
        }
        scan.artifacts.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(scan)
    }

    /// Deletes leftovers of interrupted conversions and registers every
    /// finished artifact so it expires like a freshly converted one.
    pub fn rehydrate(
        &self,
        cache: &CacheStore<CachedItem>,
        ttl: Duration,
    ) -> io::Result<RehydrateReport> {
        self.ensure()?;
        let scan = self.scan(ttl)?;
        let mut report = RehydrateReport::default();
        for leftover in scan.leftovers {
            remove_leftover(&leftover)?;
            report.removed.push(leftover);
        }
        for (key, item) in scan.artifacts {
            cache.set(AUDIO_FILES, &key, item.into());
            report.registered.push(key);
        }
        info!(
            dir = %self.root.display(),
            registered = report.registered.len(),
            removed = report.removed.len(),
            "rehydrated audio directory"
        );
        Ok(report)
    }
}

pub fn remove_leftover(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

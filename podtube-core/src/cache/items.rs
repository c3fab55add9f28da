use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::CacheItem;
use crate::classify::UnavailableKind;

/// A converted audio file on disk. Releasing it deletes the file.
#[derive(Debug, Clone)]
pub struct ArtifactCacheItem {
    path: PathBuf,
    expire: DateTime<Utc>,
}

impl ArtifactCacheItem {
    pub fn new(path: impl Into<PathBuf>, expire: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            expire,
        }
    }

    /// Expiry is the file's creation time plus `ttl`; filesystems without a
    /// birth time fall back to the modification time.
    pub fn from_file(path: impl Into<PathBuf>, ttl: Duration) -> io::Result<Self> {
        let path = path.into();
        let metadata = std::fs::metadata(&path)?;
        let created = metadata.created().or_else(|_| metadata.modified())?;
        Ok(Self::new(path, expire_after(created.into(), ttl)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn size_text(&self) -> String {
        std::fs::metadata(&self.path)
            .map(|metadata| format_size(metadata.len()))
            .unwrap_or_else(|_| "missing".to_string())
    }
}

impl CacheItem for ArtifactCacheItem {
    fn expire(&self) -> DateTime<Utc> {
        self.expire
    }

    fn name(&self) -> Option<String> {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string());
        Some(format!("{file_name} ({})", self.size_text()))
    }

    fn labelled(&self, label: &str) -> String {
        format!("{label} ({})", self.size_text())
    }

    fn release(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "deleted audio file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to delete audio file")
            }
        }
    }
}

/// Why a key cannot be converted, remembered for a short while so repeated
/// requests do not hammer the upstream.
#[derive(Debug, Clone)]
pub struct AvailabilityVerdict {
    pub kind: UnavailableKind,
    pub message: String,
    expire: DateTime<Utc>,
}

impl AvailabilityVerdict {
    pub fn new(kind: UnavailableKind, message: impl Into<String>, expire: DateTime<Utc>) -> Self {
        Self {
            kind,
            message: message.into(),
            expire,
        }
    }
}

impl CacheItem for AvailabilityVerdict {
    fn expire(&self) -> DateTime<Utc> {
        self.expire
    }

    fn name(&self) -> Option<String> {
        Some(self.message.clone())
    }
}

#[derive(Debug, Clone)]
pub enum CachedItem {
    Artifact(ArtifactCacheItem),
    Verdict(AvailabilityVerdict),
}

impl CachedItem {
    pub fn as_artifact(&self) -> Option<&ArtifactCacheItem> {
        match self {
            CachedItem::Artifact(artifact) => Some(artifact),
            CachedItem::Verdict(_) => None,
        }
    }

    pub fn as_verdict(&self) -> Option<&AvailabilityVerdict> {
        match self {
            CachedItem::Verdict(verdict) => Some(verdict),
            CachedItem::Artifact(_) => None,
        }
    }
}

impl From<ArtifactCacheItem> for CachedItem {
    fn from(item: ArtifactCacheItem) -> Self {
        CachedItem::Artifact(item)
    }
}

impl From<AvailabilityVerdict> for CachedItem {
    fn from(item: AvailabilityVerdict) -> Self {
        CachedItem::Verdict(item)
    }
}

impl CacheItem for CachedItem {
    fn expire(&self) -> DateTime<Utc> {
        match self {
            CachedItem::Artifact(item) => item.expire(),
            CachedItem::Verdict(item) => item.expire(),
        }
    }

    fn name(&self) -> Option<String> {
        match self {
            CachedItem::Artifact(item) => item.name(),
            CachedItem::Verdict(item) => item.name(),
        }
    }

    fn labelled(&self, label: &str) -> String {
        match self {
            CachedItem::Artifact(item) => item.labelled(label),
            CachedItem::Verdict(item) => item.labelled(label),
        }
    }

    fn release(&self) {
        match self {
            CachedItem::Artifact(item) => item.release(),
            CachedItem::Verdict(item) => item.release(),
        }
    }
}

/// `start + ttl`, saturating at the latest representable instant.
pub fn expire_after(start: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    start
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;
    const TIB: u64 = 1 << 40;
    if bytes > TIB {
        format!("{}TiB", bytes / TIB)
    } else if bytes > GIB {
        format!("{}GiB", bytes / GIB)
    } else if bytes > MIB {
        format!("{}MiB", bytes / MIB)
    } else if bytes > KIB {
        format!("{}KiB", bytes / KIB)
    } else {
        format!("{bytes}B")
    }
}

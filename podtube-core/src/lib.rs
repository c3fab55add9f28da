pub mod artifact;
pub mod cache;
pub mod classify;
pub mod config;
pub mod convert;
pub mod error;
pub mod queue;
pub mod server;
pub mod worker;

pub use artifact::{remove_leftover, ArtifactDir, ArtifactScan, RehydrateReport};
pub use cache::{
    expire_after, format_size, ArtifactCacheItem, AvailabilityVerdict, CacheItem, CacheStore,
    CachedItem, EntrySnapshot, NamespaceSnapshot, AUDIO_FILES, VIDEO_LINKS,
};
pub use classify::{ClassificationRule, FailureClassifier, UnavailableKind};
pub use config::{
    load_podtube_config, CacheSection, ClassificationSection, ConversionSection, PathsSection,
    PodtubeConfig, RuleConfig, ServerSection,
};
pub use convert::{
    CommandExecutor, ConvertError, ConvertResult, Converter, SystemCommandExecutor,
    YtDlpConverter, YtDlpOptions,
};
pub use error::{ConfigError, Result};
pub use queue::{ConversionQueue, QueueEntry, QueueStatus, WaitOutcome};
pub use server::{router, serve, AppState, ServerError, ServerResult};
pub use worker::{CacheJanitor, ConversionWorker, WorkerSettings};

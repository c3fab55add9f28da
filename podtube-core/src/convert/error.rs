use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("download failed: {0}")]
    Download(String),
    #[error("transcode operation failed: {0}")]
    Transcode(String),
    #[error("failed to run {program}: {source}")]
    Command {
        program: String,
        source: std::io::Error,
    },
}

impl ConvertError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConvertError::Io {
            source,
            path: path.into(),
        }
    }

    /// Errors from placing files locally. These abort the attempt outright:
    /// no fallback and no classification.
    pub fn is_filesystem(&self) -> bool {
        matches!(self, ConvertError::Io { .. })
    }

    /// Only text reported by the download and transcode tools describes the
    /// video itself; local failures never become availability verdicts.
    pub fn is_classifiable(&self) -> bool {
        matches!(self, ConvertError::Download(_) | ConvertError::Transcode(_))
    }
}

pub type ConvertResult<T> = Result<T, ConvertError>;

//! Error types for HDNNP training
//!
//! 設定ミス・チェックポイント破損・集団通信の不整合を型で区別する。

use std::path::PathBuf;

/// Training errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Loss coefficients outside their valid ranges
    #[error("Invalid loss function configuration: {0}")]
    InvalidLossConfig(String),

    /// Any other rejected configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Snapshot could not be restored into the current configuration
    #[error("Corrupt checkpoint {}: {reason}", path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },

    /// A requested data tag has no backing file
    #[error("Sub dataset tagged as \"{0}\" does not exist.")]
    MissingTagData(String),

    /// Ranks issued different collective calls
    #[error("Collective desync at {site}: {detail}")]
    CollectiveDesync { site: String, detail: String },

    /// Malformed or inconsistent dataset contents
    #[error("Dataset error in tag \"{tag}\": {reason}")]
    Dataset { tag: String, reason: String },

    /// File I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (checkpoint / log / cache) error
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// TOML configuration parse error
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn dataset(tag: &str, reason: impl Into<String>) -> Self {
        Error::Dataset {
            tag: tag.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for training operations
pub type Result<T> = std::result::Result<T, Error>;

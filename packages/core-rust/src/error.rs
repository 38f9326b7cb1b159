use std::path::PathBuf;

use crate::bind::BindError;

/// Errors raised by [`ConfigStore`](crate::ConfigStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration path is empty")]
    EmptyPath,
    #[error("configuration path `{path}` not found")]
    NotFound { path: String },
    #[error("configuration path `{path}` holds a {kind}, not a map")]
    NotAMap { path: String, kind: &'static str },
    #[error("cannot read configuration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Bind(#[from] BindError),
}

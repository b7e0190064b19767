//! Settings errors.

use thiserror::Error;

/// Why settings could not be loaded.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not JSON, or a value has the wrong type.
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
    /// Values parse but cannot work together.
    #[error("invalid settings: {0}")]
    InvalidValue(String),
}

/// `Result` with [`SettingsError`].
pub type Result<T> = std::result::Result<T, SettingsError>;

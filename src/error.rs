//! Error types shared by the stores, the log stream client and the admin API.

/// Error type for watchdog operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading or writing a storage file failed.
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state or a stored value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A versioned write kept losing to concurrent writers.
    #[error("Write conflict on key {key} after {attempts} attempts")]
    Conflict { key: String, attempts: usize },

    /// The log source rejected our credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid URL: {0}")]
    Url(String),
}

/// Result type for watchdog operations.
pub type Result<T> = std::result::Result<T, Error>;

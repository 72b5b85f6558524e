pub use log::{debug, error, info, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),
    #[error("Child process has exited with error: {0}")]
    ChildExit(std::process::ExitStatus),
    #[error("Unknown compression format")]
    UnknownCompression,
    #[error("Compressed stream is truncated")]
    TruncatedStream,
    #[error("Bad rpm header magic")]
    BadHeaderMagic,
    #[error("Truncated rpm header")]
    TruncatedHeader,
    #[error("Unexpected type for rpm tag {0}")]
    BadHeaderTag(u32),
    #[error("Store migration v{from} -> v{to} failed: {source}")]
    Migration {
        from: i64,
        to: i64,
        source: sqlx::Error,
    },
    #[error("Media not found: {0}")]
    MediaNotFound(String),
    #[error("Media is disabled: {0}")]
    MediaDisabled(String),
    #[error("No enabled server for media: {0}")]
    NoServer(String),
    #[error("Server returned status {0} for {1}")]
    HttpStatus(u16, String),
    #[error("MD5 mismatch for {path}: expected {expected}, got {actual}")]
    Md5Mismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("SHA-256 mismatch for {path}")]
    Sha256Mismatch { path: String },
    #[error("Signature verification failed for {0}")]
    BadSignature(String),
    #[error("Both {system} and cauldron media are enabled, set version-mode to system or cauldron")]
    VersionConflict { system: String },
    #[error("Resolution failed: {}", .0.join("; "))]
    Resolution(Vec<String>),
    #[error("Package not found: {0}")]
    PackageNotFound(String),
    #[error("Rpm transaction failed with {0}")]
    RpmExit(std::process::ExitStatus),
    #[error("Transaction interrupted")]
    Interrupted,
    #[error("Sat solver error: {0}")]
    Solver(String),
}

pub type Result<T> = std::result::Result<T, Error>;

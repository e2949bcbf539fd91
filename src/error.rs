use thiserror::Error;

/// Everything that can abort a capture. There is no partial-failure recovery:
/// any of these ends the whole backup, and output already written to disk is
/// left as-is.
#[derive(Error, Debug)]
pub enum BackupError {
    /// The connection became unusable before or during the capture.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server reported an explicit error status.
    #[error("server error: {0}")]
    Server(String),

    /// A request that cannot be satisfied, detected before any bytes move.
    #[error("{0}")]
    Precondition(String),

    /// A malformed tar header in the incoming stream.
    #[error("invalid tar stream: {0}")]
    Format(String),

    /// The stream ended while an entry still had body or padding outstanding.
    #[error("COPY stream ended mid-entry: {0}")]
    IncompleteEntry(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, BackupError>;

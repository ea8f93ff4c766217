//! Error types for walqueue

use std::fmt;

/// Result type alias for walqueue operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for walqueue
#[derive(Debug)]
pub enum Error {
    /// IO errors
    Io(std::io::Error),
    /// Encoding or decoding of a queue entry failed
    Serialization(String),
    /// Entry was written with a format version this build does not understand
    UnsupportedVersion(String),
    /// Entry on disk failed validation (magic, checksum, truncation)
    Corrupt(String),
    /// Compression or decompression failed
    Compression(String),
    /// Configuration errors
    Config(String),
    /// HTTP transport errors
    Http(reqwest::Error),
    /// The disk backing the file queue is full
    QueueFull,
    /// The worker owning the mailbox is no longer running
    Stopped,
    /// Internal error
    Internal(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::UnsupportedVersion(version) => {
                write!(f, "Unsupported queue entry version: {}", version)
            }
            Error::Corrupt(msg) => write!(f, "Corrupt queue entry: {}", msg),
            Error::Compression(msg) => write!(f, "Compression error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::QueueFull => write!(f, "File queue is full: no space left on device"),
            Error::Stopped => write!(f, "Worker is stopped"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        // ENOSPC (28) on Unix and ERROR_DISK_FULL (112) on Windows.
        if matches!(e.raw_os_error(), Some(28) | Some(112)) {
            return Error::QueueFull;
        }
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<snap::Error> for Error {
    fn from(e: snap::Error) -> Self {
        Error::Compression(e.to_string())
    }
}

impl From<prost::EncodeError> for Error {
    fn from(e: prost::EncodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Stopped
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Stopped
    }
}

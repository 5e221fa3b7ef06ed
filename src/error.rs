//! Error types shared by the collector and the load generator.
//!
//! Transport failures are classified into temporary, end-of-stream and
//! fatal conditions so that both sides of the protocol make the same call.

use std::io;

/// A frame or entry could not be decoded. Fatal to the connection that sent it.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame decoded but does not have one of the recognized shapes.
    #[error("malformed entry: {0}")]
    MalformedEntry(String),

    /// Pending bytes grew past the configured frame limit without completing a frame.
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// The byte stream is not valid MessagePack.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Encoding a frame failed.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

impl ProtocolError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedEntry(reason.into())
    }
}

/// Errors surfaced by the forward listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("listener already closed")]
    AlreadyClosed,

    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by the load generator.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    /// Invalid arguments, reported before any connection is opened.
    #[error("{0}")]
    Configuration(String),

    /// A worker could not dial its target within the retry budget.
    #[error("worker {worker}: retry count exceeded after {attempts} dial attempts")]
    RetryExhausted { worker: usize, attempts: usize },

    /// A non-temporary transport error ended a worker.
    #[error("worker {worker}: transport error: {source}")]
    Transport { worker: usize, source: io::Error },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(std::path::PathBuf, #[source] io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(std::path::PathBuf, #[source] toml::de::Error),
}

/// How a transport failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportClass {
    /// Transient condition; retry the same operation.
    Temporary,
    /// Peer closed the stream.
    EndOfStream,
    /// Anything else; the connection is done.
    Fatal,
}

/// Classify an I/O error the same way on both ends of the wire.
pub fn classify(err: &io::Error) -> TransportClass {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            TransportClass::Temporary
        }
        io::ErrorKind::UnexpectedEof => TransportClass::EndOfStream,
        _ => TransportClass::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let e = io::Error::from(io::ErrorKind::Interrupted);
        assert_eq!(classify(&e), TransportClass::Temporary);

        let e = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(classify(&e), TransportClass::Temporary);

        let e = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert_eq!(classify(&e), TransportClass::EndOfStream);

        let e = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(classify(&e), TransportClass::Fatal);
    }

    #[test]
    fn test_display() {
        let e = ProtocolError::malformed("tag field");
        assert_eq!(e.to_string(), "malformed entry: tag field");

        let e = BenchError::RetryExhausted {
            worker: 2,
            attempts: 6,
        };
        assert_eq!(
            e.to_string(),
            "worker 2: retry count exceeded after 6 dial attempts"
        );
    }
}

//! Top-level error type, aggregating the lower crates' errors (§7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("codec: {0}")]
    Codec(#[from] fix_codec::CodecError),
    #[error("journal: {0}")]
    Journal(#[from] fix_journal::JournalError),
    #[error("reactor: {0}")]
    Reactor(#[from] fix_reactor::ReactorError),
    #[error("config: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("send attempted while not connected or logged in")]
    NotConnected,

    #[error("no session registered for key {0:?}")]
    UnknownSession(String),

    #[error("CompID mismatch: expected sender={expected_sender} target={expected_target}, got sender={got_sender} target={got_target}")]
    CompIdMismatch {
        expected_sender: String,
        expected_target: String,
        got_sender: String,
        got_target: String,
    },

    #[error("protocol violation: {0}")]
    Session(String),
}

/// A recoverable protocol oddity (§7 `SessionWarning`): logged, not fatal.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SessionWarning(pub String);

use std::fmt;

use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};

#[derive(Debug)]
pub enum PerchError {
    /// The X server could not be reached or the connection broke.
    Connection(String),
    /// A request failed or returned something we could not use.
    Protocol(String),
    /// The display lacks something a feature needs (alpha visual, extension).
    Unsupported(String),
    Config(String),
    EventLoop(String),
    /// The session was already closed.
    Closed,
}

pub type Result<T> = std::result::Result<T, PerchError>;

impl fmt::Display for PerchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerchError::Connection(msg) => write!(f, "x11 connection error: {msg}"),
            PerchError::Protocol(msg) => write!(f, "x11 protocol error: {msg}"),
            PerchError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            PerchError::Config(msg) => write!(f, "config error: {msg}"),
            PerchError::EventLoop(msg) => write!(f, "event loop error: {msg}"),
            PerchError::Closed => f.write_str("x11 session is closed"),
        }
    }
}

impl std::error::Error for PerchError {}

impl From<ConnectError> for PerchError {
    fn from(err: ConnectError) -> Self {
        PerchError::Connection(err.to_string())
    }
}

impl From<ConnectionError> for PerchError {
    fn from(err: ConnectionError) -> Self {
        PerchError::Connection(err.to_string())
    }
}

impl From<ReplyError> for PerchError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::ConnectionError(err) => err.into(),
            ReplyError::X11Error(err) => PerchError::Protocol(format!("{err:?}")),
        }
    }
}

impl From<ReplyOrIdError> for PerchError {
    fn from(err: ReplyOrIdError) -> Self {
        match err {
            ReplyOrIdError::ConnectionError(err) => err.into(),
            ReplyOrIdError::X11Error(err) => PerchError::Protocol(format!("{err:?}")),
            ReplyOrIdError::IdsExhausted => {
                PerchError::Protocol("x11 resource ids exhausted".to_owned())
            }
        }
    }
}

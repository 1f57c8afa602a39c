//! LXD client error types.

use thiserror::Error;

use crate::singleflight;

/// Result type for LXD operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the LXD daemon.
///
/// Variants carry owned strings so that results can be shared between
/// concurrent callers collapsed by single-flight.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The daemon socket could not be reached.
    #[error("cannot connect to LXD server at {socket:?}: {reason}")]
    Connect { socket: String, reason: String },

    /// A request failed at the network layer after connecting.
    #[error("cannot talk to the LXD server: {0}")]
    Transport(String),

    /// The daemon answered with an error document.
    #[error("LXD API error: {message}")]
    Api { code: u16, message: String },

    /// The requested container does not exist.
    #[error("container {0:?} not found")]
    NotFound(String),

    /// A long-running operation was submitted but its completion failed.
    #[error("{action} operation failed: {reason}")]
    Operation { action: String, reason: String },

    /// An ancestor path segment exists and is not a directory.
    #[error("cannot create directory {path:?}: a file with the same name exists in the container")]
    PathConflict { path: String },

    /// An executed command exited with a non-zero code.
    #[error("command {command:?} exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i64,
        stderr: String,
    },

    /// The container never exposed a routable address.
    #[error("cannot find address for {0:?}")]
    AddrTimeout(String),

    /// The daemon sent data the client cannot make sense of.
    #[error("unexpected LXD response: {0}")]
    Payload(String),

    /// A shared in-flight call went away before producing a result.
    #[error("concurrent LXD operation interrupted")]
    Interrupted,
}

impl From<singleflight::Interrupted> for Error {
    fn from(_: singleflight::Interrupted) -> Self {
        Error::Interrupted
    }
}

impl Error {
    /// The metrics label for this error. Categories are closed-set so that
    /// counter cardinality stays bounded; free-form detail goes to the log.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Connect { .. }
            | Error::Transport(_)
            | Error::Api { .. }
            | Error::NotFound(_)
            | Error::AddrTimeout(_)
            | Error::Payload(_)
            | Error::Interrupted => "backend",
            Error::Operation { .. } => "backend-operation",
            Error::PathConflict { .. } => "path-conflict",
            Error::CommandFailed { .. } => "command-failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display() {
        let err = Error::CommandFailed {
            command: "juju login -c ctrl".to_string(),
            code: 1,
            stderr: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "command \"juju login -c ctrl\" exited with code 1: permission denied"
        );
        assert_eq!(err.category(), "command-failed");
    }

    #[test]
    fn operation_failures_have_their_own_category() {
        let err = Error::Operation {
            action: "create container".to_string(),
            reason: "no such image".to_string(),
        };
        assert_eq!(err.category(), "backend-operation");
        let err = Error::Api {
            code: 500,
            message: "broken".to_string(),
        };
        assert_eq!(err.category(), "backend");
    }
}

//! Error types for the bridge.
//!
//! [`EvalError`] is local to one evaluation request and always becomes an
//! `EvalFailure` response. [`BridgeError`] ends the session with a
//! `FatalError` frame and exit status 1.

use std::path::PathBuf;

use crate::handles::InvalidHandle;
use crate::transport::protocol::ProtocolError;

/// Failure of a single evaluation request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    /// A segment could not be decoded into a value.
    #[error("MalformedExpression: {0}")]
    MalformedExpression(String),

    /// The assembled expression failed to compile, threw, or rejected.
    #[error("{0}")]
    Execution(String),

    /// The result cannot be coerced to the requested kind.
    #[error("UnmarshalableResult: {0}")]
    UnmarshalableResult(String),
}

impl From<InvalidHandle> for EvalError {
    fn from(err: InvalidHandle) -> Self {
        Self::MalformedExpression(err.to_string())
    }
}

impl From<ProtocolError> for EvalError {
    fn from(err: ProtocolError) -> Self {
        Self::MalformedExpression(err.to_string())
    }
}

/// Session-terminating fault.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// I/O failure on the external byte stream.
    #[error("transport fault: {0}")]
    Transport(#[from] std::io::Error),

    /// A message envelope that cannot be decoded or correlated.
    #[error("protocol fault: {0}")]
    Protocol(#[from] ProtocolError),

    /// `HandleFree` of a handle the table does not hold.
    #[error("handle table fault: {0}")]
    InvalidHandle(#[from] InvalidHandle),

    /// An evaluation failed while fail-fast mode is on.
    #[error("evaluation error, exiting: {0}")]
    EvalFailed(String),

    /// The dependency directory could not be linked into the resolution root.
    #[error("failed to link {} into {}: {}", .target.display(), .link.display(), .source)]
    Startup {
        target: PathBuf,
        link: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The worker panicked or vanished without reporting.
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),
}

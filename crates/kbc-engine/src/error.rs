use thiserror::Error;

use crate::port::PortId;
use crate::request::Request;

/// Why a primitive, and therefore its owning request, stopped executing.
///
/// Carried on the completed request next to the index of the primitive that
/// failed; it is never escalated to other queued requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureKind {
    /// The expected response byte did not arrive within the configured bound.
    #[error("expected response byte did not arrive in time")]
    Timeout,
    /// The device answered, but not with the expected byte, and the
    /// out-of-order correction pass did not produce it either.
    #[error("device answered {got:#04x} where {expected:#04x} was expected")]
    AcknowledgeMismatch { expected: u8, got: u8 },
    /// The engine shut down before the request finished.
    #[error("engine shut down before the request completed")]
    EngineDown,
}

/// Errors surfaced by the controller's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("port {0:?} is already bound to another driver")]
    PortBusy(PortId),
    #[error("port {0:?} does not exist in the current controller mode")]
    NoSuchPort(PortId),
    #[error("engine is suspended by power policy")]
    Suspended,
    #[error("engine has shut down")]
    Down,
    #[error("request failed at primitive {index}: {kind}")]
    RequestFailed { index: usize, kind: FailureKind },
}

/// A rejected submission. The request is handed back untouched so the caller
/// can retry it after a wake notification, or drop it.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("engine is suspended by power policy")]
    Suspended(Request),
    #[error("engine has shut down")]
    Down(Request),
}

impl SubmitError {
    /// Recovers the request for a later retry.
    pub fn into_request(self) -> Request {
        match self {
            SubmitError::Suspended(req) | SubmitError::Down(req) => req,
        }
    }
}

impl From<SubmitError> for EngineError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Suspended(_) => EngineError::Suspended,
            SubmitError::Down(_) => EngineError::Down,
        }
    }
}

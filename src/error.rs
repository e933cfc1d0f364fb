// ABOUTME: Error taxonomy for the connection engine
// ABOUTME: every failure mode the dispatcher or call context can raise lives here

use std::io;
use thiserror::Error;

/// Errors raised by the connection engine.
///
/// Mirrors the taxonomy in the protocol design: wire-shape violations,
/// dispatch-discipline violations (double answers, stale call-backs), and
/// transport failures. No retry behavior is attempted anywhere in this
/// crate; every error is surfaced to the caller that was waiting on it.
#[derive(Debug, Error)]
pub enum RpcError {
    /// An inbound byte sequence didn't match any recognized frame shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A call or call-back arrived for which no handler is registered.
    #[error("no callback defined for `{function}`{}", if *.already_returned { " (call already returned)" } else { "" })]
    NoCallbackDefined {
        function: String,
        already_returned: bool,
    },

    /// A `Call`'s answer was set more than once.
    #[error("answer already sent for this call")]
    DoubleAnswer,

    /// `call_back` was issued on a `Call` whose answer was already sent.
    #[error("call already returned, cannot issue a call-back on it")]
    CallAlreadyReturned,

    /// A read was attempted after `detach`.
    #[error("connection has been detached")]
    ConnectionDetached,

    /// A lazy answer's thunk was forced reentrantly (from within itself).
    #[error("lazy answer forced reentrantly")]
    ReentrantForce,

    /// The peer declined the `prefer_binary` handshake in a way that
    /// doesn't conform to the ack grammar.
    #[error("protocol handshake failed: {0}")]
    HandshakeFailed(String),

    /// Transport I/O failure (including EOF encountered mid-frame).
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl RpcError {
    /// Reconstructs an equivalent error for re-raising to a second waiter.
    ///
    /// `RpcError` isn't `Clone` (its `io::Error` variant isn't), but once a
    /// dispatch error is observed it is stored so every subsequent wait-loop
    /// iteration can surface it (spec: "a dispatcher-observed error is
    /// stored and raised on the next wait-loop iteration"). This rebuilds a
    /// same-shaped error from a shared reference instead.
    pub fn dup(&self) -> RpcError {
        match self {
            RpcError::InvalidResponse(s) => RpcError::InvalidResponse(s.clone()),
            RpcError::NoCallbackDefined { function, already_returned } => RpcError::NoCallbackDefined {
                function: function.clone(),
                already_returned: *already_returned,
            },
            RpcError::DoubleAnswer => RpcError::DoubleAnswer,
            RpcError::CallAlreadyReturned => RpcError::CallAlreadyReturned,
            RpcError::ConnectionDetached => RpcError::ConnectionDetached,
            RpcError::ReentrantForce => RpcError::ReentrantForce,
            RpcError::HandshakeFailed(s) => RpcError::HandshakeFailed(s.clone()),
            RpcError::Io(e) => RpcError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;

use crate::machine::{Action, StateTag};

/// Fatal stream and transport errors.
///
/// Every variant here funnels into the machine's `fail` transition; callers
/// observe these only through the `Failed` snapshot, never as an escaping
/// fault from the consumption loop.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The upstream returned a non-streaming error body (or a non-2xx
    /// status), surfaced with the upstream-supplied message.
    #[error("Upstream error: {0}")]
    Upstream(String),
    /// A data line's payload did not match any legal event shape.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
    /// An event arrived that is inconsistent with the current receiving
    /// sub-state.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    /// The byte source ended without ever producing a finish signal.
    #[error("Unexpected termination of chat completions stream")]
    UnexpectedTermination,
    /// Failure to build or dispatch the outbound request. Read failures
    /// mid-stream are NOT transport errors; they end the stream benignly.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Programmer-error class: misuse of the machine's action surface.
///
/// Kept distinct from [`Error`] — these indicate a bug in the caller, not a
/// runtime stream condition, and they never reach the `Failed` state.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MachineError {
    #[error("Illegal action {action} in state {state}")]
    IllegalAction { state: StateTag, action: Action },
    #[error("Expected state {expected}, found {actual}")]
    UnexpectedState { expected: StateTag, actual: StateTag },
}

/// Read failure raised by a byte source.
///
/// Always benign downstream: the frame decoder treats it exactly like
/// natural exhaustion, so transport disconnects and cancellation end the
/// event sequence instead of failing the exchange.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Byte source read failed: {0}")]
pub struct SourceError(pub String);

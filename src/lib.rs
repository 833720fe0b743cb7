//! Streaming OpenAI Chat Completions client.
//!
//! Byte chunks from the transport are framed into protocol lines
//! ([`decode`]), classified into typed deltas ([`protocol`]), and reduced
//! onto an explicit lifecycle state machine ([`machine`]) by a per-turn
//! consumption loop ([`exchange`]). [`session::ChatSession`] wires a machine
//! to a [`transport::Connector`] and is the usual entry point.

pub mod decode;
pub mod error;
pub mod exchange;
pub mod machine;
pub mod protocol;
pub mod session;
pub mod source;
pub mod transport;

pub use error::{Error, MachineError, SourceError};
pub use machine::{Action, Machine, MachineOptions, Snapshot, State, StateTag, TransitionTable};
pub use protocol::{
    ChatMessage, ChatRequest, FinishReason, FunctionSpec, ProtocolEvent, Role,
};
pub use session::ChatSession;
pub use source::{BoxByteSource, ByteSource};
pub use transport::{Connector, ConnectorConfig, HttpConnector};

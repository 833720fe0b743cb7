//! One chat completions session: a machine plus a connector.
//!
//! `send` performs the `Sending` transition and spawns exactly one
//! consumption loop for that turn, including re-entries after a completed
//! function-call round trip.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Error, MachineError};
use crate::exchange::run_exchange;
use crate::machine::{Action, Machine, MachineOptions, Snapshot, State, StateTag};
use crate::protocol::ChatRequest;
use crate::transport::Connector;

pub struct ChatSession {
    machine: Arc<Machine>,
    connector: Arc<dyn Connector>,
}

impl ChatSession {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, options: MachineOptions) -> Self {
        Self {
            machine: Arc::new(Machine::new(options)),
            connector,
        }
    }

    #[must_use]
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.machine.snapshot()
    }

    /// # Errors
    ///
    /// Returns [`MachineError::UnexpectedState`] on a tag mismatch.
    pub fn assert_state(&self, expected: StateTag) -> Result<Snapshot, MachineError> {
        self.machine.assert_state(expected)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.machine.subscribe()
    }

    /// Issue a request. Legal from `Initialized` and, for the follow-up
    /// after a function round trip, from `FunctionCallFinished`.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::IllegalAction`] when `send` is not on the
    /// current snapshot's action surface.
    pub fn send(&self, request: ChatRequest) -> Result<Snapshot, MachineError> {
        let sending = self
            .machine
            .apply(Action::Send, State::Sending(request))?;
        let machine = Arc::clone(&self.machine);
        let connector = Arc::clone(&self.connector);
        let snapshot = sending.clone();
        tokio::spawn(async move {
            drive_turn(&machine, connector.as_ref(), &snapshot).await;
        });
        Ok(sending)
    }

    /// Reset to `Initialized`. Any in-flight loop is orphaned and stops at
    /// its next generation check without touching the machine.
    pub fn initialize(&self) -> Snapshot {
        self.machine.initialize()
    }

    /// Caller-initiated cancellation of the whole session (e.g. a timeout).
    /// Cancelled pulls end the stream benignly.
    pub fn cancel(&self) {
        self.machine.cancel_token().cancel();
    }
}

/// Connect and consume one turn. Connect failures funnel into `fail`,
/// guarded by the sending snapshot's generation like every other fatal
/// condition.
pub(crate) async fn drive_turn(machine: &Machine, connector: &dyn Connector, sending: &Snapshot) {
    let State::Sending(request) = sending.state() else {
        return;
    };
    let cancel = machine.cancel_token().child_token();

    let source = match connector.connect(request, cancel.clone()).await {
        Ok(source) => source,
        Err(err) => {
            cancel.cancel();
            fail_sending(machine, sending.generation(), err);
            return;
        }
    };

    // The caller may have reset while the connection was being opened.
    if machine.generation() != sending.generation() {
        debug!("snapshot went stale while connecting; releasing source");
        cancel.cancel();
        return;
    }

    run_exchange(machine, source, cancel, sending).await;
}

fn fail_sending(machine: &Machine, generation: u64, err: Error) {
    match machine.apply_if_current(
        generation,
        Action::Fail,
        State::Failed {
            error: err,
            content: None,
        },
    ) {
        Ok(_) => {}
        Err(err) => tracing::error!(error = %err, "fail transition rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessage, Role};
    use crate::source::{BoxByteSource, ScriptedSource};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    struct FailingConnector;

    #[async_trait]
    impl Connector for FailingConnector {
        async fn connect(
            &self,
            _request: &ChatRequest,
            _cancel: CancellationToken,
        ) -> Result<BoxByteSource, Error> {
            Err(Error::Upstream("status 401: bad key".to_string()))
        }
    }

    struct OneShotConnector {
        transcript: String,
    }

    #[async_trait]
    impl Connector for OneShotConnector {
        async fn connect(
            &self,
            _request: &ChatRequest,
            _cancel: CancellationToken,
        ) -> Result<BoxByteSource, Error> {
            Ok(Box::new(ScriptedSource::new([Bytes::from(
                self.transcript.clone(),
            )])))
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4".to_string(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: "Hello, World!".to_string(),
                name: None,
            }],
            functions: None,
        }
    }

    async fn wait_for(session: &ChatSession, tag: StateTag) -> Snapshot {
        let mut rx = session.subscribe();
        loop {
            if let Ok(snapshot) = session.assert_state(tag) {
                return snapshot;
            }
            let snapshot = rx.recv().await.unwrap();
            if snapshot.tag() == tag {
                return snapshot;
            }
        }
    }

    #[tokio::test]
    async fn test_send_is_illegal_while_sending() {
        let session = ChatSession::new(
            Arc::new(OneShotConnector {
                transcript: String::new(),
            }),
            MachineOptions::default(),
        );
        session.send(request()).unwrap();
        let err = session.send(request()).unwrap_err();
        assert!(matches!(err, MachineError::IllegalAction { .. }));
    }

    #[tokio::test]
    async fn test_connect_failure_reaches_failed() {
        let session = ChatSession::new(Arc::new(FailingConnector), MachineOptions::default());
        session.send(request()).unwrap();
        let snapshot = wait_for(&session, StateTag::Failed).await;
        assert_eq!(
            *snapshot.state(),
            State::Failed {
                error: Error::Upstream("status 401: bad key".to_string()),
                content: None,
            }
        );
        // Terminal per turn: only initialize remains.
        assert_eq!(snapshot.actions(), &[Action::Initialize]);
        session.initialize();
        assert_eq!(session.snapshot().tag(), StateTag::Initialized);
    }
}

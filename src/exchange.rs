//! The per-turn stream consumption loop.
//!
//! One loop runs per entry into `Sending`. It pulls classified events,
//! reduces them onto the machine, and owns the turn's cancellation token.
//! Every application is guarded by the generation of the snapshot the loop
//! believes it owns; a mismatch means the caller moved the machine away
//! (typically via `initialize`) and the loop must abandon silently.

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::decode::event_stream;
use crate::error::Error;
use crate::machine::{Action, Machine, Snapshot, State, StateTag};
use crate::protocol::ProtocolEvent;
use crate::source::ByteSource;

/// Which shape the turn took after its first delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sending,
    Content,
    FunctionCall,
}

/// Drive one exchange from an open byte source until a terminal per-turn
/// state or abandonment.
///
/// `sending` is the snapshot that entered `Sending` for this turn. All
/// fatal conditions funnel into a generation-guarded `fail` transition;
/// nothing escapes to the caller. The token is cancelled on every exit
/// path, releasing the underlying connection.
pub async fn run_exchange<S>(
    machine: &Machine,
    source: S,
    cancel: CancellationToken,
    sending: &Snapshot,
) where
    S: ByteSource + 'static,
{
    debug_assert_eq!(sending.tag(), StateTag::Sending);
    let _release = cancel.clone().drop_guard();

    let mut generation = sending.generation();
    let mut phase = Phase::Sending;

    // Loop-local accumulators, discarded with the loop.
    let mut content = String::new();
    let mut function_name = String::new();
    let mut function_args = String::new();

    let mut events = std::pin::pin!(event_stream(source));

    while let Some(item) = events.next().await {
        // The caller may have replaced the snapshot while we were suspended
        // at the pull. Never touch a machine we no longer own.
        if machine.generation() != generation {
            debug!("snapshot went stale mid-stream; abandoning exchange");
            return;
        }

        let event = match item {
            Ok(event) => event,
            Err(err) => {
                fail_turn(machine, generation, err, &phase, &content);
                return;
            }
        };

        let applied = match (phase, event) {
            // The role tag rides along with the first token; it carries no
            // state of its own.
            (_, ProtocolEvent::RoleAnnounced) => continue,
            (_, ProtocolEvent::StreamEnd) => break,

            (Phase::Sending, ProtocolEvent::ContentDelta { text }) => {
                phase = Phase::Content;
                content = text.clone();
                machine.apply_if_current(
                    generation,
                    Action::Receive,
                    State::ReceivingContent {
                        content: content.clone(),
                        content_delta: text,
                    },
                )
            }
            (Phase::Sending, ProtocolEvent::FunctionCallDelta { name, args_delta }) => {
                let Some(name) = name else {
                    fail_turn(
                        machine,
                        generation,
                        Error::ProtocolViolation(
                            "function call delta without a function name".to_string(),
                        ),
                        &phase,
                        &content,
                    );
                    return;
                };
                phase = Phase::FunctionCall;
                function_name = name;
                function_args = args_delta.clone();
                machine.apply_if_current(
                    generation,
                    Action::ReceiveFunctionCall,
                    State::ReceivingFunctionCall {
                        function_name: function_name.clone(),
                        function_args: function_args.clone(),
                        args_delta,
                    },
                )
            }
            (Phase::Sending, ProtocolEvent::Finish { reason }) => {
                fail_turn(
                    machine,
                    generation,
                    Error::ProtocolViolation(format!(
                        "finish signal ({reason}) before any delta"
                    )),
                    &phase,
                    &content,
                );
                return;
            }

            (Phase::Content, ProtocolEvent::ContentDelta { text }) => {
                content.push_str(&text);
                machine.apply_if_current(
                    generation,
                    Action::Receive,
                    State::ReceivingContent {
                        content: content.clone(),
                        content_delta: text,
                    },
                )
            }
            (Phase::Content, ProtocolEvent::Finish { reason }) => {
                let applied = machine.apply_if_current(
                    generation,
                    Action::Finish,
                    State::ContentFinished {
                        reason,
                        content: std::mem::take(&mut content),
                    },
                );
                finish_or_abandon(applied);
                return;
            }
            (Phase::Content, ProtocolEvent::FunctionCallDelta { .. }) => {
                fail_turn(
                    machine,
                    generation,
                    Error::ProtocolViolation(
                        "function call delta while receiving content".to_string(),
                    ),
                    &phase,
                    &content,
                );
                return;
            }

            (Phase::FunctionCall, ProtocolEvent::FunctionCallDelta { args_delta, .. }) => {
                function_args.push_str(&args_delta);
                machine.apply_if_current(
                    generation,
                    Action::ReceiveFunctionCall,
                    State::ReceivingFunctionCall {
                        function_name: function_name.clone(),
                        function_args: function_args.clone(),
                        args_delta,
                    },
                )
            }
            (Phase::FunctionCall, ProtocolEvent::Finish { reason }) => {
                let applied = machine.apply_if_current(
                    generation,
                    Action::FinishFunctionCall,
                    State::FunctionCallFinished {
                        reason,
                        function_name: std::mem::take(&mut function_name),
                        function_args: std::mem::take(&mut function_args),
                    },
                );
                finish_or_abandon(applied);
                return;
            }
            (Phase::FunctionCall, ProtocolEvent::ContentDelta { .. }) => {
                fail_turn(
                    machine,
                    generation,
                    Error::ProtocolViolation(
                        "content delta while receiving a function call".to_string(),
                    ),
                    &phase,
                    &content,
                );
                return;
            }
        };

        match applied {
            Ok(Some(snapshot)) => generation = snapshot.generation(),
            Ok(None) => {
                debug!("snapshot went stale mid-stream; abandoning exchange");
                return;
            }
            Err(err) => {
                // Only reachable with a transition table that does not cover
                // the exchange protocol.
                error!(error = %err, "reducer transition rejected; abandoning exchange");
                return;
            }
        }
    }

    // Stream ended with no finish signal observed.
    fail_turn(
        machine,
        generation,
        Error::UnexpectedTermination,
        &phase,
        &content,
    );
}

fn finish_or_abandon(applied: Result<Option<Snapshot>, crate::error::MachineError>) {
    match applied {
        Ok(Some(_)) | Ok(None) => {}
        Err(err) => error!(error = %err, "finish transition rejected"),
    }
}

/// Funnel a fatal condition into the `fail` action, guarded by generation.
/// Partial content rides along only for content turns.
fn fail_turn(machine: &Machine, generation: u64, err: Error, phase: &Phase, content: &str) {
    warn!(error = %err, "chat completions exchange failed");
    let partial = match phase {
        Phase::Content => Some(content.to_string()),
        Phase::Sending | Phase::FunctionCall => None,
    };
    match machine.apply_if_current(
        generation,
        Action::Fail,
        State::Failed {
            error: err,
            content: partial,
        },
    ) {
        Ok(Some(_)) => {}
        Ok(None) => debug!("failure raced a reset; snapshot already moved on"),
        Err(err) => error!(error = %err, "fail transition rejected"),
    }
}

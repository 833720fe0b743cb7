//! Lifecycle state machine for one chat completions exchange.
//!
//! The machine holds exactly one current immutable [`Snapshot`] at a time.
//! Every state change goes through the [`TransitionTable`]; there are no ad
//! hoc transitions. Staleness is detected by the monotonically increasing
//! `generation` counter embedded in each snapshot, compared by value.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, MachineError};
use crate::protocol::{ChatRequest, FinishReason};

/// Discriminant of a machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTag {
    Initialized,
    Sending,
    ReceivingContent,
    ReceivingFunctionCall,
    ContentFinished,
    FunctionCallFinished,
    Failed,
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateTag::Initialized => "initialized",
            StateTag::Sending => "sending",
            StateTag::ReceivingContent => "receiving_content",
            StateTag::ReceivingFunctionCall => "receiving_function_call",
            StateTag::ContentFinished => "content_finished",
            StateTag::FunctionCallFinished => "function_call_finished",
            StateTag::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Named action on the machine's action surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Initialize,
    Send,
    Receive,
    ReceiveFunctionCall,
    Finish,
    FinishFunctionCall,
    Fail,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Initialize => "initialize",
            Action::Send => "send",
            Action::Receive => "receive",
            Action::ReceiveFunctionCall => "receive_function_call",
            Action::Finish => "finish",
            Action::FinishFunctionCall => "finish_function_call",
            Action::Fail => "fail",
        };
        write!(f, "{name}")
    }
}

/// State value carried by a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Initialized,
    Sending(ChatRequest),
    ReceivingContent {
        content: String,
        content_delta: String,
    },
    ReceivingFunctionCall {
        function_name: String,
        function_args: String,
        args_delta: String,
    },
    ContentFinished {
        reason: FinishReason,
        content: String,
    },
    FunctionCallFinished {
        reason: FinishReason,
        function_name: String,
        function_args: String,
    },
    Failed {
        error: Error,
        content: Option<String>,
    },
}

impl State {
    #[must_use]
    pub fn tag(&self) -> StateTag {
        match self {
            State::Initialized => StateTag::Initialized,
            State::Sending(_) => StateTag::Sending,
            State::ReceivingContent { .. } => StateTag::ReceivingContent,
            State::ReceivingFunctionCall { .. } => StateTag::ReceivingFunctionCall,
            State::ContentFinished { .. } => StateTag::ContentFinished,
            State::FunctionCallFinished { .. } => StateTag::FunctionCallFinished,
            State::Failed { .. } => StateTag::Failed,
        }
    }
}

/// Immutable capture of the machine's current state.
#[derive(Debug, Clone)]
pub struct Snapshot {
    state: Arc<State>,
    generation: u64,
    actions: Arc<[Action]>,
}

impl Snapshot {
    #[must_use]
    pub fn state(&self) -> &State {
        &self.state
    }

    #[must_use]
    pub fn tag(&self) -> StateTag {
        self.state.tag()
    }

    /// Monotonically increasing counter identifying snapshot recency.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Actions legal from this snapshot's state.
    #[must_use]
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    #[must_use]
    pub fn permits(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }
}

/// Fixed `(state, action) -> next state` mapping.
///
/// Built once at machine construction; a transition absent from the table is
/// a contract violation surfaced as [`MachineError::IllegalAction`].
#[derive(Debug, Clone)]
pub struct TransitionTable {
    edges: Vec<(StateTag, Action, StateTag)>,
}

impl TransitionTable {
    #[must_use]
    pub fn new(edges: Vec<(StateTag, Action, StateTag)>) -> Self {
        Self { edges }
    }

    /// The chat completions exchange protocol.
    #[must_use]
    pub fn chat_default() -> Self {
        use Action::*;
        use StateTag::*;
        Self::new(vec![
            (Initialized, Initialize, Initialized),
            (Initialized, Send, Sending),
            (Sending, Initialize, Initialized),
            (Sending, Receive, ReceivingContent),
            (Sending, ReceiveFunctionCall, ReceivingFunctionCall),
            (Sending, Fail, Failed),
            (ReceivingContent, Initialize, Initialized),
            (ReceivingContent, Receive, ReceivingContent),
            (ReceivingContent, Finish, ContentFinished),
            (ReceivingContent, Fail, Failed),
            (ReceivingFunctionCall, Initialize, Initialized),
            (ReceivingFunctionCall, ReceiveFunctionCall, ReceivingFunctionCall),
            (ReceivingFunctionCall, FinishFunctionCall, FunctionCallFinished),
            (ReceivingFunctionCall, Fail, Failed),
            (ContentFinished, Initialize, Initialized),
            (FunctionCallFinished, Initialize, Initialized),
            (FunctionCallFinished, Send, Sending),
            (Failed, Initialize, Initialized),
        ])
    }

    #[must_use]
    pub fn next(&self, from: StateTag, action: Action) -> Option<StateTag> {
        self.edges
            .iter()
            .find(|(f, a, _)| *f == from && *a == action)
            .map(|(_, _, to)| *to)
    }

    fn actions_for(&self, from: StateTag) -> Arc<[Action]> {
        self.edges
            .iter()
            .filter(|(f, _, _)| *f == from)
            .map(|(_, a, _)| *a)
            .collect::<Vec<_>>()
            .into()
    }
}

/// Construction options.
#[derive(Debug, Clone, Default)]
pub struct MachineOptions {
    /// Optional parent token; exchanges driven for this machine are
    /// cancelled when it is.
    pub cancel: Option<CancellationToken>,
}

/// The lifecycle controller.
///
/// Factory-created; no ambient singleton. The transition function here is
/// the sole writer of the current snapshot.
/// Buffered transitions a slow subscriber may lag behind by before it
/// starts missing snapshots.
const SUBSCRIBER_BUFFER: usize = 64;

pub struct Machine {
    table: TransitionTable,
    current: Mutex<Snapshot>,
    tx: broadcast::Sender<Snapshot>,
    cancel: CancellationToken,
}

impl Machine {
    /// Create a machine in `Initialized` state with generation 0.
    #[must_use]
    pub fn new(options: MachineOptions) -> Self {
        Self::with_transitions(TransitionTable::chat_default(), options)
    }

    /// Create a machine with an injected transition table.
    #[must_use]
    pub fn with_transitions(table: TransitionTable, options: MachineOptions) -> Self {
        let initial = Snapshot {
            state: Arc::new(State::Initialized),
            generation: 0,
            actions: table.actions_for(StateTag::Initialized),
        };
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let cancel = options
            .cancel
            .map_or_else(CancellationToken::new, |parent| parent.child_token());
        Self {
            table,
            current: Mutex::new(initial),
            tx,
            cancel,
        }
    }

    /// Token linked to this machine's lifetime; per-turn tokens are children
    /// of it.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.current.lock().clone()
    }

    /// Current generation, without cloning the snapshot.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.current.lock().generation
    }

    /// Current snapshot, only if its state matches `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::UnexpectedState`] on a tag mismatch.
    pub fn assert_state(&self, expected: StateTag) -> Result<Snapshot, MachineError> {
        let snapshot = self.snapshot();
        if snapshot.tag() == expected {
            Ok(snapshot)
        } else {
            Err(MachineError::UnexpectedState {
                expected,
                actual: snapshot.tag(),
            })
        }
    }

    /// Receiver delivered the new snapshot on every transition.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// Apply `action`, replacing the current state with `next`.
    ///
    /// The action must be listed in the transition table for the current
    /// state, and `next` must be a value of the state the table maps to.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::IllegalAction`] when either check fails —
    /// this is the programmer-error class, distinct from stream failures.
    pub fn apply(&self, action: Action, next: State) -> Result<Snapshot, MachineError> {
        let mut current = self.current.lock();
        self.transition_locked(&mut current, action, next)
    }

    /// Apply `action` only if the current generation still equals
    /// `expected_generation`.
    ///
    /// `Ok(None)` means the snapshot went stale: the caller no longer owns
    /// the machine and must stop without mutating anything.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::IllegalAction`] as [`Machine::apply`] does.
    pub fn apply_if_current(
        &self,
        expected_generation: u64,
        action: Action,
        next: State,
    ) -> Result<Option<Snapshot>, MachineError> {
        let mut current = self.current.lock();
        if current.generation != expected_generation {
            return Ok(None);
        }
        self.transition_locked(&mut current, action, next).map(Some)
    }

    /// Reset to `Initialized`, discarding the current value. Legal from
    /// every state; orphans any in-flight consumption loop.
    ///
    /// # Panics
    ///
    /// Panics if the injected transition table omits `initialize` for the
    /// current state. That is a misuse of the action surface, reported
    /// immediately like any other illegal action.
    pub fn initialize(&self) -> Snapshot {
        match self.apply(Action::Initialize, State::Initialized) {
            Ok(snapshot) => snapshot,
            Err(err) => panic!("initialize must be legal from every state: {err}"),
        }
    }

    fn transition_locked(
        &self,
        current: &mut Snapshot,
        action: Action,
        next: State,
    ) -> Result<Snapshot, MachineError> {
        let from = current.tag();
        let Some(target) = self.table.next(from, action) else {
            return Err(MachineError::IllegalAction {
                state: from,
                action,
            });
        };
        if target != next.tag() {
            return Err(MachineError::IllegalAction {
                state: from,
                action,
            });
        }

        let snapshot = Snapshot {
            state: Arc::new(next),
            generation: current.generation + 1,
            actions: self.table.actions_for(target),
        };
        *current = snapshot.clone();
        // No receivers is fine; send only fails when nobody subscribed.
        let _ = self.tx.send(snapshot.clone());
        Ok(snapshot)
    }
}

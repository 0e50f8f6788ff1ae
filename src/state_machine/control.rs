use std::collections::VecDeque;
use std::fmt;

use super::StateMachine;

/// Lifecycle state of a control session.
///
/// `AuthorityRequested`, `DrcEntering`, `DrcExiting` and `AuthorityReleasing` are transitional:
/// a call to the gateway is in flight and every other transition is refused until it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlState {
    Idle,
    AuthorityRequested,
    AuthorityHeld,
    DrcEntering,
    Active,
    DrcExiting,
    AuthorityReleasing,
}

impl ControlState {
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            ControlState::AuthorityRequested
                | ControlState::DrcEntering
                | ControlState::DrcExiting
                | ControlState::AuthorityReleasing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlState::Idle => "IDLE",
            ControlState::AuthorityRequested => "AUTHORITY_REQUESTED",
            ControlState::AuthorityHeld => "AUTHORITY_HELD",
            ControlState::DrcEntering => "DRC_ENTERING",
            ControlState::Active => "ACTIVE",
            ControlState::DrcExiting => "DRC_EXITING",
            ControlState::AuthorityReleasing => "AUTHORITY_RELEASING",
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition the operator can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOp {
    RequestAuthority,
    EnterMode,
    ExitMode,
    ReleaseAuthority,
}

impl ControlOp {
    /// Human readable verb phrase, used in errors.
    pub fn describe(self) -> &'static str {
        match self {
            ControlOp::RequestAuthority => "request control authority",
            ControlOp::EnterMode => "enter DRC mode",
            ControlOp::ExitMode => "exit DRC mode",
            ControlOp::ReleaseAuthority => "release control authority",
        }
    }

    /// The stable state the op starts from and the transitional state it moves to.
    fn begins(self) -> (ControlState, ControlState) {
        match self {
            ControlOp::RequestAuthority => (ControlState::Idle, ControlState::AuthorityRequested),
            ControlOp::EnterMode => (ControlState::AuthorityHeld, ControlState::DrcEntering),
            ControlOp::ExitMode => (ControlState::Active, ControlState::DrcExiting),
            ControlOp::ReleaseAuthority => {
                (ControlState::AuthorityHeld, ControlState::AuthorityReleasing)
            }
        }
    }

    /// Where the op lands once the gateway answered (or didn't).
    ///
    /// Exit and release are best-effort: local state always falls back to the safe side.
    fn lands(self, outcome: Outcome) -> ControlState {
        let succeeded = outcome == Outcome::Succeeded;
        match self {
            ControlOp::RequestAuthority if succeeded => ControlState::AuthorityHeld,
            ControlOp::RequestAuthority => ControlState::Idle,
            ControlOp::EnterMode if succeeded => ControlState::Active,
            ControlOp::EnterMode => ControlState::AuthorityHeld,
            ControlOp::ExitMode => ControlState::AuthorityHeld,
            ControlOp::ReleaseAuthority => ControlState::Idle,
        }
    }
}

/// How an in-flight transition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    /// The caller stopped waiting before the gateway answered.
    Abandoned,
}

/// Sequencing of control authority and DRC mode.
///
/// The machine decides which transitions are legal and when the heartbeat must start or stop;
/// the runner performs the gateway calls and owns the heartbeat task.
#[derive(Debug)]
pub struct ControlMachine {
    state: ControlState,
    pending: VecDeque<ControlOutput>,
}

impl ControlMachine {
    pub fn new() -> Self {
        Self {
            state: ControlState::Idle,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    fn begin(&mut self, op: ControlOp) {
        let (from, to) = op.begins();
        if self.state != from {
            self.pending.push_back(ControlOutput::Rejected {
                op,
                state: self.state,
            });
            return;
        }

        self.state = to;
        // The heartbeat must be gone before the exit request can be published.
        if op == ControlOp::ExitMode {
            self.pending.push_back(ControlOutput::StopHeartbeat);
        }
        self.pending
            .push_back(ControlOutput::Transitioned { op, from, to });
    }

    fn finish(&mut self, op: ControlOp, outcome: Outcome) {
        let (_, in_flight) = op.begins();
        if self.state != in_flight {
            self.pending.push_back(ControlOutput::Stale {
                op,
                state: self.state,
            });
            return;
        }

        let to = op.lands(outcome);
        self.state = to;
        self.pending.push_back(ControlOutput::Transitioned {
            op,
            from: in_flight,
            to,
        });
        if to == ControlState::Active {
            self.pending.push_back(ControlOutput::StartHeartbeat);
        }
    }
}

impl Default for ControlMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlInput {
    /// The operator asks for `op`.
    Begin(ControlOp),
    /// The gateway call behind `op` resolved.
    Finish { op: ControlOp, outcome: Outcome },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutput {
    /// The state changed because of `op`.
    Transitioned {
        op: ControlOp,
        from: ControlState,
        to: ControlState,
    },
    /// `op` is not allowed in `state`; nothing changed.
    Rejected { op: ControlOp, state: ControlState },
    /// A finish arrived for a transition that is not in flight; nothing changed.
    Stale { op: ControlOp, state: ControlState },
    /// DRC mode is up, the heartbeat must run from now on.
    StartHeartbeat,
    /// DRC mode is being torn down, the heartbeat must stop before anything else is sent.
    StopHeartbeat,
}

impl StateMachine for ControlMachine {
    type Input = ControlInput;
    type Output = ControlOutput;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            ControlInput::Begin(op) => self.begin(op),
            ControlInput::Finish { op, outcome } => self.finish(op, outcome),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.pop_front()
    }
}

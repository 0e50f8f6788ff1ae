pub mod control;
pub mod telemetry;
pub mod wrappers;

/// The [`StateMachine`] trait provides calling semantics and indicates the upholding of invariants
/// that guarantee deterministic behavior.
///
/// # Functionality
/// A state machine consumes [`Input`](StateMachine::Input) and produces
/// [`Output`](StateMachine::Output), both usually enums with one variant per kind of event. The
/// trait only provides the dispatch mapping; the logic lives on the implementor's inherent impl.
///
/// The session layer keeps every decision about *what happens next* in a state machine and every
/// side effect (publishing, spawning, logging, reading the clock) in the runner that owns it:
///
/// - [`telemetry::TelemetryMachine`] is owned by [`StateCache`](crate::state_cache::StateCache).
/// - [`control::ControlMachine`] is owned by [`ControlSession`](crate::control::ControlSession).
///
/// # Invariants
/// Implementors *must* uphold the following.
///
/// ## No Interior Mutability
/// State is only changed through `&mut self`. No [`std::cell`] types, no locks, no
/// reference-counted sharing. The runner decides how the machine is shared.
///
/// ## No IO
/// No sockets, files or channels. Anything the machine wants done in the world is reported as
/// output for the runner to perform.
///
/// ### No System Time
/// Reading [`std::time::Instant::now`] or [`std::time::SystemTime`] makes two otherwise identical
/// runs diverge. Time is passed in as input, see [`wrappers::system`].
///
/// ## No Concurrency, No Async, No Blocking
/// Processing an input runs to completion on the caller's thread. This is what allows a runner to
/// hold a plain mutex around the machine without ever holding it across an `.await`.
///
/// # Side Effects
/// Logging inside a machine is tolerated as long as no decision depends on it. Runners prefer to
/// log from the outputs they poll.
pub trait StateMachine {
    /// The type of input that is [processed](StateMachine::process_input) by the state machine.
    type Input;
    /// The type of output that is [polled](StateMachine::poll_output) by the state machine.
    type Output;

    /// Process the provided `input` into the state machine.
    fn process_input(&mut self, input: Self::Input);

    /// Poll the state machine for output, returning the first available output if present.
    fn poll_output(&mut self) -> Option<Self::Output>;
}

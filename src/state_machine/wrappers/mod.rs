//! Common wrappers to provide system resources to [`StateMachine`](super::StateMachine) runners
//! so that machines can receive them deterministically via input.

pub mod system;

//! Connection state machine and the actor that serializes its input.

pub mod actor;
pub mod clock;
pub mod inbox;
#[allow(clippy::module_inception)]
pub mod machine;
pub mod observer;
pub mod transition;

pub use actor::*;
pub use clock::*;
pub use inbox::*;
pub use machine::*;
pub use observer::*;
pub use transition::{Action, Plan, TimerKind, validate_url};

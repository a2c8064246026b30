//! Types shared between the lockstep library and its entry points.

pub mod errors;

pub use errors::{LockstepError, LockstepResult};

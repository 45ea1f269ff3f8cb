//! Model activation: one resident model at a time.

pub mod cleanup;
mod coordinator;
mod mapped;
mod runtime;

pub use cleanup::{CleanupOutcome, CleanupPolicy};
pub use coordinator::{ActivationCoordinator, ActivationError, ActivationPhase, ActiveModelHandle};
pub use mapped::MappedRuntime;
pub use runtime::{InferenceRuntime, RuntimeError, RuntimeHandle};

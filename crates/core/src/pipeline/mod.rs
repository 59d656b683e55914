//! Step pipeline engine.
//!
//! A run executes its steps in order over a typed state. When a step
//! halts (or the run is cancelled) forward progress stops and every step
//! that started gets its `cleanup` called, newest first. Cleanup also
//! runs after a successful run so temporary resources are released.

mod error;
mod runner;
mod step;

pub use error::{PipelineError, PipelineFailure};
pub use runner::{RunReport, Runner};
pub use step::{cleanup_token, halt, require, StateBag, Step, StepAction};

/// Timestamp used in generated resource titles.
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()
}

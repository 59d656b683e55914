use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::error::PipelineError;

/// Outcome of a step's `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    Halt,
}

/// Shared per-run context passed to every step.
pub trait StateBag: Send {
    /// Token observed by every blocking wait of the run.
    fn cancellation(&self) -> &CancellationToken;

    /// The error that halted the run, if any.
    fn error(&self) -> Option<&PipelineError>;

    /// Record the halting error. Only the first one is kept.
    fn put_error(&mut self, error: PipelineError);

    fn take_error(&mut self) -> Option<PipelineError>;
}

/// A unit of work with a compensating cleanup.
///
/// `cleanup` runs for every step whose `run` was started, in reverse
/// order, whether the run succeeded or halted. It must tolerate missing
/// state and be safe to call more than once.
#[async_trait]
pub trait Step<S: StateBag>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, state: &mut S) -> StepAction;

    async fn cleanup(&self, _state: &mut S) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Record `err` on the state and halt.
pub fn halt<S: StateBag>(state: &mut S, err: PipelineError) -> StepAction {
    error!("{}", err);
    state.put_error(err);
    StepAction::Halt
}

/// Checked lookup of a value an earlier step should have stored.
pub fn require<'a, T>(value: &'a Option<T>, key: &'static str) -> Result<&'a T, PipelineError> {
    value.as_ref().ok_or(PipelineError::MissingState(key))
}

/// Token for compensation work: cleanup must still run after the run's
/// own token has been cancelled.
pub fn cleanup_token() -> CancellationToken {
    CancellationToken::new()
}

//! Ordered step runner with reverse-order compensation.

use tracing::{debug, info, warn};

use super::error::{PipelineError, PipelineFailure};
use super::step::{StateBag, Step, StepAction};

/// Summary of a successful run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Names of the steps that ran, in order.
    pub steps: Vec<&'static str>,
    /// Errors raised by cleanups. They never fail the run.
    pub cleanup_errors: Vec<PipelineError>,
}

/// Runs steps in order and compensates in reverse.
pub struct Runner<S: StateBag> {
    steps: Vec<Box<dyn Step<S>>>,
}

impl<S: StateBag> Runner<S> {
    pub fn new(steps: Vec<Box<dyn Step<S>>>) -> Self {
        Self { steps }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step until one halts or the token is cancelled, then call
    /// `cleanup` on each started step in reverse order.
    pub async fn run(&self, state: &mut S) -> Result<RunReport, PipelineFailure> {
        let mut started = 0;

        for step in &self.steps {
            if state.cancellation().is_cancelled() {
                info!("Cancellation requested, stopping before step '{}'", step.name());
                state.put_error(PipelineError::Cancelled);
                break;
            }

            debug!(step = step.name(), "Running step");
            started += 1;
            if step.run(state).await == StepAction::Halt {
                if state.error().is_none() {
                    state.put_error(PipelineError::Halted(step.name().to_string()));
                }
                break;
            }
        }

        let mut report = RunReport {
            steps: self.steps[..started].iter().map(|s| s.name()).collect(),
            cleanup_errors: Vec::new(),
        };

        for step in self.steps[..started].iter().rev() {
            debug!(step = step.name(), "Cleaning up step");
            if let Err(e) = step.cleanup(state).await {
                warn!(step = step.name(), "Cleanup failed: {}", e);
                report.cleanup_errors.push(e);
            }
        }

        match state.take_error() {
            Some(error) => Err(PipelineFailure {
                error,
                cleanup_errors: report.cleanup_errors,
                retained_templates: Vec::new(),
            }),
            None => Ok(report),
        }
    }
}

use async_trait::async_trait;
use tracing::info;

use super::state::BuildState;
use crate::pipeline::{halt, require, PipelineError, StateBag, Step, StepAction};

/// Stops the server so its disk can be templatized.
pub struct TeardownServer;

#[async_trait]
impl Step<BuildState> for TeardownServer {
    fn name(&self) -> &'static str {
        "teardown_server"
    }

    async fn run(&self, state: &mut BuildState) -> StepAction {
        let server = match require(&state.server, "server") {
            Ok(server) => server,
            Err(e) => return halt(state, e),
        };
        let (uuid, title) = (server.uuid.clone(), server.title.clone());

        info!("Stopping server '{}'", title);
        match state.driver.stop_server(&uuid, state.cancellation()).await {
            Ok(()) => {
                info!("Server '{}' stopped", title);
                StepAction::Continue
            }
            Err(e) => halt(
                state,
                PipelineError::driver(format!("failed to stop server {}", uuid), e),
            ),
        }
    }
}

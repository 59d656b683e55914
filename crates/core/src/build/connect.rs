use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::state::BuildState;
use crate::driver::poll_until;
use crate::pipeline::{halt, require, PipelineError, StateBag, Step, StepAction};

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Waits until the server accepts TCP connections on the SSH port.
pub struct Connect {
    port: u16,
    timeout: Duration,
    retry_interval: Duration,
    enabled: bool,
}

impl Connect {
    pub fn new(port: u16, timeout: Duration, enabled: bool) -> Self {
        Self {
            port,
            timeout,
            retry_interval: Duration::from_secs(2),
            enabled,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    async fn wait(&self, state: &BuildState) -> Result<(), PipelineError> {
        let address = require(&state.server_address, "server_address")?;
        let target = format!("{}:{}", address.host(), self.port);
        info!("Waiting for SSH on {}", target);

        let target = target.as_str();
        poll_until(
            &format!("ssh on {}", target),
            self.timeout,
            self.retry_interval,
            state.cancellation(),
            move || async move {
                match tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(target)).await {
                    Ok(Ok(_)) => Ok(Some(())),
                    Ok(Err(e)) => {
                        debug!("{} not reachable yet: {}", target, e);
                        Ok(None)
                    }
                    Err(_) => Ok(None),
                }
            },
        )
        .await
        .map_err(|e| PipelineError::driver("failed to connect to server", e))?;

        info!("Connected to {}", target);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for Connect {
    fn name(&self) -> &'static str {
        "connect"
    }

    async fn run(&self, state: &mut BuildState) -> StepAction {
        if !self.enabled {
            debug!("Communicator disabled, not connecting");
            return StepAction::Continue;
        }
        match self.wait(state).await {
            Ok(()) => StepAction::Continue,
            Err(e) => halt(state, e),
        }
    }
}

//! Cloud driver abstraction.
//!
//! The pipelines only talk to the platform through the [`Driver`] traits.
//! `UpCloudDriver` is the HTTP backend; `testing::MockDriver` is an
//! in-memory platform for tests.

mod traits;
mod types;
mod upcloud;
mod wait;

pub use traits::*;
pub use types::*;
pub use upcloud::{UpCloudConfig, UpCloudDriver};
pub use wait::{cancellable, poll_until, sleep_cancellable};

use std::future::Future;
use tracing::warn;

/// Error code returned when a template requires the metadata service.
pub const METADATA_DISABLED_CODE: &str = "METADATA_DISABLED_ON_CLOUD-INIT";

/// Issue a server create request, retrying once with metadata enabled if
/// the platform rejects it with [`METADATA_DISABLED_CODE`].
pub async fn create_server_with_metadata_retry<F, Fut>(
    spec: &ServerSpec,
    mut create: F,
) -> Result<Server, DriverError>
where
    F: FnMut(ServerSpec) -> Fut,
    Fut: Future<Output = Result<Server, DriverError>>,
{
    match create(spec.clone()).await {
        Err(err) if !spec.metadata && err.error_code() == Some(METADATA_DISABLED_CODE) => {
            warn!(
                title = %spec.title,
                "Source template requires the metadata service, retrying with metadata enabled"
            );
            create(ServerSpec {
                metadata: true,
                ..spec.clone()
            })
            .await
        }
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn spec() -> ServerSpec {
        ServerSpec {
            title: "imagesmith-custom-test".to_string(),
            hostname: "custom".to_string(),
            zone: "fi-hel1".to_string(),
            plan: "1xCPU-2GB".to_string(),
            source_storage: "ubuntu-uuid".to_string(),
            storage_size: 25,
            storage_tier: "maxiops".to_string(),
            login_user: "root".to_string(),
            ssh_public_key: None,
            networking: vec![],
            metadata: false,
        }
    }

    fn server() -> Server {
        Server {
            uuid: "srv".to_string(),
            title: "imagesmith-custom-test".to_string(),
            plan: "1xCPU-2GB".to_string(),
            zone: "fi-hel1".to_string(),
            state: ServerState::Started,
            ip_addresses: vec![],
            storage_devices: vec![],
        }
    }

    #[tokio::test]
    async fn test_retries_once_with_metadata() {
        let seen = Mutex::new(Vec::new());
        let result = create_server_with_metadata_retry(&spec(), |spec| {
            seen.lock().unwrap().push(spec.metadata);
            async move {
                if spec.metadata {
                    Ok(server())
                } else {
                    Err(DriverError::rejected(METADATA_DISABLED_CODE, "metadata required"))
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = Mutex::new(0);
        let err = create_server_with_metadata_retry(&spec(), |_| {
            *calls.lock().unwrap() += 1;
            async { Err(DriverError::rejected("INSUFFICIENT_CREDITS", "no money")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), Some("INSUFFICIENT_CREDITS"));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_second_failure_propagates() {
        let err = create_server_with_metadata_retry(&spec(), |_| async {
            Err(DriverError::rejected(METADATA_DISABLED_CODE, "still disabled"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), Some(METADATA_DISABLED_CODE));
    }
}

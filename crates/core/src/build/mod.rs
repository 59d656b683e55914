//! Template build pipeline.
//!
//! A temporary server is created from a source storage, provisioned over
//! SSH, stopped, and its boot disk templatized in the main zone and every
//! clone zone. Steps, in order: `CreateSshKey`, `CreateServer`, `Connect`,
//! `Provision`, `CleanupTempKeys`, `TeardownServer`, `CreateTemplate`.

mod address;
mod builder;
mod connect;
mod provision;
mod server;
mod ssh_key;
mod state;
mod teardown;
mod template;

pub use address::{find_address_by_access, select_address, SelectedAddress};
pub use builder::Builder;
pub use connect::Connect;
pub use provision::{CleanupTempKeys, ConnectionInfo, Provision, ProvisionError, Provisioner};
pub use server::{CreateServer, DEFAULT_HOSTNAME, DEFAULT_PLAN};
pub use ssh_key::{CreateSshKey, SshKeyGenerator, SshKeyPair, SshKeygen, TEMPORARY_KEY_COMMENT};
pub use state::BuildState;
pub use teardown::TeardownServer;
pub use template::CreateTemplate;

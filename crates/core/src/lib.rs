pub mod artifact;
pub mod build;
pub mod config;
pub mod driver;
pub mod import;
pub mod pipeline;
pub mod testing;

pub use artifact::{Artifact, ArtifactKind};
pub use build::{Builder, BuildState, ConnectionInfo, ProvisionError, Provisioner};
pub use config::{
    load_config, load_config_from_str, validate_build_config, validate_import_config, Config,
    ConfigError,
};
pub use driver::{Driver, DriverError, UpCloudConfig, UpCloudDriver};
pub use import::{ImageError, ImageFile, ImportState, Importer};
pub use pipeline::{PipelineError, PipelineFailure, RunReport, Runner, StateBag, Step, StepAction};

mod cli;
mod provisioner;

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imagesmith_core::{
    load_config, validate_build_config, validate_import_config, Artifact, Builder, Config,
    ConfigError, Driver, Importer, PipelineFailure, UpCloudConfig, UpCloudDriver,
};

use cli::{Cli, Command};
use provisioner::SshProvisioner;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    if let Err(e) = run(cli).await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!("Loading configuration from {:?}", cli.config);
    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            warn!("Interrupt received, cancelling and cleaning up");
            cancel.cancel();
        }
    });

    let artifact = match cli.command {
        Command::Build => build(config, cancel).await?,
        Command::Import { image } => import(config, &image, cancel).await?,
    };

    println!("{}", artifact);
    println!(
        "{}",
        serde_json::to_string_pretty(artifact.metadata()).context("Failed to encode metadata")?
    );
    Ok(())
}

async fn build(config: Config, cancel: CancellationToken) -> Result<Artifact> {
    let build = config
        .build
        .clone()
        .ok_or(ConfigError::MissingSection("build"))?;
    validate_build_config(&config.auth, &build)?;

    let driver = connect_driver(&config, build.state_timeout())?;
    let provisioner = Arc::new(SshProvisioner::new(build.provision_commands.clone()));
    let builder = Builder::new(build, driver, provisioner);
    builder.run(cancel).await.map_err(report_failure)
}

async fn import(config: Config, image: &Path, cancel: CancellationToken) -> Result<Artifact> {
    let import = config
        .import
        .clone()
        .ok_or(ConfigError::MissingSection("import"))?;
    validate_import_config(&config.auth, &import)?;

    let driver = connect_driver(&config, import.state_timeout())?;
    let importer = Importer::new(import, driver);
    importer.run(image, cancel).await.map_err(report_failure)
}

fn connect_driver(config: &Config, state_timeout: std::time::Duration) -> Result<Arc<dyn Driver>> {
    let credentials = config
        .auth
        .credentials()
        .ok_or_else(|| anyhow!("No UpCloud credentials configured"))?;
    let driver = UpCloudDriver::new(UpCloudConfig::new(&config.api, credentials, state_timeout))
        .context("Failed to create UpCloud client")?;
    info!("Using UpCloud API at {}", config.api.url);
    Ok(Arc::new(driver))
}

/// Log compensation errors and keep the terminal error.
fn report_failure(failure: PipelineFailure) -> anyhow::Error {
    for e in &failure.cleanup_errors {
        warn!("Cleanup error: {}", e);
    }
    if !failure.cleanup_errors.is_empty() {
        warn!(
            "{} resource(s) may need manual removal",
            failure.cleanup_errors.len()
        );
    }
    for template in &failure.retained_templates {
        warn!(
            "Template '{}' ({}) in {} was kept",
            template.title, template.uuid, template.zone
        );
    }
    anyhow::Error::new(failure.error)
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

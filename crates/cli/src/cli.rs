use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "imagesmith", author, version, about = "Build and import UpCloud storage templates", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "IMAGESMITH_CONFIG",
        default_value = "imagesmith.toml"
    )]
    pub config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build a template from a temporary server
    Build,
    /// Import a local raw or gzip image as a template
    Import {
        /// Image file (.raw or .gz)
        image: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_import_with_config() {
        let cli = Cli::try_parse_from([
            "imagesmith",
            "import",
            "--config",
            "/etc/imagesmith.toml",
            "disk.raw.gz",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("/etc/imagesmith.toml"));
        match cli.command {
            Command::Import { image } => assert_eq!(image, PathBuf::from("disk.raw.gz")),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_build_defaults() {
        let cli = Cli::try_parse_from(["imagesmith", "build"]).unwrap();
        assert!(matches!(cli.command, Command::Build));
        assert!(!cli.json_logs);
    }

    #[test]
    fn test_import_requires_image() {
        assert!(Cli::try_parse_from(["imagesmith", "import"]).is_err());
    }
}

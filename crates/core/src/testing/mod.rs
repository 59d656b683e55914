//! Testing utilities and mock implementations.
//!
//! [`MockDriver`] is an in-memory platform implementing every driver
//! capability, so both pipelines can run end to end without an account.
//!
//! # Example
//!
//! ```rust,ignore
//! use imagesmith_core::testing::{fixtures, MockDriver, MockProvisioner, StaticKeyGenerator};
//!
//! let driver = Arc::new(MockDriver::new());
//! let source = driver.add_template("Ubuntu Server 24.04 LTS", "fi-hel1").await;
//!
//! let builder = Builder::new(fixtures::build_config(&source.uuid), driver.clone(), Arc::new(MockProvisioner::new()))
//!     .with_key_generator(Arc::new(StaticKeyGenerator::default()));
//! ```

mod mock_driver;
mod mock_provisioner;

pub use mock_driver::{DriverCall, InjectedError, MockDriver, Operation};
pub use mock_provisioner::{MockProvisioner, StaticKeyGenerator};

/// Test fixtures and helper functions.
pub mod fixtures {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{self, Write};
    use std::path::{Path, PathBuf};

    use crate::config::{BuildConfig, Communicator, ImportConfig};

    /// Build config for `fi-hel1` from `storage_uuid`, without a
    /// communicator so no TCP connection is attempted.
    pub fn build_config(storage_uuid: &str) -> BuildConfig {
        BuildConfig {
            zone: "fi-hel1".to_string(),
            storage_uuid: Some(storage_uuid.to_string()),
            template_prefix: Some("test-image".to_string()),
            communicator: Communicator::None,
            state_timeout_secs: 5,
            ..Default::default()
        }
    }

    pub fn import_config(zones: &[&str], template_name: &str) -> ImportConfig {
        ImportConfig {
            zones: zones.iter().map(|z| z.to_string()).collect(),
            template_name: template_name.to_string(),
            state_timeout_secs: 5,
            ..Default::default()
        }
    }

    /// Write `len` bytes of a repeating pattern to `dir/name`.
    pub fn raw_image(dir: &Path, name: &str, len: usize) -> io::Result<PathBuf> {
        let path = dir.join(name);
        std::fs::write(&path, pattern(len))?;
        Ok(path)
    }

    /// Gzip-compress `len` pattern bytes into `dir/name`.
    pub fn gzip_image(dir: &Path, name: &str, len: usize) -> io::Result<PathBuf> {
        let path = dir.join(name);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&pattern(len))?;
        std::fs::write(&path, encoder.finish()?)?;
        Ok(path)
    }

    /// Like [`gzip_image`], but split into `members` concatenated gzip
    /// members.
    pub fn multi_member_gzip_image(
        dir: &Path,
        name: &str,
        len: usize,
        members: usize,
    ) -> io::Result<PathBuf> {
        let path = dir.join(name);
        let data = pattern(len);
        let mut out = Vec::new();
        for part in data.chunks(len.div_ceil(members.max(1)).max(1)) {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            encoder.write_all(part)?;
            out.extend(encoder.finish()?);
        }
        std::fs::write(&path, out)?;
        Ok(path)
    }

    /// The bytes written by [`raw_image`] and compressed by [`gzip_image`].
    pub fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }
}

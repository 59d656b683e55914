use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::driver::{AccessClass, AddressFamily};

pub const DEFAULT_TEMPLATE_PREFIX: &str = "custom-image";
pub const DEFAULT_STORAGE_TIER: &str = "maxiops";
pub const DEFAULT_API_URL: &str = "https://api.upcloud.com";
pub const MAX_TEMPLATE_NAME_LEN: usize = 40;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub build: Option<BuildConfig>,
    #[serde(default)]
    pub import: Option<ImportConfig>,
}

/// API credentials. Exactly one of username+password or token is accepted.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

/// Resolved credentials handed to the HTTP driver.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Token(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Token(_) => f.debug_tuple("Token").field(&"<redacted>").finish(),
        }
    }
}

impl AuthConfig {
    /// Fill unset fields from process environment variables.
    pub fn with_env_fallback(self) -> Self {
        self.with_fallback_from(|key| std::env::var(key).ok())
    }

    /// Fill unset fields from `lookup`, trying `UPCLOUD_USERNAME`,
    /// `UPCLOUD_PASSWORD` and `UPCLOUD_TOKEN` first and the legacy
    /// `UPCLOUD_API_USER` / `UPCLOUD_API_PASSWORD` names second.
    pub fn with_fallback_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| lookup(key))
                .find(|value| !value.is_empty())
        };

        if is_blank(&self.username) {
            self.username = first(&["UPCLOUD_USERNAME", "UPCLOUD_API_USER"]);
        }
        if is_blank(&self.password) {
            self.password = first(&["UPCLOUD_PASSWORD", "UPCLOUD_API_PASSWORD"]);
        }
        if is_blank(&self.token) {
            self.token = first(&["UPCLOUD_TOKEN"]);
        }
        self
    }

    /// Resolve into driver credentials. Call after validation.
    pub fn credentials(&self) -> Option<Credentials> {
        if let Some(token) = self.token.as_ref().filter(|t| !t.is_empty()) {
            return Some(Credentials::Token(token.clone()));
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Credentials::Basic {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            _ => None,
        }
    }
}

pub(crate) fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::is_empty).unwrap_or(true)
}

/// HTTP API settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_url")]
    pub url: String,
    /// Interval between state polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-request timeout for regular API calls (uploads are bounded by
    /// the pipeline state timeout instead)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// How the build talks to the temporary server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Communicator {
    #[default]
    Ssh,
    None,
}

/// One requested address on a network interface.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IpAddressConfig {
    /// Use this address as the communicator endpoint
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub family: AddressFamily,
    /// Explicit literal address
    #[serde(default)]
    pub address: Option<String>,
}

/// A requested network interface.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkInterface {
    #[serde(default)]
    pub ip_addresses: Vec<IpAddressConfig>,
    #[serde(rename = "type")]
    pub access: AccessClass,
    /// Private network UUID
    #[serde(default)]
    pub network: Option<String>,
}

/// Networking used when none is configured: public IPv4, utility IPv4,
/// public IPv6.
pub fn default_network_interfaces() -> Vec<NetworkInterface> {
    let iface = |access, family| NetworkInterface {
        ip_addresses: vec![IpAddressConfig {
            default: false,
            family,
            address: None,
        }],
        access,
        network: None,
    };
    vec![
        iface(AccessClass::Public, AddressFamily::IPv4),
        iface(AccessClass::Utility, AddressFamily::IPv4),
        iface(AccessClass::Public, AddressFamily::IPv6),
    ]
}

/// `[build]` section: template built from a temporary server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub zone: String,
    /// Source storage UUID (takes precedence over `storage_name`)
    #[serde(default)]
    pub storage_uuid: Option<String>,
    /// Case-insensitive substring of a source template title
    #[serde(default)]
    pub storage_name: Option<String>,
    #[serde(default)]
    pub template_prefix: Option<String>,
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default = "default_build_storage_size")]
    pub storage_size: u32,
    #[serde(default = "default_storage_tier")]
    pub storage_tier: String,
    #[serde(default = "default_build_timeout_secs")]
    pub state_timeout_secs: u64,
    #[serde(default)]
    pub boot_wait_secs: u64,
    #[serde(default)]
    pub clone_zones: Vec<String>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub communicator: Communicator,
    #[serde(default = "default_ssh_username")]
    pub ssh_username: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub ssh_private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub ssh_public_key_path: Option<PathBuf>,
    /// Shell commands run on the server by the provisioner
    #[serde(default)]
    pub provision_commands: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            zone: String::new(),
            storage_uuid: None,
            storage_name: None,
            template_prefix: None,
            template_name: None,
            storage_size: default_build_storage_size(),
            storage_tier: default_storage_tier(),
            state_timeout_secs: default_build_timeout_secs(),
            boot_wait_secs: 0,
            clone_zones: Vec::new(),
            network_interfaces: Vec::new(),
            communicator: Communicator::default(),
            ssh_username: default_ssh_username(),
            ssh_port: default_ssh_port(),
            ssh_private_key_path: None,
            ssh_public_key_path: None,
            provision_commands: Vec::new(),
        }
    }
}

impl BuildConfig {
    pub fn state_timeout(&self) -> Duration {
        Duration::from_secs(self.state_timeout_secs)
    }

    pub fn boot_wait(&self) -> Duration {
        Duration::from_secs(self.boot_wait_secs)
    }

    /// Template title: the explicit name, or `<prefix>-<timestamp>`.
    pub fn template_title(&self, timestamp: &str) -> String {
        match self.template_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => {
                let prefix = self
                    .template_prefix
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .unwrap_or(DEFAULT_TEMPLATE_PREFIX);
                format!("{}-{}", prefix, timestamp)
            }
        }
    }

    /// Interfaces requested for the server, falling back to the defaults.
    pub fn effective_interfaces(&self) -> Vec<NetworkInterface> {
        if self.network_interfaces.is_empty() {
            default_network_interfaces()
        } else {
            self.network_interfaces.clone()
        }
    }

    /// The address marked default, with the access class of its interface.
    pub fn default_ip_address(&self) -> Option<(&IpAddressConfig, AccessClass)> {
        self.network_interfaces.iter().find_map(|iface| {
            iface
                .ip_addresses
                .iter()
                .find(|ip| ip.default)
                .map(|ip| (ip, iface.access))
        })
    }
}

fn default_build_storage_size() -> u32 {
    25
}

fn default_storage_tier() -> String {
    DEFAULT_STORAGE_TIER.to_string()
}

fn default_build_timeout_secs() -> u64 {
    300
}

fn default_ssh_username() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

/// `[import]` section: template imported from a local image file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImportConfig {
    /// Target zones; the image is uploaded into the first one
    #[serde(default)]
    pub zones: Vec<String>,
    #[serde(default)]
    pub template_name: String,
    #[serde(default)]
    pub replace_existing: bool,
    #[serde(default = "default_storage_tier")]
    pub storage_tier: String,
    /// Overrides the size derived from the image
    #[serde(default)]
    pub storage_size: Option<u32>,
    #[serde(default = "default_import_timeout_secs")]
    pub state_timeout_secs: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            zones: Vec::new(),
            template_name: String::new(),
            replace_existing: false,
            storage_tier: default_storage_tier(),
            storage_size: None,
            state_timeout_secs: default_import_timeout_secs(),
        }
    }
}

impl ImportConfig {
    pub fn state_timeout(&self) -> Duration {
        Duration::from_secs(self.state_timeout_secs)
    }
}

fn default_import_timeout_secs() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_deserialize_build_defaults() {
        let toml = r#"
[build]
zone = "fi-hel1"
storage_uuid = "ubuntu-uuid"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let build = config.build.unwrap();
        assert_eq!(build.zone, "fi-hel1");
        assert_eq!(build.storage_size, 25);
        assert_eq!(build.storage_tier, "maxiops");
        assert_eq!(build.state_timeout_secs, 300);
        assert_eq!(build.ssh_username, "root");
        assert_eq!(build.communicator, Communicator::Ssh);
        assert!(config.import.is_none());
    }

    #[test]
    fn test_deserialize_network_interfaces() {
        let toml = r#"
[build]
zone = "fi-hel1"
storage_uuid = "ubuntu-uuid"

[[build.network_interfaces]]
type = "private"
network = "03c93d3b-1ab6-4e6b-a2b8-1fb1e7c3e3a8"

[[build.network_interfaces.ip_addresses]]
family = "IPv4"
default = true
address = "10.0.0.20"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let build = config.build.unwrap();
        let (ip, access) = build.default_ip_address().unwrap();
        assert_eq!(access, AccessClass::Private);
        assert_eq!(ip.address.as_deref(), Some("10.0.0.20"));
        assert_eq!(ip.family, AddressFamily::IPv4);
    }

    #[test]
    fn test_template_title_prefix_and_name() {
        let mut build = BuildConfig {
            template_prefix: Some("img".to_string()),
            ..Default::default()
        };
        assert_eq!(build.template_title("20240101-120000"), "img-20240101-120000");

        build.template_prefix = None;
        assert_eq!(
            build.template_title("20240101-120000"),
            "custom-image-20240101-120000"
        );

        build.template_name = Some("golden".to_string());
        assert_eq!(build.template_title("20240101-120000"), "golden");
    }

    #[test]
    fn test_default_networking() {
        let build = BuildConfig::default();
        let ifaces = build.effective_interfaces();
        assert_eq!(ifaces.len(), 3);
        assert_eq!(ifaces[0].access, AccessClass::Public);
        assert_eq!(ifaces[1].access, AccessClass::Utility);
        assert_eq!(ifaces[2].ip_addresses[0].family, AddressFamily::IPv6);
        assert!(build.default_ip_address().is_none());
    }

    #[test]
    fn test_auth_fallback_prefers_new_names() {
        let env: HashMap<&str, &str> = [
            ("UPCLOUD_USERNAME", "alice"),
            ("UPCLOUD_API_USER", "legacy"),
            ("UPCLOUD_API_PASSWORD", "secret"),
        ]
        .into_iter()
        .collect();

        let auth = AuthConfig::default()
            .with_fallback_from(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(auth.username.as_deref(), Some("alice"));
        assert_eq!(auth.password.as_deref(), Some("secret"));
        assert!(auth.token.is_none());
        assert_eq!(
            auth.credentials(),
            Some(Credentials::Basic {
                username: "alice".to_string(),
                password: "secret".to_string()
            })
        );
    }

    #[test]
    fn test_auth_fallback_keeps_file_values() {
        let auth = AuthConfig {
            token: Some("from-file".to_string()),
            ..Default::default()
        }
        .with_fallback_from(|key| (key == "UPCLOUD_TOKEN").then(|| "from-env".to_string()));
        assert_eq!(auth.credentials(), Some(Credentials::Token("from-file".to_string())));
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = Credentials::Basic {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_import_defaults() {
        let toml = r#"
[import]
zones = ["fi-hel1", "de-fra1"]
template_name = "debian-custom"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let import = config.import.unwrap();
        assert_eq!(import.state_timeout_secs, 3600);
        assert!(!import.replace_existing);
        assert!(import.storage_size.is_none());
        assert_eq!(import.storage_tier, "maxiops");
    }
}

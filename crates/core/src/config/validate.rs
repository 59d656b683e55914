use std::net::IpAddr;

use super::types::{
    is_blank, AuthConfig, BuildConfig, ImportConfig, NetworkInterface, MAX_TEMPLATE_NAME_LEN,
};
use super::ConfigError;
use crate::driver::{AccessClass, AddressFamily};
use crate::import::{STORAGE_MAX_SIZE_GB, STORAGE_MIN_SIZE_GB};

/// Validate credentials and the `[build]` section.
///
/// All problems are collected and reported in one `ConfigError::Invalid`.
pub fn validate_build_config(auth: &AuthConfig, build: &BuildConfig) -> Result<(), ConfigError> {
    let mut problems = auth_problems(auth);

    if build.zone.trim().is_empty() {
        problems.push("'zone' must be specified".to_string());
    }

    if is_blank(&build.storage_uuid) && is_blank(&build.storage_name) {
        problems.push("'storage_uuid' or 'storage_name' must be specified".to_string());
    }

    if !is_blank(&build.template_prefix) && !is_blank(&build.template_name) {
        problems.push(
            "you can either use 'template_prefix' or 'template_name' in same configuration"
                .to_string(),
        );
    }
    for (field, value) in [
        ("template_prefix", &build.template_prefix),
        ("template_name", &build.template_name),
    ] {
        if let Some(value) = value {
            if value.chars().count() > MAX_TEMPLATE_NAME_LEN {
                problems.push(format!(
                    "'{}' must be 0-{} characters",
                    field, MAX_TEMPLATE_NAME_LEN
                ));
            }
        }
    }

    if !(STORAGE_MIN_SIZE_GB..=STORAGE_MAX_SIZE_GB).contains(&build.storage_size) {
        problems.push(format!(
            "'storage_size' must be between {} and {} GB",
            STORAGE_MIN_SIZE_GB, STORAGE_MAX_SIZE_GB
        ));
    }

    if build.state_timeout_secs == 0 {
        problems.push("'state_timeout_secs' must be greater than 0".to_string());
    }

    if build.clone_zones.iter().any(|z| z.trim().is_empty()) {
        problems.push("'clone_zones' cannot contain empty zone names".to_string());
    }

    if build.ssh_private_key_path.is_some() != build.ssh_public_key_path.is_some() {
        problems.push(
            "'ssh_private_key_path' and 'ssh_public_key_path' must be set together".to_string(),
        );
    }

    problems.extend(network_problems(&build.network_interfaces));

    finish(problems)
}

/// Validate credentials and the `[import]` section.
pub fn validate_import_config(
    auth: &AuthConfig,
    import: &ImportConfig,
) -> Result<(), ConfigError> {
    let mut problems = auth_problems(auth);

    if import.zones.is_empty() {
        problems.push("'zones' must contain at least one zone".to_string());
    } else if import.zones.iter().any(|z| z.trim().is_empty()) {
        problems.push("'zones' cannot contain empty zone names".to_string());
    }

    if import.template_name.trim().is_empty() {
        problems.push("'template_name' must be specified".to_string());
    } else if import.template_name.chars().count() > MAX_TEMPLATE_NAME_LEN {
        problems.push(format!(
            "'template_name' must be 0-{} characters",
            MAX_TEMPLATE_NAME_LEN
        ));
    }

    if let Some(size) = import.storage_size {
        if !(STORAGE_MIN_SIZE_GB..=STORAGE_MAX_SIZE_GB).contains(&size) {
            problems.push(format!(
                "'storage_size' must be between {} and {} GB",
                STORAGE_MIN_SIZE_GB, STORAGE_MAX_SIZE_GB
            ));
        }
    }

    if import.state_timeout_secs == 0 {
        problems.push("'state_timeout_secs' must be greater than 0".to_string());
    }

    finish(problems)
}

fn finish(problems: Vec<String>) -> Result<(), ConfigError> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(problems))
    }
}

fn auth_problems(auth: &AuthConfig) -> Vec<String> {
    let has_username = !is_blank(&auth.username);
    let has_password = !is_blank(&auth.password);
    let has_token = !is_blank(&auth.token);

    let mut problems = Vec::new();
    match (has_username || has_password, has_token) {
        (true, true) => problems.push(
            "'username'/'password' and 'token' are mutually exclusive, use only one of them"
                .to_string(),
        ),
        (false, false) => problems.push(
            "either 'username' and 'password' or 'token' must be specified".to_string(),
        ),
        (true, false) => {
            if !has_username {
                problems.push("'username' must be specified with 'password'".to_string());
            }
            if !has_password {
                problems.push("'password' must be specified with 'username'".to_string());
            }
        }
        (false, true) => {}
    }
    problems
}

fn network_problems(interfaces: &[NetworkInterface]) -> Vec<String> {
    let mut problems = Vec::new();
    let mut defaults = 0;

    for (idx, iface) in interfaces.iter().enumerate() {
        if iface.access == AccessClass::Private {
            match iface.network.as_deref() {
                None | Some("") => problems.push(format!(
                    "network_interfaces[{}]: network UUID is required for a private interface",
                    idx
                )),
                Some(network) if uuid::Uuid::parse_str(network).is_err() => problems.push(
                    format!(
                        "network_interfaces[{}]: '{}' is not a valid network UUID",
                        idx, network
                    ),
                ),
                Some(_) => {}
            }
        }

        if iface.ip_addresses.is_empty() {
            problems.push(format!(
                "network_interfaces[{}]: at least one IP address is required",
                idx
            ));
        }

        for ip in &iface.ip_addresses {
            if ip.default {
                defaults += 1;
            }
            let Some(literal) = ip.address.as_deref() else {
                continue;
            };
            match literal.parse::<IpAddr>() {
                Ok(parsed) => {
                    let family = match parsed {
                        IpAddr::V4(_) => AddressFamily::IPv4,
                        IpAddr::V6(_) => AddressFamily::IPv6,
                    };
                    if family != ip.family {
                        problems.push(format!(
                            "network_interfaces[{}]: address '{}' is not {}",
                            idx, literal, ip.family
                        ));
                    }
                }
                Err(_) => problems.push(format!(
                    "network_interfaces[{}]: '{}' is not a valid IP address",
                    idx, literal
                )),
            }
        }
    }

    if defaults > 1 {
        problems.push("only one IP address can be marked as default".to_string());
    }
    problems
}

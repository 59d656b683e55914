//! Picks the address the build connects to.

use serde::Serialize;
use std::fmt;

use crate::config::BuildConfig;
use crate::driver::{AccessClass, AddressFamily, IpAddress};
use crate::pipeline::PipelineError;

/// The address chosen as communicator endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedAddress {
    pub address: String,
    pub family: AddressFamily,
    pub access: AccessClass,
}

impl SelectedAddress {
    /// Host part for URIs and `host:port` strings; IPv6 gets brackets.
    pub fn host(&self) -> String {
        match self.family {
            AddressFamily::IPv4 => self.address.clone(),
            AddressFamily::IPv6 => format!("[{}]", self.address),
        }
    }
}

impl fmt::Display for SelectedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

impl From<&IpAddress> for SelectedAddress {
    fn from(ip: &IpAddress) -> Self {
        Self {
            address: ip.address.clone(),
            family: ip.family,
            access: ip.access,
        }
    }
}

/// Choose the connection address for a freshly created server.
///
/// A default address with a literal value always wins. A default without
/// one is resolved against the server's addresses of the same access
/// class; with no default the public class is scanned.
pub fn select_address(
    config: &BuildConfig,
    assigned: &[IpAddress],
) -> Result<SelectedAddress, PipelineError> {
    let access = match config.default_ip_address() {
        Some((ip, access)) => {
            if let Some(literal) = ip.address.as_deref().filter(|a| !a.is_empty()) {
                return Ok(SelectedAddress {
                    address: literal.to_string(),
                    family: ip.family,
                    access,
                });
            }
            access
        }
        None => AccessClass::Public,
    };

    find_address_by_access(assigned, access).ok_or(PipelineError::NoMatchingAddress { access })
}

/// First IPv4 address of `access` class, else the first IPv6 one.
pub fn find_address_by_access(
    assigned: &[IpAddress],
    access: AccessClass,
) -> Option<SelectedAddress> {
    let mut ipv6 = None;
    for ip in assigned.iter().filter(|ip| ip.access == access) {
        match ip.family {
            AddressFamily::IPv4 => return Some(ip.into()),
            AddressFamily::IPv6 => {
                ipv6.get_or_insert_with(|| SelectedAddress::from(ip));
            }
        }
    }
    ipv6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IpAddressConfig, NetworkInterface};

    fn ip(access: AccessClass, family: AddressFamily, address: &str) -> IpAddress {
        IpAddress {
            access,
            family,
            address: address.to_string(),
        }
    }

    fn with_default(access: AccessClass, literal: Option<&str>) -> BuildConfig {
        BuildConfig {
            network_interfaces: vec![NetworkInterface {
                ip_addresses: vec![IpAddressConfig {
                    default: true,
                    family: AddressFamily::IPv4,
                    address: literal.map(str::to_string),
                }],
                access,
                network: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_literal_default_wins_regardless_of_server() {
        let config = with_default(AccessClass::Private, Some("10.1.2.3"));
        let assigned = vec![ip(AccessClass::Public, AddressFamily::IPv4, "94.237.1.1")];

        let selected = select_address(&config, &assigned).unwrap();
        assert_eq!(selected.address, "10.1.2.3");
        assert_eq!(selected.access, AccessClass::Private);

        // even with nothing assigned
        assert_eq!(select_address(&config, &[]).unwrap().address, "10.1.2.3");
    }

    #[test]
    fn test_default_without_literal_scans_its_access_class() {
        let config = with_default(AccessClass::Utility, None);
        let assigned = vec![
            ip(AccessClass::Public, AddressFamily::IPv4, "94.237.1.1"),
            ip(AccessClass::Utility, AddressFamily::IPv4, "10.5.0.2"),
        ];
        assert_eq!(select_address(&config, &assigned).unwrap().address, "10.5.0.2");
    }

    #[test]
    fn test_no_default_scans_public() {
        let assigned = vec![
            ip(AccessClass::Utility, AddressFamily::IPv4, "10.5.0.2"),
            ip(AccessClass::Public, AddressFamily::IPv6, "2a04:3540::1"),
            ip(AccessClass::Public, AddressFamily::IPv4, "94.237.1.1"),
        ];
        let selected = select_address(&BuildConfig::default(), &assigned).unwrap();
        assert_eq!(selected.address, "94.237.1.1");
        assert_eq!(selected.host(), "94.237.1.1");
    }

    #[test]
    fn test_ipv4_preferred_in_any_order() {
        let orders = [
            vec![
                ip(AccessClass::Public, AddressFamily::IPv6, "2a04::1"),
                ip(AccessClass::Public, AddressFamily::IPv4, "94.237.1.1"),
            ],
            vec![
                ip(AccessClass::Public, AddressFamily::IPv4, "94.237.1.1"),
                ip(AccessClass::Public, AddressFamily::IPv6, "2a04::1"),
            ],
        ];
        for assigned in orders {
            let found = find_address_by_access(&assigned, AccessClass::Public).unwrap();
            assert_eq!(found.family, AddressFamily::IPv4);
        }
    }

    #[test]
    fn test_ipv6_only_returns_first_and_brackets_host() {
        let assigned = vec![
            ip(AccessClass::Public, AddressFamily::IPv6, "2a04::1"),
            ip(AccessClass::Public, AddressFamily::IPv6, "2a04::2"),
        ];
        let found = find_address_by_access(&assigned, AccessClass::Public).unwrap();
        assert_eq!(found.address, "2a04::1");
        assert_eq!(found.host(), "[2a04::1]");
    }

    #[test]
    fn test_no_match_is_an_error() {
        let assigned = vec![ip(AccessClass::Utility, AddressFamily::IPv4, "10.5.0.2")];
        let err = select_address(&BuildConfig::default(), &assigned).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::NoMatchingAddress {
                access: AccessClass::Public
            }
        ));
    }
}

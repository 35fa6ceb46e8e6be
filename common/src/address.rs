// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common IP addressing functionality.
//!
//! The planner and any concrete infrastructure builder need to agree on
//! how a host template's declared offset maps onto a provisioned
//! network's CIDR, so that math lives here.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;

/// Errors produced while computing host addresses.
#[derive(
    Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize,
    JsonSchema,
)]
pub enum AddressError {
    /// The supplied network specification could not be parsed as an IPv4
    /// CIDR.
    #[error("invalid CIDR {cidr:?}: {message}")]
    InvalidCidr { cidr: String, message: String },
}

/// Computes the address `offset` positions into the network described by
/// `cidr`.
///
/// The network's base address is treated as an unsigned 32-bit integer
/// and `offset` is added to it.  No subnet-mask bound check is performed:
/// the caller must guarantee the offset stays inside the subnet, and an
/// oversized offset walks into the next network (`10.0.0.0/24` + 260 is
/// `10.0.1.4`).
pub fn subnet_ip(cidr: &str, offset: u32) -> Result<Ipv4Addr, AddressError> {
    let network: ipnetwork::Ipv4Network =
        cidr.parse().map_err(|e: ipnetwork::IpNetworkError| {
            AddressError::InvalidCidr {
                cidr: cidr.to_string(),
                message: e.to_string(),
            }
        })?;
    let base = u32::from(network.network());
    Ok(Ipv4Addr::from(base.wrapping_add(offset)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_subnet_ip_basic() {
        assert_eq!(
            subnet_ip("10.0.0.0/24", 5).unwrap(),
            "10.0.0.5".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            subnet_ip("172.16.4.0/22", 1).unwrap(),
            "172.16.4.1".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_subnet_ip_ignores_host_bits() {
        // The base address is the network address, not the literal
        // written in the CIDR.
        assert_eq!(
            subnet_ip("192.168.1.77/24", 3).unwrap(),
            "192.168.1.3".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_subnet_ip_overflows_into_next_network() {
        // Unguarded by design: the offset is not checked against the
        // mask.
        assert_eq!(
            subnet_ip("192.168.1.0/24", 260).unwrap(),
            "192.168.2.4".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_subnet_ip_rejects_garbage() {
        let err = subnet_ip("not-a-cidr", 1).unwrap_err();
        assert!(matches!(err, AddressError::InvalidCidr { .. }));

        let err = subnet_ip("10.0.0.0/33", 1).unwrap_err();
        assert!(matches!(err, AddressError::InvalidCidr { .. }));

        // IPv6 networks are not valid here either.
        let err = subnet_ip("fd00::/64", 1).unwrap_err();
        assert!(matches!(err, AddressError::InvalidCidr { .. }));
    }
}

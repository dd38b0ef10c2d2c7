//! Deterministic derivation of sandbox network resource names and addresses.
//!
//! Every OS resource a sandbox owns (network namespace, veth pair, iptables
//! chains, the rule ownership tag) is named from a short hash of the sandbox
//! id, so setup and teardown can re-derive the exact same targets on every
//! process restart without any bookkeeping.

use std::net::Ipv4Addr;

use getset::Getters;
use ipnetwork::Ipv4Network;
use sha2::{Digest, Sha256};

use crate::{BoxfleetError, BoxfleetResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The fixed tag every derived name starts with.
pub const NAME_TAG: &str = "bx";

/// The number of hash characters appended to the tag.
const HASH_LEN: usize = 8;

/// Linux interface names are limited to 15 characters.
const MAX_LINK_NAME_LEN: usize = 15;

/// Suffix of the host-side veth link name.
const HOST_SUFFIX: &str = "-host";

/// Suffix of the peer-side veth link name.
const PEER_SUFFIX: &str = "-peer";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Names and addresses derived for one sandbox.
///
/// Identical sandbox ids always yield identical values, which is what makes
/// re-entrant setup and teardown safe.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct NamesAndAddrs {
    /// The base name: fixed tag plus a short hash of the sandbox id.
    base: String,

    /// The network namespace name.
    namespace: String,

    /// The host-side veth link name.
    veth_host: String,

    /// The peer-side veth link name (inside the namespace).
    veth_peer: String,

    /// The first port-forward NAT chain name.
    chain_one: String,

    /// The second port-forward NAT chain name.
    chain_two: String,

    /// The point-to-point subnet assigned to the sandbox.
    cidr: Ipv4Network,

    /// The host end of the point-to-point link.
    host_addr: Ipv4Addr,

    /// The sandbox end of the point-to-point link.
    peer_addr: Ipv4Addr,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NamesAndAddrs {
    /// Derives all names and addresses for a sandbox id and its assigned CIDR.
    ///
    /// Pure and deterministic; fails only when the CIDR cannot supply two
    /// usable addresses.
    pub fn derive(sandbox_id: &str, cidr: Ipv4Network) -> BoxfleetResult<Self> {
        if cidr.size() < 4 {
            return Err(BoxfleetError::CidrTooSmall(cidr.to_string()));
        }

        let digest = Sha256::digest(sandbox_id.as_bytes());
        let mut base = String::with_capacity(NAME_TAG.len() + HASH_LEN);
        base.push_str(NAME_TAG);
        base.push_str(&hex::encode(digest)[..HASH_LEN]);
        debug_assert!(base.len() + HOST_SUFFIX.len() <= MAX_LINK_NAME_LEN);

        // First two usable addresses after the network address.
        let host_addr = cidr
            .nth(1)
            .ok_or_else(|| BoxfleetError::CidrTooSmall(cidr.to_string()))?;
        let peer_addr = cidr
            .nth(2)
            .ok_or_else(|| BoxfleetError::CidrTooSmall(cidr.to_string()))?;

        Ok(Self {
            namespace: base.clone(),
            veth_host: format!("{}{}", base, HOST_SUFFIX),
            veth_peer: format!("{}{}", base, PEER_SUFFIX),
            chain_one: format!("{}-pf-1", base),
            chain_two: format!("{}-pf-2", base),
            base,
            cidr,
            host_addr,
            peer_addr,
        })
    }

    /// The comment string tagged onto every iptables rule this sandbox owns.
    pub fn rule_tag(&self) -> &str {
        &self.base
    }

    /// The host address in `addr/prefix` form, as `ip addr add` expects it.
    pub fn host_addr_with_prefix(&self) -> String {
        format!("{}/{}", self.host_addr, self.cidr.prefix())
    }

    /// The peer address in `addr/prefix` form, as `ip addr add` expects it.
    pub fn peer_addr_with_prefix(&self) -> String {
        format!("{}/{}", self.peer_addr, self.cidr.prefix())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_derivation_is_stable() -> anyhow::Result<()> {
        let a = NamesAndAddrs::derive("box-1", cidr("10.115.0.0/30"))?;
        let b = NamesAndAddrs::derive("box-1", cidr("10.115.0.0/30"))?;

        assert_eq!(a, b);
        assert_eq!(a.get_namespace(), a.get_base());
        assert!(a.get_veth_host().starts_with(a.get_base().as_str()));

        Ok(())
    }

    #[test]
    fn test_distinct_ids_get_distinct_names() -> anyhow::Result<()> {
        let a = NamesAndAddrs::derive("box-1", cidr("10.115.0.0/30"))?;
        let b = NamesAndAddrs::derive("box-2", cidr("10.115.0.0/30"))?;

        assert_ne!(a.get_base(), b.get_base());
        assert_ne!(a.get_veth_host(), b.get_veth_host());
        assert_ne!(a.get_chain_one(), b.get_chain_one());

        Ok(())
    }

    #[test]
    fn test_names_fit_interface_limit() -> anyhow::Result<()> {
        let names = NamesAndAddrs::derive(
            "a-rather-long-sandbox-identifier-0123456789",
            cidr("10.115.0.4/30"),
        )?;

        assert!(names.get_veth_host().len() <= MAX_LINK_NAME_LEN);
        assert!(names.get_veth_peer().len() <= MAX_LINK_NAME_LEN);
        assert!(names.get_namespace().len() <= MAX_LINK_NAME_LEN);

        Ok(())
    }

    #[test]
    fn test_addresses_are_first_two_usable() -> anyhow::Result<()> {
        let names = NamesAndAddrs::derive("box-1", cidr("10.115.0.8/30"))?;

        assert_eq!(*names.get_host_addr(), "10.115.0.9".parse::<Ipv4Addr>()?);
        assert_eq!(*names.get_peer_addr(), "10.115.0.10".parse::<Ipv4Addr>()?);
        assert_eq!(names.host_addr_with_prefix(), "10.115.0.9/30");
        assert_eq!(names.peer_addr_with_prefix(), "10.115.0.10/30");

        Ok(())
    }

    #[test]
    fn test_too_small_cidr_is_rejected() {
        assert!(matches!(
            NamesAndAddrs::derive("box-1", cidr("10.115.0.0/31")),
            Err(BoxfleetError::CidrTooSmall(_))
        ));
        assert!(matches!(
            NamesAndAddrs::derive("box-1", cidr("10.115.0.1/32")),
            Err(BoxfleetError::CidrTooSmall(_))
        ));
    }
}

//! Veth pair setup between the host and a sandbox namespace.
//!
//! The peer end is placed into the namespace at creation time (`ip link add
//! ... netns`), so there is no window where a half-moved link exists in the
//! host namespace. Setup is re-entrant: existing links and addresses are
//! reused, but a link carrying an address we did not assign fails the setup
//! loudly instead of being silently reconfigured.

use serde::Deserialize;

use crate::{net::NamesAndAddrs, utils, BoxfleetError, BoxfleetResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LinkInfo {
    #[serde(default)]
    mtu: Option<u32>,
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    family: String,
    #[serde(default)]
    local: Option<String>,
    #[serde(default)]
    prefixlen: Option<u8>,
}

/// Outcome of checking a link's addresses against the one we want on it.
#[derive(Debug, PartialEq, Eq)]
enum AddrCheck {
    /// The expected address is already assigned.
    Present,

    /// No IPv4 address is assigned yet.
    Missing,

    /// A different IPv4 address is assigned.
    Foreign(String),
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates or repairs the sandbox's veth pair and its addresses and routes.
pub async fn setup_veth(names: &NamesAndAddrs) -> BoxfleetResult<()> {
    let host = names.get_veth_host().as_str();
    let peer = names.get_veth_peer().as_str();
    let ns = names.get_namespace().as_str();

    if link_exists(None, host).await? {
        tracing::debug!("reusing existing veth {}", host);
    } else {
        utils::run_tolerating_exists(
            "ip",
            &[
                "link", "add", host, "type", "veth", "peer", "name", peer, "netns", ns,
            ],
        )
        .await?;
        tracing::info!("created veth pair {} <-> {}@{}", host, peer, ns);
    }

    ensure_address(None, host, &names.host_addr_with_prefix()).await?;
    ensure_address(Some(ns), peer, &names.peer_addr_with_prefix()).await?;

    utils::run("ip", &["link", "set", host, "up"]).await?;
    utils::run("ip", &["-n", ns, "link", "set", peer, "up"]).await?;

    // Host route to the peer's single address, so forwarded traffic has a
    // next hop even before any broader routes exist.
    let peer_route = format!("{}/32", names.get_peer_addr());
    utils::run_tolerating_exists("ip", &["route", "add", &peer_route, "dev", host]).await?;

    Ok(())
}

/// Deletes the veth pair. Deleting either end removes both; an absent link
/// counts as already clean.
pub async fn teardown_veth(names: &NamesAndAddrs) -> BoxfleetResult<()> {
    utils::run_tolerating_absent("ip", &["link", "delete", names.get_veth_host()]).await?;
    Ok(())
}

/// Whether a link exists, optionally inside a namespace.
pub async fn link_exists(ns: Option<&str>, link: &str) -> BoxfleetResult<bool> {
    let output = match ns {
        Some(ns) => {
            utils::command_output("ip", &["-n", ns, "-j", "link", "show", "dev", link]).await?
        }
        None => utils::command_output("ip", &["-j", "link", "show", "dev", link]).await?,
    };

    if output.success() {
        return Ok(true);
    }
    if output.is_not_found() {
        return Ok(false);
    }
    Err(output.into_error())
}

/// Returns the MTU of a host-namespace link.
pub async fn link_mtu(link: &str) -> BoxfleetResult<u32> {
    let links: Vec<LinkInfo> =
        utils::command_json("ip", &["-j", "link", "show", "dev", link]).await?;

    links
        .first()
        .and_then(|l| l.mtu)
        .ok_or_else(|| BoxfleetError::UnexpectedCommandOutput {
            command: format!("ip -j link show dev {}", link),
            reason: "no mtu in output".to_string(),
        })
}

/// Assigns `addr` (in `addr/prefix` form) to a link unless it is already
/// there, failing if the link carries a different IPv4 address.
async fn ensure_address(ns: Option<&str>, link: &str, addr: &str) -> BoxfleetResult<()> {
    let links: Vec<LinkInfo> = match ns {
        Some(ns) => {
            utils::command_json("ip", &["-n", ns, "-j", "addr", "show", "dev", link]).await?
        }
        None => utils::command_json("ip", &["-j", "addr", "show", "dev", link]).await?,
    };

    let infos = links.first().map(|l| l.addr_info.as_slice()).unwrap_or(&[]);
    match classify_addresses(infos, addr) {
        AddrCheck::Present => {
            tracing::debug!("{} already has {}", link, addr);
            Ok(())
        }
        AddrCheck::Foreign(found) => Err(BoxfleetError::ForeignAddress {
            link: link.to_string(),
            address: found,
        }),
        AddrCheck::Missing => {
            match ns {
                Some(ns) => {
                    utils::run_tolerating_exists(
                        "ip",
                        &["-n", ns, "addr", "add", addr, "dev", link],
                    )
                    .await?
                }
                None => utils::run_tolerating_exists("ip", &["addr", "add", addr, "dev", link]).await?,
            };
            Ok(())
        }
    }
}

/// Pure decision over the parsed address list.
fn classify_addresses(infos: &[AddrInfo], expected: &str) -> AddrCheck {
    let (expected_local, expected_prefix) = match expected.split_once('/') {
        Some((local, prefix)) => (local, prefix),
        None => (expected, ""),
    };

    let mut found = None;
    for info in infos {
        if info.family != "inet" {
            continue;
        }
        let (Some(local), Some(prefixlen)) = (&info.local, info.prefixlen) else {
            continue;
        };
        if local == expected_local && prefixlen.to_string() == expected_prefix {
            return AddrCheck::Present;
        }
        found = Some(format!("{}/{}", local, prefixlen));
    }

    match found {
        Some(addr) => AddrCheck::Foreign(addr),
        None => AddrCheck::Missing,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_links(json: &str) -> Vec<LinkInfo> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_classify_detects_present_address() {
        let links = parse_links(
            r#"[{"ifname":"bxabc-host","mtu":1500,"addr_info":[
                {"family":"inet","local":"10.115.0.1","prefixlen":30},
                {"family":"inet6","local":"fe80::1","prefixlen":64}
            ]}]"#,
        );

        assert_eq!(
            classify_addresses(&links[0].addr_info, "10.115.0.1/30"),
            AddrCheck::Present
        );
    }

    #[test]
    fn test_classify_flags_foreign_address() {
        let links = parse_links(
            r#"[{"ifname":"bxabc-host","addr_info":[
                {"family":"inet","local":"192.168.9.1","prefixlen":24}
            ]}]"#,
        );

        assert_eq!(
            classify_addresses(&links[0].addr_info, "10.115.0.1/30"),
            AddrCheck::Foreign("192.168.9.1/24".to_string())
        );
    }

    #[test]
    fn test_classify_ignores_ipv6_only_links() {
        let links = parse_links(
            r#"[{"ifname":"bxabc-host","addr_info":[
                {"family":"inet6","local":"fe80::1","prefixlen":64}
            ]}]"#,
        );

        assert_eq!(
            classify_addresses(&links[0].addr_info, "10.115.0.1/30"),
            AddrCheck::Missing
        );
    }

    #[test]
    fn test_link_info_parses_without_addr_info() {
        let links = parse_links(r#"[{"ifname":"eth0","mtu":1500}]"#);
        assert_eq!(links[0].mtu, Some(1500));
        assert!(links[0].addr_info.is_empty());
    }
}

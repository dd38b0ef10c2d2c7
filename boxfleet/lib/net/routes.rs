//! Mirrors host routing table changes into a sandbox's network namespace.
//!
//! The sandbox reaches everything through its veth link, so a mirrored route
//! keeps only the destination; the next hop is always the host end of the
//! link. The mirror replays the current table once, then follows
//! `ip monitor route` until shut down. Route events are advisory: a single
//! route that fails to apply is logged and skipped, never fatal.

use std::{collections::HashMap, fmt, process::Stdio, time::Duration};

use anyhow::anyhow;
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::watch,
    task::JoinHandle,
    time::Instant,
};
use tracing::warn;

use crate::{
    net::{link_mtu, NamesAndAddrs},
    utils, BoxfleetError, BoxfleetResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long the route table must stay quiet before `settle` returns.
const SETTLE_QUIET: Duration = Duration::from_secs(1);

/// Upper bound on `settle`, in case the host table never stops changing.
const SETTLE_CAP: Duration = Duration::from_secs(10);

/// Route types that have no meaning inside the sandbox namespace.
const NON_MIRRORED_TYPES: &[&str] = &[
    "local",
    "broadcast",
    "anycast",
    "multicast",
    "unreachable",
    "prohibit",
    "blackhole",
    "throw",
    "nat",
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A running route mirror for one sandbox namespace.
#[derive(Debug)]
pub struct RouteMirror {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    events: watch::Receiver<u64>,
}

/// One route change, from the initial dump or the monitor stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteUpdate {
    removed: bool,
    dst: RouteDst,
    dev: Option<String>,
    mtu: Option<u32>,
}

/// A mirrorable route destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteDst {
    /// The default route.
    Default,

    /// A specific IPv4 destination; bare addresses parse as /32.
    Network(Ipv4Network),
}

/// One entry of `ip -4 -j route show`.
#[derive(Debug, Clone, Deserialize)]
struct RouteEntry {
    dst: Option<String>,
    dev: Option<String>,
    mtu: Option<u32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RouteMirror {
    /// Replays the current host routes into the namespace and starts
    /// following changes.
    ///
    /// The monitor process is spawned before the replay dump is taken, so
    /// changes racing the replay are buffered and applied afterwards.
    pub async fn start(names: NamesAndAddrs) -> BoxfleetResult<Self> {
        let veth_mtu = link_mtu(names.get_veth_host()).await?;

        let mut child = Command::new("ip")
            .args(["-4", "-o", "monitor", "route"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BoxfleetError::custom(anyhow!("route monitor has no stdout")))?;

        let mut dev_mtus = HashMap::new();
        replay_existing(&names, veth_mtu, &mut dev_mtus).await?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (events_tx, events) = watch::channel(0u64);

        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        let _ = changed;
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let Some(update) = parse_route_line(&line) else {
                                continue;
                            };
                            if !should_mirror(&update, &names) {
                                continue;
                            }
                            if let Err(error) =
                                apply_update(&names, veth_mtu, &mut dev_mtus, &update).await
                            {
                                warn!("failed to mirror route {}: {}", update.dst, error);
                            }
                            events_tx.send_modify(|count| *count += 1);
                        }
                        Ok(None) => {
                            warn!("route monitor stream ended");
                            break;
                        }
                        Err(error) => {
                            warn!("route monitor read failed: {}", error);
                            break;
                        }
                    }
                }
            }
            let _ = child.kill().await;
        });

        Ok(Self {
            handle,
            shutdown_tx,
            events,
        })
    }

    /// Waits until no route event has arrived for a full quiet period, with
    /// an overall cap for hosts whose tables never stop flapping.
    pub async fn settle(&self) {
        let mut events = self.events.clone();
        let deadline = Instant::now() + SETTLE_CAP;

        loop {
            tokio::select! {
                changed = events.changed() => {
                    if changed.is_err() || Instant::now() >= deadline {
                        break;
                    }
                }
                _ = tokio::time::sleep(SETTLE_QUIET) => break,
            }
        }
    }

    /// Stops the monitor and waits for the mirror task to exit.
    pub async fn shutdown(self) -> BoxfleetResult<()> {
        let _ = self.shutdown_tx.send(true);
        self.handle.await?;
        Ok(())
    }
}

impl RouteEntry {
    fn into_update(self) -> Option<RouteUpdate> {
        let dst = parse_dst(self.dst.as_deref()?)?;
        Some(RouteUpdate {
            removed: false,
            dst,
            dev: self.dev,
            mtu: self.mtu,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn replay_existing(
    names: &NamesAndAddrs,
    veth_mtu: u32,
    dev_mtus: &mut HashMap<String, u32>,
) -> BoxfleetResult<()> {
    let entries: Vec<RouteEntry> =
        utils::command_json("ip", &["-4", "-j", "route", "show"]).await?;

    for entry in entries {
        let Some(update) = entry.into_update() else {
            continue;
        };
        if !should_mirror(&update, names) {
            continue;
        }
        if let Err(error) = apply_update(names, veth_mtu, dev_mtus, &update).await {
            warn!("failed to mirror route {}: {}", update.dst, error);
        }
    }

    Ok(())
}

async fn apply_update(
    names: &NamesAndAddrs,
    veth_mtu: u32,
    dev_mtus: &mut HashMap<String, u32>,
    update: &RouteUpdate,
) -> BoxfleetResult<()> {
    let namespace = names.get_namespace();
    let dst = update.dst.to_string();

    if update.removed {
        utils::run_tolerating_absent("ip", &["-n", namespace, "route", "del", &dst]).await?;
        return Ok(());
    }

    let dev_mtu = match &update.dev {
        Some(dev) => cached_dev_mtu(dev_mtus, dev).await,
        None => None,
    };
    let mtu = clamped_mtu(veth_mtu, update.mtu, dev_mtu).to_string();

    // Replace rather than add, so metric-only variants of the same
    // destination collapse into one mirrored route.
    utils::run(
        "ip",
        &[
            "-n",
            namespace,
            "route",
            "replace",
            &dst,
            "via",
            &names.get_host_addr().to_string(),
            "dev",
            names.get_veth_peer(),
            "mtu",
            &mtu,
        ],
    )
    .await?;

    Ok(())
}

/// Looks up a link's MTU once and caches it for the life of the mirror.
async fn cached_dev_mtu(cache: &mut HashMap<String, u32>, dev: &str) -> Option<u32> {
    if let Some(mtu) = cache.get(dev) {
        return Some(*mtu);
    }
    let mtu = link_mtu(dev).await.ok()?;
    cache.insert(dev.to_string(), mtu);
    Some(mtu)
}

/// Clamps a mirrored route's MTU to the smallest of the veth MTU, the
/// route's own MTU and the original outgoing link's MTU.
fn clamped_mtu(veth_mtu: u32, route_mtu: Option<u32>, dev_mtu: Option<u32>) -> u32 {
    let mut mtu = veth_mtu;
    if let Some(value) = route_mtu {
        mtu = mtu.min(value);
    }
    if let Some(value) = dev_mtu {
        mtu = mtu.min(value);
    }
    mtu
}

/// Parses one `ip -4 -o monitor route` line. Returns `None` for events that
/// are not mirrorable IPv4 unicast routes.
fn parse_route_line(line: &str) -> Option<RouteUpdate> {
    let (removed, rest) = match line.strip_prefix("Deleted ") {
        Some(rest) => (true, rest),
        None => (false, line),
    };

    let mut tokens = rest.split_whitespace();
    let mut first = tokens.next()?;
    if first == "unicast" {
        first = tokens.next()?;
    }
    if NON_MIRRORED_TYPES.contains(&first) {
        return None;
    }

    let dst = parse_dst(first)?;

    let mut dev = None;
    let mut mtu = None;
    let mut table = None;
    while let Some(token) = tokens.next() {
        match token {
            "dev" => dev = tokens.next().map(str::to_string),
            "mtu" => mtu = tokens.next().and_then(|value| value.parse().ok()),
            "table" => table = tokens.next().map(str::to_string),
            _ => {}
        }
    }

    if table.as_deref() == Some("local") {
        return None;
    }

    Some(RouteUpdate {
        removed,
        dst,
        dev,
        mtu,
    })
}

fn parse_dst(token: &str) -> Option<RouteDst> {
    if token == "default" {
        return Some(RouteDst::Default);
    }
    if token.contains(':') {
        return None;
    }
    token.parse().ok().map(RouteDst::Network)
}

/// Whether a host route belongs in the sandbox's mirrored table.
fn should_mirror(update: &RouteUpdate, names: &NamesAndAddrs) -> bool {
    if update.dev.as_deref() == Some("lo") {
        return false;
    }
    match update.dst {
        RouteDst::Default => true,
        RouteDst::Network(network) => !overlaps(network, *names.get_cidr()),
    }
}

fn overlaps(a: Ipv4Network, b: Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for RouteDst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDst::Default => write!(f, "default"),
            RouteDst::Network(network) => write!(f, "{}", network),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> NamesAndAddrs {
        NamesAndAddrs::derive("box-1", "10.115.0.0/30".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_parse_added_route() {
        let update =
            parse_route_line("192.168.50.0/24 via 192.168.1.1 dev eth0 proto static metric 100")
                .unwrap();

        assert!(!update.removed);
        assert_eq!(
            update.dst,
            RouteDst::Network("192.168.50.0/24".parse().unwrap())
        );
        assert_eq!(update.dev.as_deref(), Some("eth0"));
        assert_eq!(update.mtu, None);
    }

    #[test]
    fn test_parse_deleted_route() {
        let update = parse_route_line("Deleted 10.40.0.0/16 dev wg0 scope link").unwrap();

        assert!(update.removed);
        assert_eq!(update.dst, RouteDst::Network("10.40.0.0/16".parse().unwrap()));
    }

    #[test]
    fn test_parse_default_and_bare_address() {
        let default = parse_route_line("default via 192.168.1.1 dev eth0").unwrap();
        assert_eq!(default.dst, RouteDst::Default);

        let bare = parse_route_line("10.5.5.5 via 192.168.1.1 dev eth0 mtu 1400").unwrap();
        assert_eq!(bare.dst, RouteDst::Network("10.5.5.5/32".parse().unwrap()));
        assert_eq!(bare.mtu, Some(1400));
    }

    #[test]
    fn test_parse_skips_non_unicast_and_local_table() {
        assert!(parse_route_line(
            "local 192.168.1.5 dev eth0 table local proto kernel scope host"
        )
        .is_none());
        assert!(parse_route_line("broadcast 192.168.1.255 dev eth0 table local").is_none());
        assert!(parse_route_line("198.51.100.0/24 dev eth0 table local").is_none());
        assert!(parse_route_line("unreachable 203.0.113.9").is_none());
    }

    #[test]
    fn test_parse_skips_ipv6() {
        assert!(parse_route_line("fd00::/64 dev eth0 proto ra metric 100").is_none());
        assert!(parse_route_line("Deleted 2001:db8::/32 dev eth0").is_none());
    }

    #[test]
    fn test_unicast_prefix_is_accepted() {
        let update = parse_route_line("unicast 172.16.0.0/12 dev eth1").unwrap();
        assert_eq!(update.dst, RouteDst::Network("172.16.0.0/12".parse().unwrap()));
    }

    #[test]
    fn test_mirror_filter() {
        let names = names();

        let default = parse_route_line("default via 192.168.1.1 dev eth0").unwrap();
        assert!(should_mirror(&default, &names));

        let loopback = parse_route_line("192.0.2.0/24 dev lo").unwrap();
        assert!(!should_mirror(&loopback, &names));

        // The sandbox's own point-to-point subnet stays out.
        let own = parse_route_line("10.115.0.2 dev bx0123-host scope link").unwrap();
        assert!(!should_mirror(&own, &names));
        let own_subnet = parse_route_line("10.115.0.0/30 dev bx0123-host").unwrap();
        assert!(!should_mirror(&own_subnet, &names));

        // A wider network containing the subnet also stays out.
        let containing = parse_route_line("10.0.0.0/8 via 10.0.0.1 dev eth0").unwrap();
        assert!(!should_mirror(&containing, &names));

        let unrelated = parse_route_line("192.168.50.0/24 via 192.168.1.1 dev eth0").unwrap();
        assert!(should_mirror(&unrelated, &names));
    }

    #[test]
    fn test_mtu_clamping() {
        assert_eq!(clamped_mtu(1500, None, None), 1500);
        assert_eq!(clamped_mtu(1500, Some(1400), None), 1400);
        assert_eq!(clamped_mtu(1500, None, Some(1300)), 1300);
        assert_eq!(clamped_mtu(1500, Some(1400), Some(1300)), 1300);
        assert_eq!(clamped_mtu(1200, Some(1400), Some(1300)), 1200);
    }

    #[test]
    fn test_route_show_entry_conversion() {
        let entry: RouteEntry = serde_json::from_str(
            r#"{"dst":"192.168.50.0/24","gateway":"192.168.1.1","dev":"eth0","protocol":"static","metric":100,"flags":[]}"#,
        )
        .unwrap();
        let update = entry.into_update().unwrap();

        assert!(!update.removed);
        assert_eq!(update.dev.as_deref(), Some("eth0"));

        let with_mtu: RouteEntry =
            serde_json::from_str(r#"{"dst":"10.9.9.0/24","dev":"eth0","mtu":1200}"#).unwrap();
        assert_eq!(with_mtu.into_update().unwrap().mtu, Some(1200));
    }
}

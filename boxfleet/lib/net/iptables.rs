//! Iptables rule ownership, base rule setup and port-forward chain rotation.
//!
//! Every rule a sandbox installs is tagged `-m comment --comment <base>`, so
//! ownership is recoverable purely from the live ruleset: purge dumps the
//! ruleset, drops the owned lines and loads the remainder back. No external
//! bookkeeping exists to go stale across crashes.
//!
//! Port forwards live in two generations of NAT chains (`<base>-pf-1`,
//! `<base>-pf-2`). An update populates the idle chain and only then moves the
//! `PREROUTING` jump over, so there is no window where forwarded traffic hits
//! an empty table.

use tokio::sync::watch;

use crate::{config::PortForward, net::NamesAndAddrs, utils, BoxfleetError, BoxfleetResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Manages the iptables rules owned by one sandbox.
///
/// The rotation counter lives here, one per sandbox instance; it never needs
/// to survive restarts because `setup` always starts from a purged state.
#[derive(Debug)]
pub struct RuleManager {
    names: NamesAndAddrs,
    rotation: u64,
}

/// One step of the port-forward chain rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RotationStep {
    /// Create the chain if something external removed it.
    EnsureChain(String),

    /// Empty the chain.
    FlushChain(String),

    /// Append the forward rules to the chain.
    Populate {
        /// The chain being populated.
        chain: String,

        /// Rendered rule bodies, one per forward entry.
        rules: Vec<String>,
    },

    /// Insert the `PREROUTING` jump to the chain at the top.
    InsertJump(String),

    /// Remove the `PREROUTING` jump to the chain.
    RemoveJump(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RuleManager {
    /// Creates a rule manager for a sandbox's derived names.
    pub fn new(names: NamesAndAddrs) -> Self {
        Self { names, rotation: 0 }
    }

    /// Removes every rule and chain owned by this sandbox.
    ///
    /// Safe to call when nothing is installed yet; that is a no-op.
    pub async fn purge(&self) -> BoxfleetResult<()> {
        let output = utils::command_output("iptables-save", &[]).await?;
        if !output.success() {
            return Err(output.into_error());
        }

        let (filtered, changed) = strip_owned_lines(output.stdout(), &self.names);
        if changed {
            utils::run_with_stdin("iptables-restore", &[], &filtered).await?;
            tracing::info!("purged iptables rules tagged {}", self.names.rule_tag());
        }

        // Chains that never made it into the dump (partially created, or
        // emptied by hand) still need an explicit flush and delete.
        for chain in [self.names.get_chain_one(), self.names.get_chain_two()] {
            utils::run_tolerating_absent("iptables", &["-t", "nat", "-F", chain]).await?;
            utils::run_tolerating_absent("iptables", &["-t", "nat", "-X", chain]).await?;
        }

        Ok(())
    }

    /// Purges, then installs the sandbox's base rules as a single script:
    /// FORWARD accepts for the veth link, MASQUERADE for the sandbox subnet,
    /// and the two empty port-forward chains.
    pub async fn setup(&self) -> BoxfleetResult<()> {
        self.purge().await?;

        utils::run_script(&setup_script(&self.names)).await?;
        tracing::info!(
            "installed base rules for {} ({})",
            self.names.get_veth_host(),
            self.names.get_cidr()
        );

        Ok(())
    }

    /// Applies a port-forward list using the two-chain rotation.
    ///
    /// Steps run as separate atomic commands; `shutdown` is checked between
    /// steps, never mid-step.
    pub async fn apply_port_forwards(
        &mut self,
        forwards: &[PortForward],
        shutdown: &watch::Receiver<bool>,
    ) -> BoxfleetResult<()> {
        let (next, old) = self.chains();
        let (next, old) = (next.to_string(), old.to_string());
        let plan = rotation_plan(&self.names, &next, &old, forwards);

        for step in &plan {
            if *shutdown.borrow() {
                return Err(BoxfleetError::Interrupted);
            }
            self.execute(step).await?;
        }

        self.rotation += 1;
        tracing::info!(
            "rotated {} port forward(s) into {}",
            forwards.len(),
            next
        );

        Ok(())
    }

    /// The (next, old) chain pair for the current rotation position.
    fn chains(&self) -> (&str, &str) {
        if self.rotation % 2 == 0 {
            (self.names.get_chain_one(), self.names.get_chain_two())
        } else {
            (self.names.get_chain_two(), self.names.get_chain_one())
        }
    }

    async fn execute(&self, step: &RotationStep) -> BoxfleetResult<()> {
        let tag = self.names.rule_tag();
        match step {
            RotationStep::EnsureChain(chain) => {
                utils::run_tolerating_exists("iptables", &["-t", "nat", "-N", chain]).await?;
            }
            RotationStep::FlushChain(chain) => {
                utils::run_tolerating_absent("iptables", &["-t", "nat", "-F", chain]).await?;
            }
            RotationStep::Populate { chain, rules } => {
                if !rules.is_empty() {
                    let script = rules
                        .iter()
                        .map(|rule| format!("iptables -t nat -A {} {}", chain, rule))
                        .collect::<Vec<_>>()
                        .join("\n");
                    utils::run_script(&script).await?;
                }
            }
            RotationStep::InsertJump(chain) => {
                utils::run(
                    "iptables",
                    &[
                        "-t",
                        "nat",
                        "-I",
                        "PREROUTING",
                        "-m",
                        "comment",
                        "--comment",
                        tag,
                        "-j",
                        chain,
                    ],
                )
                .await?;
            }
            RotationStep::RemoveJump(chain) => {
                utils::run_tolerating_absent(
                    "iptables",
                    &[
                        "-t",
                        "nat",
                        "-D",
                        "PREROUTING",
                        "-m",
                        "comment",
                        "--comment",
                        tag,
                        "-j",
                        chain,
                    ],
                )
                .await?;
            }
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Renders the base rule script installed by `setup`.
fn setup_script(names: &NamesAndAddrs) -> String {
    let veth = names.get_veth_host();
    let tag = names.rule_tag();
    format!(
        "iptables -A FORWARD -i {veth} -m comment --comment {tag} -j ACCEPT\n\
         iptables -A FORWARD -o {veth} -m comment --comment {tag} -j ACCEPT\n\
         iptables -t nat -A POSTROUTING -s {cidr} -m comment --comment {tag} -j MASQUERADE\n\
         iptables -t nat -N {chain_one}\n\
         iptables -t nat -N {chain_two}",
        cidr = names.get_cidr(),
        chain_one = names.get_chain_one(),
        chain_two = names.get_chain_two(),
    )
}

/// Builds the ordered rotation steps: flush the idle chain, fill it, move the
/// jump over, then drop and flush the previous generation.
fn rotation_plan(
    names: &NamesAndAddrs,
    next: &str,
    old: &str,
    forwards: &[PortForward],
) -> Vec<RotationStep> {
    let rules = forwards
        .iter()
        .map(|f| forward_rule(names, f))
        .collect::<Vec<_>>();

    vec![
        RotationStep::EnsureChain(next.to_string()),
        RotationStep::FlushChain(next.to_string()),
        RotationStep::Populate {
            chain: next.to_string(),
            rules,
        },
        RotationStep::InsertJump(next.to_string()),
        RotationStep::RemoveJump(old.to_string()),
        RotationStep::FlushChain(old.to_string()),
    ]
}

/// Renders one DNAT rule body for a forward entry.
fn forward_rule(names: &NamesAndAddrs, forward: &PortForward) -> String {
    let mut parts = vec!["-p".to_string(), forward.get_protocol().as_str().to_string()];

    if let Some(dest) = forward.get_dest() {
        parts.push("-d".to_string());
        parts.push(dest.to_string());
    }

    parts.push("--dport".to_string());
    if forward.is_range() {
        parts.push(format!(
            "{}:{}",
            forward.get_host_start(),
            forward.get_host_end()
        ));
    } else {
        parts.push(forward.get_host_start().to_string());
    }

    parts.push("-m".to_string());
    parts.push("comment".to_string());
    parts.push("--comment".to_string());
    parts.push(names.rule_tag().to_string());

    parts.push("-j".to_string());
    parts.push("DNAT".to_string());
    parts.push("--to-destination".to_string());
    if forward.is_range() {
        parts.push(format!(
            "{}:{}-{}",
            names.get_peer_addr(),
            forward.get_target(),
            forward.target_end()
        ));
    } else {
        parts.push(format!("{}:{}", names.get_peer_addr(), forward.get_target()));
    }

    parts.join(" ")
}

/// Drops every dump line owned by this sandbox, keeping everything else
/// byte-for-byte. Returns the filtered dump and whether anything was dropped.
fn strip_owned_lines(dump: &str, names: &NamesAndAddrs) -> (String, bool) {
    let mut filtered = String::with_capacity(dump.len());
    let mut changed = false;

    for line in dump.lines() {
        if line_is_owned(line, names) {
            changed = true;
        } else {
            filtered.push_str(line);
            filtered.push('\n');
        }
    }

    (filtered, changed)
}

fn line_is_owned(line: &str, names: &NamesAndAddrs) -> bool {
    let tag = names.rule_tag();
    let quoted_tag = format!("\"{}\"", tag);
    let chain_one = names.get_chain_one().as_str();
    let chain_two = names.get_chain_two().as_str();

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if let Some(first) = tokens.first() {
        // Chain declaration lines look like `:bxabcdef01-pf-1 - [0:0]`.
        if first.strip_prefix(':') == Some(chain_one) || first.strip_prefix(':') == Some(chain_two)
        {
            return true;
        }
    }

    for pair in tokens.windows(2) {
        // iptables-save may or may not quote comment values.
        if pair[0] == "--comment" && (pair[1] == tag || pair[1] == quoted_tag) {
            return true;
        }
    }

    tokens
        .iter()
        .any(|token| *token == chain_one || *token == chain_two)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::Protocol;

    fn names_for(id: &str) -> NamesAndAddrs {
        NamesAndAddrs::derive(id, "10.115.0.0/30".parse().unwrap()).unwrap()
    }

    /// Minimal model of the nat table: custom chains and the PREROUTING jumps.
    #[derive(Default)]
    struct NatModel {
        chains: BTreeMap<String, Vec<String>>,
        prerouting: Vec<String>,
    }

    impl NatModel {
        fn apply(&mut self, step: &RotationStep) {
            match step {
                RotationStep::EnsureChain(chain) => {
                    self.chains.entry(chain.clone()).or_default();
                }
                RotationStep::FlushChain(chain) => {
                    if let Some(rules) = self.chains.get_mut(chain) {
                        rules.clear();
                    }
                }
                RotationStep::Populate { chain, rules } => {
                    self.chains
                        .get_mut(chain)
                        .expect("populate of missing chain")
                        .extend(rules.iter().cloned());
                }
                RotationStep::InsertJump(chain) => {
                    self.prerouting.insert(0, chain.clone());
                }
                RotationStep::RemoveJump(chain) => {
                    if let Some(pos) = self.prerouting.iter().position(|c| c == chain) {
                        self.prerouting.remove(pos);
                    }
                }
            }
        }

        /// Every rule currently reachable from PREROUTING.
        fn live_rules(&self) -> Vec<String> {
            self.prerouting
                .iter()
                .flat_map(|chain| self.chains.get(chain).cloned().unwrap_or_default())
                .collect()
        }

        fn serves(&self, rules: &[String]) -> bool {
            let live = self.live_rules();
            !rules.is_empty() && rules.iter().all(|r| live.contains(r))
        }
    }

    fn rendered(names: &NamesAndAddrs, forwards: &[PortForward]) -> Vec<String> {
        forwards.iter().map(|f| forward_rule(names, f)).collect()
    }

    #[test]
    fn test_rotation_has_no_gap() {
        let names = names_for("box-1");
        let mut manager = RuleManager::new(names.clone());
        let mut model = NatModel::default();

        let list_a = vec![PortForward::new(Protocol::Tcp, 8080, 80)];
        let list_b = vec![
            PortForward::new(Protocol::Tcp, 8080, 80),
            PortForward::new(Protocol::Udp, 53, 53),
        ];
        let rules_a = rendered(&names, &list_a);
        let rules_b = rendered(&names, &list_b);

        // First application: list A goes live.
        let (next, old) = manager.chains();
        for step in rotation_plan(&names, next, old, &list_a) {
            model.apply(&step);
        }
        manager.rotation += 1;
        assert!(model.serves(&rules_a));

        // Second application: at every step boundary, A or B stays live.
        let (next, old) = manager.chains();
        for step in rotation_plan(&names, next, old, &list_b) {
            model.apply(&step);
            assert!(
                model.serves(&rules_a) || model.serves(&rules_b),
                "gap after {:?}",
                step
            );
        }
        manager.rotation += 1;

        // Settled: exactly list B, one live jump, idle chain empty.
        assert!(model.serves(&rules_b));
        assert_eq!(model.prerouting.len(), 1);
        let live = model.live_rules();
        assert_eq!(live.len(), rules_b.len());
        let idle = manager.chains().0;
        assert!(model.chains.get(idle).unwrap().is_empty());
    }

    #[test]
    fn test_chain_alternation() {
        let names = names_for("box-1");
        let mut manager = RuleManager::new(names.clone());

        assert_eq!(manager.chains().0, names.get_chain_one().as_str());
        manager.rotation += 1;
        assert_eq!(manager.chains().0, names.get_chain_two().as_str());
        manager.rotation += 1;
        assert_eq!(manager.chains().0, names.get_chain_one().as_str());
    }

    #[test]
    fn test_forward_rule_rendering() {
        let names = names_for("box-1");
        let peer = names.get_peer_addr().to_string();

        let single = forward_rule(&names, &PortForward::new(Protocol::Tcp, 8080, 80));
        assert_eq!(
            single,
            format!(
                "-p tcp --dport 8080 -m comment --comment {} -j DNAT --to-destination {}:80",
                names.rule_tag(),
                peer
            )
        );

        let ranged = forward_rule(
            &names,
            &"tcp/8000-8010:9000@203.0.113.0/24".parse::<PortForward>().unwrap(),
        );
        assert!(ranged.contains("-d 203.0.113.0/24"));
        assert!(ranged.contains("--dport 8000:8010"));
        assert!(ranged.contains(&format!("--to-destination {}:9000-9010", peer)));
    }

    #[test]
    fn test_purge_filter_only_removes_owned_lines() {
        let ours = names_for("box-1");
        let other = names_for("box-2");

        let dump = format!(
            "*nat\n\
             :PREROUTING ACCEPT [0:0]\n\
             :POSTROUTING ACCEPT [0:0]\n\
             :{ours_chain} - [0:0]\n\
             :{other_chain} - [0:0]\n\
             -A PREROUTING -m comment --comment {ours_tag} -j {ours_chain}\n\
             -A PREROUTING -m comment --comment \"{other_tag}\" -j {other_chain}\n\
             -A {ours_chain} -p tcp --dport 8080 -m comment --comment {ours_tag} -j DNAT --to-destination 10.115.0.2:80\n\
             -A POSTROUTING -s 10.115.0.4/30 -m comment --comment {other_tag} -j MASQUERADE\n\
             -A POSTROUTING -s 172.17.0.0/16 -j MASQUERADE\n\
             COMMIT\n",
            ours_chain = ours.get_chain_one(),
            other_chain = other.get_chain_one(),
            ours_tag = ours.rule_tag(),
            other_tag = other.rule_tag(),
        );

        let (filtered, changed) = strip_owned_lines(&dump, &ours);

        assert!(changed);
        assert!(!filtered.contains(ours.rule_tag()));
        // The other sandbox's lines and unrelated lines survive untouched.
        assert!(filtered.contains(other.get_chain_one().as_str()));
        assert!(filtered.contains("-s 172.17.0.0/16 -j MASQUERADE"));
        assert!(filtered.contains("*nat"));
        assert!(filtered.contains("COMMIT"));
        assert!(filtered.contains(":PREROUTING ACCEPT [0:0]"));
    }

    #[test]
    fn test_purge_filter_handles_quoted_comments() {
        let ours = names_for("box-1");
        let dump = format!(
            "*filter\n\
             -A FORWARD -i {veth} -m comment --comment \"{tag}\" -j ACCEPT\n\
             COMMIT\n",
            veth = ours.get_veth_host(),
            tag = ours.rule_tag(),
        );

        let (filtered, changed) = strip_owned_lines(&dump, &ours);
        assert!(changed);
        assert!(!filtered.contains("-A FORWARD"));
        assert!(filtered.contains("*filter"));
    }

    #[test]
    fn test_purge_filter_without_owned_lines_is_noop() {
        let ours = names_for("box-1");
        let dump = "*nat\n:PREROUTING ACCEPT [0:0]\n-A POSTROUTING -s 172.17.0.0/16 -j MASQUERADE\nCOMMIT\n";

        let (filtered, changed) = strip_owned_lines(dump, &ours);
        assert!(!changed);
        assert_eq!(filtered, dump);
    }

    #[test]
    fn test_setup_script_tags_every_rule() {
        let names = names_for("box-1");
        let script = setup_script(&names);

        for line in script.lines().filter(|l| l.contains("-A ")) {
            assert!(line.contains(&format!("--comment {}", names.rule_tag())));
        }
        assert!(script.contains(&format!("-N {}", names.get_chain_one())));
        assert!(script.contains(&format!("-N {}", names.get_chain_two())));
    }
}

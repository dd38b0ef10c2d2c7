//! Keeps a sandbox's live DNAT forwards in step with its box spec.
//!
//! The manager remembers the last list it rotated in and only touches
//! iptables when the desired list actually changes, so the steady-state poll
//! loop costs nothing.

use tokio::sync::watch;

use crate::{config::PortForward, net::RuleManager, BoxfleetResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Reconciles the desired port-forward list against what is installed.
#[derive(Debug)]
pub struct PortForwardManager {
    rules: RuleManager,
    applied: Option<Vec<PortForward>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PortForwardManager {
    /// Wraps a rule manager whose base rules are already set up.
    pub fn new(rules: RuleManager) -> Self {
        Self {
            rules,
            applied: None,
        }
    }

    /// Rotates `desired` in if it differs from the last applied list.
    ///
    /// The comparison is order-sensitive: rule order is match priority, so a
    /// reordered list is a real change. Returns whether a rotation ran.
    pub async fn sync(
        &mut self,
        desired: &[PortForward],
        shutdown: &watch::Receiver<bool>,
    ) -> BoxfleetResult<bool> {
        if !needs_update(self.applied.as_deref(), desired) {
            return Ok(false);
        }

        self.rules.apply_port_forwards(desired, shutdown).await?;
        self.applied = Some(desired.to_vec());

        Ok(true)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn needs_update(applied: Option<&[PortForward]>, desired: &[PortForward]) -> bool {
    applied != Some(desired)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    #[test]
    fn test_first_sync_always_applies() {
        assert!(needs_update(None, &[]));
        assert!(needs_update(None, &[PortForward::new(Protocol::Tcp, 8080, 80)]));
    }

    #[test]
    fn test_identical_list_is_skipped() {
        let list = vec![
            PortForward::new(Protocol::Tcp, 8080, 80),
            PortForward::new(Protocol::Udp, 53, 53),
        ];

        assert!(!needs_update(Some(&list), &list));
    }

    #[test]
    fn test_changed_or_reordered_list_applies() {
        let a = PortForward::new(Protocol::Tcp, 8080, 80);
        let b = PortForward::new(Protocol::Udp, 53, 53);

        assert!(needs_update(Some(&[a.clone(), b.clone()]), &[b.clone(), a.clone()]));
        assert!(needs_update(Some(&[a.clone()]), &[a, b]));
    }
}

//! Box workload specification as delivered by the control plane.

use std::{collections::HashMap, net::Ipv4Addr};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{EnvPair, PortForward};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a box should run and how it is reachable.
///
/// Every field has a default, so an empty spec is valid and runs the
/// machine's infra image with no forwards.
#[derive(Debug, Default, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct BoxSpec {
    /// The image to run; the machine's infra image when unset.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(super) image: Option<String>,

    /// The command run in the container; the image's default when empty.
    #[serde(default)]
    #[builder(default)]
    pub(super) command: Vec<String>,

    /// The environment variables set in the container.
    #[serde(default)]
    #[builder(default)]
    pub(super) envs: Vec<EnvPair>,

    /// The host ports forwarded into the box.
    #[serde(default)]
    #[builder(default)]
    pub(super) port_forwards: Vec<PortForward>,

    /// Names the sandbox DNS proxy answers directly, mapped to addresses.
    #[serde(default)]
    #[builder(default)]
    pub(super) dns_overrides: HashMap<String, Ipv4Addr>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BoxSpec {
    /// The image reference to run, with the machine fallback applied.
    pub fn image_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.image.as_deref().unwrap_or(fallback)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_spec_parses() -> anyhow::Result<()> {
        let spec: BoxSpec = serde_yaml::from_str(
            r#"
image: library/alpine:3.20
command: ["sleep", "infinity"]
envs:
  - APP_ENV=prod
port_forwards:
  - tcp/8080:80
  - udp/5353:53
dns_overrides:
  peer.internal: 10.115.0.6
"#,
        )?;

        assert_eq!(spec.get_image().as_deref(), Some("library/alpine:3.20"));
        assert_eq!(spec.get_command(), &["sleep", "infinity"]);
        assert_eq!(spec.get_envs().len(), 1);
        assert_eq!(spec.get_port_forwards().len(), 2);
        assert_eq!(
            spec.get_dns_overrides().get("peer.internal"),
            Some(&"10.115.0.6".parse()?)
        );

        Ok(())
    }

    #[test]
    fn test_empty_spec_is_valid() -> anyhow::Result<()> {
        let spec: BoxSpec = serde_yaml::from_str("{}")?;

        assert_eq!(spec, BoxSpec::default());
        assert_eq!(spec.image_or("boxfleet/infra:latest"), "boxfleet/infra:latest");

        Ok(())
    }

    #[test]
    fn test_image_fallback_only_applies_when_unset() {
        let spec = BoxSpec::builder().image(Some("app:1".to_string())).build();
        assert_eq!(spec.image_or("infra:latest"), "app:1");
    }
}

use std::{fmt, str::FromStr};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::BoxfleetError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A declarative port forward from the host into a sandbox.
///
/// ## Format
/// The textual form is `proto/host[-hostEnd]:target[@destCidr]`:
/// - `tcp/8080:80` - host TCP port 8080 forwards to sandbox port 80
/// - `udp/53:53` - host UDP port 53 forwards to sandbox port 53
/// - `tcp/8000-8010:9000` - host ports 8000..=8010 forward to 9000..=9010
/// - `tcp/443:8443@203.0.113.0/24` - only traffic addressed to that
///   destination network is forwarded
///
/// ## Examples
///
/// ```
/// use boxfleet::config::PortForward;
///
/// let single = "tcp/8080:80".parse::<PortForward>().unwrap();
/// assert_eq!(single.get_host_start(), 8080);
/// assert_eq!(single.get_target(), 80);
///
/// let range = "tcp/8000-8010:9000".parse::<PortForward>().unwrap();
/// assert_eq!(range.target_end(), 9010);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    protocol: Protocol,
    host_start: u16,
    host_end: u16,
    target: u16,
    dest: Option<Ipv4Network>,
}

/// The transport protocol of a port forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TCP.
    Tcp,

    /// UDP.
    Udp,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PortForward {
    /// Creates a forward of a single host port.
    pub fn new(protocol: Protocol, host: u16, target: u16) -> Self {
        Self {
            protocol,
            host_start: host,
            host_end: host,
            target,
            dest: None,
        }
    }

    /// Creates a forward of an inclusive host port range.
    pub fn range(
        protocol: Protocol,
        host_start: u16,
        host_end: u16,
        target: u16,
    ) -> Result<Self, BoxfleetError> {
        let forward = Self {
            protocol,
            host_start,
            host_end,
            target,
            dest: None,
        };
        forward.validate()?;
        Ok(forward)
    }

    /// Restricts the forward to traffic addressed to `dest`.
    pub fn with_dest(mut self, dest: Ipv4Network) -> Self {
        self.dest = Some(dest);
        self
    }

    /// Returns the protocol.
    pub fn get_protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns the first host port.
    pub fn get_host_start(&self) -> u16 {
        self.host_start
    }

    /// Returns the last host port (equal to the first for a single-port forward).
    pub fn get_host_end(&self) -> u16 {
        self.host_end
    }

    /// Returns the first target port.
    pub fn get_target(&self) -> u16 {
        self.target
    }

    /// Returns the optional destination filter.
    pub fn get_dest(&self) -> Option<Ipv4Network> {
        self.dest
    }

    /// Whether this forward covers a range of host ports.
    pub fn is_range(&self) -> bool {
        self.host_end > self.host_start
    }

    /// Returns the last target port, offset to match the host range.
    pub fn target_end(&self) -> u16 {
        self.target + (self.host_end - self.host_start)
    }

    fn validate(&self) -> Result<(), BoxfleetError> {
        if self.host_end < self.host_start {
            return Err(BoxfleetError::InvalidPortForward(format!(
                "host range {}-{} is reversed",
                self.host_start, self.host_end
            )));
        }
        if self
            .target
            .checked_add(self.host_end - self.host_start)
            .is_none()
        {
            return Err(BoxfleetError::InvalidPortForward(format!(
                "target range starting at {} overflows",
                self.target
            )));
        }
        Ok(())
    }
}

impl Protocol {
    /// The protocol name as iptables expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Protocol {
    type Err = BoxfleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(BoxfleetError::InvalidPortForward(format!(
                "unknown protocol: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PortForward {
    type Err = BoxfleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BoxfleetError::InvalidPortForward(s.to_string());

        let (proto, rest) = s.split_once('/').ok_or_else(invalid)?;
        let protocol = proto.parse::<Protocol>()?;

        let (ports, dest) = match rest.split_once('@') {
            Some((ports, dest)) => {
                let dest = dest.parse::<Ipv4Network>().map_err(|_| invalid())?;
                (ports, Some(dest))
            }
            None => (rest, None),
        };

        let (host, target) = ports.split_once(':').ok_or_else(invalid)?;
        let target = target.parse::<u16>().map_err(|_| invalid())?;

        let (host_start, host_end) = match host.split_once('-') {
            Some((start, end)) => (
                start.parse::<u16>().map_err(|_| invalid())?,
                end.parse::<u16>().map_err(|_| invalid())?,
            ),
            None => {
                let port = host.parse::<u16>().map_err(|_| invalid())?;
                (port, port)
            }
        };

        let forward = Self {
            protocol,
            host_start,
            host_end,
            target,
            dest,
        };
        forward.validate()?;
        Ok(forward)
    }
}

impl fmt::Display for PortForward {
    /// Formats the forward in its `proto/host[-hostEnd]:target[@destCidr]` form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.protocol)?;
        if self.is_range() {
            write!(f, "{}-{}", self.host_start, self.host_end)?;
        } else {
            write!(f, "{}", self.host_start)?;
        }
        write!(f, ":{}", self.target)?;
        if let Some(dest) = self.dest {
            write!(f, "@{}", dest)?;
        }
        Ok(())
    }
}

impl Serialize for PortForward {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PortForward {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_forward_from_str() {
        assert_eq!(
            "tcp/8080:80".parse::<PortForward>().unwrap(),
            PortForward::new(Protocol::Tcp, 8080, 80)
        );
        assert_eq!(
            "udp/53:53".parse::<PortForward>().unwrap(),
            PortForward::new(Protocol::Udp, 53, 53)
        );
        assert_eq!(
            "tcp/8000-8010:9000".parse::<PortForward>().unwrap(),
            PortForward::range(Protocol::Tcp, 8000, 8010, 9000).unwrap()
        );
        assert_eq!(
            "tcp/443:8443@203.0.113.0/24".parse::<PortForward>().unwrap(),
            PortForward::new(Protocol::Tcp, 443, 8443)
                .with_dest("203.0.113.0/24".parse().unwrap())
        );

        // Invalid formats.
        assert!("".parse::<PortForward>().is_err());
        assert!("tcp".parse::<PortForward>().is_err());
        assert!("tcp/8080".parse::<PortForward>().is_err());
        assert!("icmp/1:1".parse::<PortForward>().is_err());
        assert!("tcp/8080:nope".parse::<PortForward>().is_err());
        assert!("tcp/9000-8000:80".parse::<PortForward>().is_err());
        assert!("tcp/1-100:65500".parse::<PortForward>().is_err());
        assert!("tcp/443:80@notacidr".parse::<PortForward>().is_err());
    }

    #[test]
    fn test_port_forward_display_round_trip() {
        for text in [
            "tcp/8080:80",
            "udp/53:53",
            "tcp/8000-8010:9000",
            "tcp/443:8443@203.0.113.0/24",
        ] {
            let forward = text.parse::<PortForward>().unwrap();
            assert_eq!(forward.to_string(), text);
        }
    }

    #[test]
    fn test_target_range_tracks_host_range() {
        let forward = "tcp/8000-8010:9000".parse::<PortForward>().unwrap();
        assert!(forward.is_range());
        assert_eq!(forward.get_target(), 9000);
        assert_eq!(forward.target_end(), 9010);

        let single = "tcp/8080:80".parse::<PortForward>().unwrap();
        assert!(!single.is_range());
        assert_eq!(single.target_end(), 80);
    }

    #[test]
    fn test_serde_uses_textual_form() {
        let forward = "tcp/8080:80".parse::<PortForward>().unwrap();
        let json = serde_json::to_string(&forward).unwrap();
        assert_eq!(json, r#""tcp/8080:80""#);

        let back: PortForward = serde_json::from_str(&json).unwrap();
        assert_eq!(back, forward);
    }
}

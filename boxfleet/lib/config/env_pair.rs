use std::{fmt, str::FromStr};

use getset::Getters;
use serde::{Deserialize, Serialize};

use crate::BoxfleetError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An environment variable pair set inside a box's container.
///
/// The textual form is `VAR=VALUE`; an empty value is allowed, an empty
/// variable name is not.
///
/// ## Examples
///
/// ```
/// use boxfleet::config::EnvPair;
/// use std::str::FromStr;
///
/// let env_pair = EnvPair::new("PATH", "/usr/local/bin:/usr/bin");
/// assert_eq!(env_pair.get_var(), "PATH");
/// assert_eq!(env_pair.get_value(), "/usr/local/bin:/usr/bin");
///
/// let env_pair = EnvPair::from_str("USER=alice").unwrap();
/// assert_eq!(env_pair.get_var(), "USER");
/// assert_eq!(env_pair.get_value(), "alice");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct EnvPair {
    /// The environment variable name.
    var: String,

    /// The value of the environment variable.
    value: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EnvPair {
    /// Creates a new `EnvPair` with the given variable name and value.
    pub fn new<S: Into<String>>(var: S, value: S) -> Self {
        Self {
            var: var.into(),
            value: value.into(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for EnvPair {
    type Err = BoxfleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (var, value) = s
            .split_once('=')
            .ok_or_else(|| BoxfleetError::InvalidEnvPair(s.to_string()))?;

        if var.is_empty() {
            return Err(BoxfleetError::InvalidEnvPair(s.to_string()));
        }

        Ok(Self::new(var, value))
    }
}

impl fmt::Display for EnvPair {
    /// Formats the environment variable pair following the format "<var>=<value>".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.var, self.value)
    }
}

impl Serialize for EnvPair {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EnvPair {
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
    fn test_env_pair_from_str() -> anyhow::Result<()> {
        let env_pair: EnvPair = "VAR=VALUE".parse()?;
        assert_eq!(env_pair.var, String::from("VAR"));
        assert_eq!(env_pair.value, String::from("VALUE"));

        let env_pair: EnvPair = "VAR=".parse()?;
        assert_eq!(env_pair.var, String::from("VAR"));
        assert_eq!(env_pair.value, String::from(""));

        assert!("VAR".parse::<EnvPair>().is_err());
        assert!("=VALUE".parse::<EnvPair>().is_err());

        Ok(())
    }

    #[test]
    fn test_env_pair_display() {
        let env_pair = EnvPair::new("VAR", "VALUE");
        assert_eq!(env_pair.to_string(), "VAR=VALUE");

        let env_pair = EnvPair::new("VAR", "");
        assert_eq!(env_pair.to_string(), "VAR=");
    }

    #[test]
    fn test_env_pair_serialize_deserialize() -> anyhow::Result<()> {
        let env_pair = EnvPair::new("VAR", "VALUE");
        let serialized = serde_json::to_string(&env_pair)?;
        assert_eq!(serialized, "\"VAR=VALUE\"");

        let deserialized: EnvPair = serde_json::from_str(&serialized)?;
        assert_eq!(deserialized, env_pair);

        Ok(())
    }

    #[test]
    fn test_env_pair_value_may_contain_equals() -> anyhow::Result<()> {
        let env_pair: EnvPair = "JAVA_OPTS=-Xmx512m -Dkey=value".parse()?;
        assert_eq!(env_pair.get_var(), "JAVA_OPTS");
        assert_eq!(env_pair.get_value(), "-Xmx512m -Dkey=value");

        Ok(())
    }
}

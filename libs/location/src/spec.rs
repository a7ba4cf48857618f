//! Textual location specs.
//!
//! Grammar:
//!
//! ```text
//! cloud:<poolId>
//! cloud:<poolId>:(name="...",displayName="...")
//! cloud:<poolId>:<machineId>
//! cloud:<poolId>:<machineId>:(name="...",displayName="...")
//! ```
//!
//! IDs are alphanumeric tokens. The scheme may be written `cloud` or `CLOUD`.
//! Argument values may be bare or double-quoted; only `name` and
//! `displayName` are accepted and neither may be empty.

use std::fmt;
use std::str::FromStr;

use cloudpool_id::{MachineId, PoolId};

use crate::error::SpecError;

/// Spec scheme prefix.
pub const SCHEME: &str = "cloud";

/// Argument keys accepted in the argument block.
pub const ACCEPTABLE_ARGS: [&str; 2] = ["name", "displayName"];

/// Optional overrides carried in a spec's argument block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecArgs {
    pub name: Option<String>,
    pub display_name: Option<String>,
}

impl SpecArgs {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.display_name.is_none()
    }
}

/// A parsed location spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationSpec {
    pub pool_id: PoolId,
    pub machine_id: Option<MachineId>,
    pub args: SpecArgs,
}

impl LocationSpec {
    /// Spec for a pool-level location.
    pub fn pool(pool_id: PoolId) -> Self {
        Self {
            pool_id,
            machine_id: None,
            args: SpecArgs::default(),
        }
    }

    /// Spec for a machine-level location.
    pub fn machine(pool_id: PoolId, machine_id: MachineId) -> Self {
        Self {
            pool_id,
            machine_id: Some(machine_id),
            args: SpecArgs::default(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.args.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.args.display_name = Some(display_name.into());
        self
    }

    /// Parse a spec string.
    pub fn parse(text: &str) -> Result<Self, SpecError> {
        let malformed = |reason: String| SpecError::Malformed {
            spec: text.to_string(),
            reason,
        };

        let Some((scheme, rest)) = text.split_once(':') else {
            return Err(malformed("expected something like cloud:poolId or cloud:poolId:(name=abc)".to_string()));
        };
        if scheme != SCHEME && scheme != SCHEME.to_ascii_uppercase() {
            return Err(malformed(format!("unsupported scheme '{scheme}'")));
        }

        // IDs never contain '(' so the first ":(" opens the argument block.
        let (ids, block) = match rest.find(":(") {
            Some(idx) => {
                let Some(inner) = rest[idx + 2..].strip_suffix(')') else {
                    return Err(malformed("unterminated argument block".to_string()));
                };
                (&rest[..idx], Some(inner))
            }
            None => (rest, None),
        };

        let (pool_part, machine_part) = match ids.split_once(':') {
            Some((pool, machine)) => (pool, Some(machine)),
            None => (ids, None),
        };

        let pool_id = PoolId::parse(pool_part).map_err(|e| malformed(format!("pool id: {e}")))?;
        let machine_id = machine_part
            .map(|m| MachineId::parse(m).map_err(|e| malformed(format!("machine id: {e}"))))
            .transpose()?;

        let args = match block {
            Some(inner) => parse_args(inner).map_err(|reason| SpecError::InvalidArgument {
                spec: text.to_string(),
                reason,
            })?,
            None => SpecArgs::default(),
        };

        Ok(Self {
            pool_id,
            machine_id,
            args,
        })
    }

    /// Location name used when `name` is not given.
    pub fn default_name(&self) -> String {
        match &self.machine_id {
            None => format!("{SCHEME}-{}", self.pool_id),
            Some(machine_id) => format!("{SCHEME}-{}-{}", self.pool_id, machine_id),
        }
    }

    /// Display name used when `displayName` is not given.
    pub fn default_display_name(&self) -> String {
        match &self.machine_id {
            None => format!("Cloud Environment {}", self.pool_id),
            Some(machine_id) => format!("Cloud Machine {machine_id}"),
        }
    }

    /// Effective location name.
    pub fn location_name(&self) -> String {
        self.args.name.clone().unwrap_or_else(|| self.default_name())
    }

    /// Effective display name.
    pub fn display_name(&self) -> String {
        self.args
            .display_name
            .clone()
            .unwrap_or_else(|| self.default_display_name())
    }

    pub fn is_machine(&self) -> bool {
        self.machine_id.is_some()
    }
}

impl fmt::Display for LocationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}:{}", self.pool_id)?;
        if let Some(machine_id) = &self.machine_id {
            write!(f, ":{machine_id}")?;
        }
        if !self.args.is_empty() {
            let mut pairs = Vec::new();
            if let Some(name) = &self.args.name {
                pairs.push(format!("name=\"{name}\""));
            }
            if let Some(display_name) = &self.args.display_name {
                pairs.push(format!("displayName=\"{display_name}\""));
            }
            write!(f, ":({})", pairs.join(","))?;
        }
        Ok(())
    }
}

impl FromStr for LocationSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for LocationSpec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for LocationSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse the inside of an argument block: `key=value` pairs separated by
/// commas that are not inside double quotes.
fn parse_args(inner: &str) -> Result<SpecArgs, String> {
    let mut args = SpecArgs::default();

    for pair in split_unquoted(inner) {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key.trim(), unquote(value.trim())),
            None => (pair, ""),
        };

        let slot = match key {
            "name" => &mut args.name,
            "displayName" => &mut args.display_name,
            other => {
                return Err(format!(
                    "illegal arg '{other}'; acceptable args are {ACCEPTABLE_ARGS:?}"
                ))
            }
        };
        if value.is_empty() {
            return Err(format!("if {key} supplied then value must be non-empty"));
        }
        if slot.is_some() {
            return Err(format!("duplicate arg '{key}'"));
        }
        *slot = Some(value.to_string());
    }

    Ok(args)
}

fn split_unquoted(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

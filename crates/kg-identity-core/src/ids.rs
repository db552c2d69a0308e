use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::KernelError;

pub const DEFAULT_NAMESPACE: &str = "https://kg.ebrains.eu/api/instances/";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Native,
    InProgress,
    Released,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Self::Native, Self::InProgress, Self::Released];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::InProgress => "in_progress",
            Self::Released => "released",
        }
    }

    /// Accepts both the snake case and the upper case spelling (`IN_PROGRESS`).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "native" => Some(Self::Native),
            "in_progress" | "inprogress" => Some(Self::InProgress),
            "released" => Some(Self::Released),
            _ => None,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
            .ok_or_else(|| KernelError::Validation(format!("unknown stage: {value}")))
    }
}

/// Name of a space. Stored in a normalized form: lowercase, with `_` replaced by `-`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct SpaceName(String);

impl SpaceName {
    /// Normalize and validate a space name.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the name is blank or contains `/` or whitespace.
    pub fn new(name: &str) -> Result<Self, KernelError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(KernelError::Validation("space name must be non-empty".to_string()));
        }
        if trimmed.contains('/') || trimmed.chars().any(char::is_whitespace) {
            return Err(KernelError::Validation(format!(
                "space name must not contain '/' or whitespace: {trimmed}"
            )));
        }
        Ok(Self(trimmed.to_lowercase().replace('_', "-")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SpaceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SpaceName {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::new(value)
    }
}

impl TryFrom<String> for SpaceName {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<SpaceName> for String {
    fn from(value: SpaceName) -> Self {
        value.0
    }
}

/// Prefix that turns an instance UUID into its absolute identifier.
///
/// The absolute identifier is always `namespace + lowercase uuid`, so other
/// systems can recognize internal ids without a lookup.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct IdNamespace {
    prefix: String,
}

impl IdNamespace {
    /// # Errors
    /// Returns [`KernelError::Validation`] when the prefix is blank.
    pub fn new(prefix: &str) -> Result<Self, KernelError> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(KernelError::Validation("id namespace must be non-empty".to_string()));
        }
        Ok(Self { prefix: prefix.to_lowercase() })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn absolute_id(&self, id: Uuid) -> String {
        format!("{}{}", self.prefix, id.hyphenated())
    }

    /// Recover the instance UUID from an absolute identifier of this namespace.
    #[must_use]
    pub fn uuid_of(&self, absolute_id: &str) -> Option<Uuid> {
        let lower = absolute_id.to_lowercase();
        let rest = lower.strip_prefix(&self.prefix)?;
        Uuid::parse_str(rest).ok()
    }

    #[must_use]
    pub fn is_internal(&self, absolute_id: &str) -> bool {
        self.uuid_of(absolute_id).is_some()
    }
}

impl Default for IdNamespace {
    fn default() -> Self {
        Self { prefix: DEFAULT_NAMESPACE.to_string() }
    }
}

use std::fmt;
use std::str::FromStr;

/// Suffix every canonical state id carries.
pub const STATE_SUFFIX: &str = ".tfstate";
/// Key namespace for state blobs.
pub const STATES_PREFIX: &str = "states/";
/// Key namespace for lock records.
pub const LOCKS_PREFIX: &str = "locks/";

/// Canonical name of one Terraform state.
///
/// Ids match `[a-zA-Z0-9][a-zA-Z0-9_.-]*` and always end in `.tfstate`, so
/// `prod` and `prod.tfstate` name the same state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidStateId(String);

impl fmt::Display for InvalidStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid state id: '{}'", self.0)
    }
}

impl std::error::Error for InvalidStateId {}

/// Checks the raw id against the allowed character set.
pub fn is_valid_state_id(raw: &str) -> bool {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl StateId {
    pub fn parse(raw: &str) -> Result<Self, InvalidStateId> {
        if !is_valid_state_id(raw) {
            return Err(InvalidStateId(raw.to_string()));
        }
        if raw.ends_with(STATE_SUFFIX) {
            Ok(Self(raw.to_string()))
        } else {
            Ok(Self(format!("{raw}{STATE_SUFFIX}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the state blob, `states/<id>`.
    pub fn state_key(&self) -> String {
        format!("{STATES_PREFIX}{}", self.0)
    }

    /// Key of the lock record, `locks/<id>`.
    pub fn lock_key(&self) -> String {
        format!("{LOCKS_PREFIX}{}", self.0)
    }
}

impl FromStr for StateId {
    type Err = InvalidStateId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Per-run token handed to the registry inside the health-check URL.
///
/// Only a checker that learned the token from this instance's registration can produce a
/// matching health check, so a stale registration pointing at a reused address fails instead
/// of validating whatever now listens there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity(Uuid);

impl Identity {
    pub fn new() -> Self {
        Identity(Uuid::new_v4())
    }

    /// True if `token` parses as a UUID equal to this identity. Surrounding whitespace makes
    /// the token invalid.
    pub fn matches(&self, token: &str) -> bool {
        Uuid::parse_str(token).is_ok_and(|candidate| candidate == self.0)
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for Identity {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Identity)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

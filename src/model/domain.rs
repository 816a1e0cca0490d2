use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain an organization operates in. Selects terminology and the default
/// presence states.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Domain {
    Education,
    Hospitality,
    Events,
    Corporate,
    /// A domain with no built-in default states
    Other(String),
}

impl Domain {
    pub fn as_str(&self) -> &str {
        match self {
            Domain::Education => "education",
            Domain::Hospitality => "hospitality",
            Domain::Events => "events",
            Domain::Corporate => "corporate",
            Domain::Other(tag) => tag,
        }
    }
}

impl From<String> for Domain {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "education" => Domain::Education,
            "hospitality" => Domain::Hospitality,
            "events" => Domain::Events,
            "corporate" => Domain::Corporate,
            _ => Domain::Other(tag),
        }
    }
}

impl From<&str> for Domain {
    fn from(tag: &str) -> Self {
        Domain::from(tag.to_string())
    }
}

impl From<Domain> for String {
    fn from(domain: Domain) -> Self {
        domain.as_str().to_string()
    }
}

impl FromStr for Domain {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Domain::from(s))
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

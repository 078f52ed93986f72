use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SibError;

/// Which decrypted fields a search pattern is matched against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Match against field 1 only (usually the entry title)
    #[default]
    First,
    /// Match against every field of the record
    All,
}

impl SearchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchMode::First => "first",
            SearchMode::All => "all",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = SibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(SearchMode::First),
            "all" => Ok(SearchMode::All),
            other => Err(SibError::InvalidValue {
                field: "search_mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Result of a CONFIGURATION exchange, carried on the wire as `OK;<code>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigOutcome {
    /// The account already used this cipher suite
    Unchanged,
    /// The suite was installed (new account) or every record was migrated to it
    Installed,
}

impl ConfigOutcome {
    pub fn code(self) -> u8 {
        match self {
            ConfigOutcome::Unchanged => 1,
            ConfigOutcome::Installed => 2,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "1" => Some(ConfigOutcome::Unchanged),
            "2" => Some(ConfigOutcome::Installed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_mode_parse() {
        assert_eq!("first".parse::<SearchMode>().unwrap(), SearchMode::First);
        assert_eq!("all".parse::<SearchMode>().unwrap(), SearchMode::All);
        assert!("ALL".parse::<SearchMode>().is_err());
    }

    #[test]
    fn test_config_outcome_codes() {
        for outcome in [ConfigOutcome::Unchanged, ConfigOutcome::Installed] {
            let code = outcome.code().to_string();
            assert_eq!(ConfigOutcome::from_code(&code), Some(outcome));
        }
        assert_eq!(ConfigOutcome::from_code("3"), None);
    }
}

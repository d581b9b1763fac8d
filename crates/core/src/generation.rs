//! Typed configuration generation, parsed once from Revision labels.

use std::collections::BTreeMap;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use crate::labels;

/// Position of a Revision in its Configuration's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ConfigGeneration(pub i64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("label {} is missing", labels::CONFIGURATION_GENERATION)]
    Missing,
    #[error("label {} has malformed value {value:?}: {source}", labels::CONFIGURATION_GENERATION)]
    Malformed { value: String, source: ParseIntError },
}

impl ConfigGeneration {
    /// Read the generation label from an object's labels.
    pub fn from_labels(map: Option<&BTreeMap<String, String>>) -> Result<Self, GenerationError> {
        let value = map
            .and_then(|l| l.get(labels::CONFIGURATION_GENERATION))
            .ok_or(GenerationError::Missing)?;
        value.parse()
    }

    /// Generation of a Revision, from its metadata labels.
    pub fn of(revision: &crate::Revision) -> Result<Self, GenerationError> {
        Self::from_labels(revision.metadata.labels.as_ref())
    }
}

impl FromStr for ConfigGeneration {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>()
            .map(ConfigGeneration)
            .map_err(|source| GenerationError::Malformed { value: s.to_string(), source })
    }
}

impl fmt::Display for ConfigGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

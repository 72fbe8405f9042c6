//! Module revision handling
//!
//! YANG modules are versioned by revision dates (`2019-03-01`), not semver.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const REVISION_FORMAT: &str = "%Y-%m-%d";

/// A module revision date
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(NaiveDate);

impl Revision {
    /// Create a revision from a calendar date
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Parse a `YYYY-MM-DD` revision string
    pub fn parse(revision: &str) -> Result<Self, chrono::ParseError> {
        NaiveDate::parse_from_str(revision.trim(), REVISION_FORMAT).map(Self)
    }

    /// The underlying date
    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// File stem used for revisioned schema files (`name@2019-03-01`)
    pub fn file_stem(&self, module: &str) -> String {
        format!("{}@{}", module, self)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(REVISION_FORMAT))
    }
}

impl FromStr for Revision {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

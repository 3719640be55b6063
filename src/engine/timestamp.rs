// Copyright © 2024 Pathway

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Logical time of a batch.
///
/// Every logical time is processed in two ordered sub-steps. The original
/// one carries the data; the retraction one carries retractions produced by
/// forgetting operators, so that consumers can tell them apart from
/// ordinary deletions.
#[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub time: u64,
    pub retraction: bool,
}

impl Timestamp {
    pub const MIN: Self = Self::original(0);
    pub const MAX: Self = Self::retraction(u64::MAX);

    pub const fn original(time: u64) -> Self {
        Self {
            time,
            retraction: false,
        }
    }

    pub const fn retraction(time: u64) -> Self {
        Self {
            time,
            retraction: true,
        }
    }

    pub fn is_original(&self) -> bool {
        !self.retraction
    }
}

impl From<u64> for Timestamp {
    fn from(time: u64) -> Self {
        Self::original(time)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.retraction {
            write!(f, "{}~", self.time)
        } else {
            self.time.fmt(f)
        }
    }
}

impl FromStr for Timestamp {
    type Err = <u64 as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_suffix('~') {
            Some(time) => Ok(Self::retraction(time.parse()?)),
            None => Ok(Self::original(s.parse()?)),
        }
    }
}

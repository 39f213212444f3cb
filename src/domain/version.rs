use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic version of a revision (spec §3: `{major, minor, patch, revision, tag}`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub revision: u32,
    pub tag: String,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}-{}",
            self.major, self.minor, self.patch, self.revision, self.tag
        )
    }
}

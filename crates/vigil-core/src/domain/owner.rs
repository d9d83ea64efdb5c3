//! Owner identity.
//!
//! How an identity was established (session, OIDC, none) is not this crate's
//! business: callers hand over an optional identity string and get an `Owner`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const ANONYMOUS: &str = "anonymous";
const MAX_SEGMENT_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Owner(String);

impl Owner {
    pub fn new(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        if identity.trim().is_empty() {
            Self::anonymous()
        } else {
            Self(identity)
        }
    }

    /// The sentinel used when no identity was resolved.
    pub fn anonymous() -> Self {
        Self(ANONYMOUS.to_string())
    }

    /// Map an optional resolved identity to an owner.
    pub fn resolve(identity: Option<&str>) -> Self {
        identity.map(Self::new).unwrap_or_else(Self::anonymous)
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe directory name for this owner's artifacts.
    ///
    /// Keeps `[A-Za-z0-9._@-]`, replaces everything else with `-`, collapses
    /// `..`, trims separators and caps the length. An identity with nothing
    /// left after that falls back to a short SHA-256 prefix.
    pub fn storage_segment(&self) -> String {
        let replaced: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@') {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        let mut safe = replaced;
        while safe.contains("..") {
            safe = safe.replace("..", "-");
        }
        let safe = safe.trim_matches(|c| matches!(c, '-' | '_' | '.'));

        if safe.is_empty() {
            let digest = Sha256::digest(self.0.as_bytes());
            return hex::encode(&digest[..8]);
        }

        safe.chars().take(MAX_SEGMENT_LEN).collect()
    }
}

impl Default for Owner {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

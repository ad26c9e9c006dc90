//! Protocol revisions and version negotiation.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A STOMP protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StompVersion {
    V1_0,
    V1_1,
    V1_2,
}

/// Every revision this implementation speaks, oldest first.
pub const SUPPORTED_VERSIONS: [StompVersion; 3] =
    [StompVersion::V1_0, StompVersion::V1_1, StompVersion::V1_2];

impl StompVersion {
    /// The oldest revision, used when a client does not negotiate.
    pub const OLDEST: StompVersion = StompVersion::V1_0;

    pub fn as_str(&self) -> &'static str {
        match self {
            StompVersion::V1_0 => "1.0",
            StompVersion::V1_1 => "1.1",
            StompVersion::V1_2 => "1.2",
        }
    }

    /// Returns whether this revision addresses ACK/NACK with a combined `id` header.
    pub fn uses_combined_ack_id(&self) -> bool {
        *self >= StompVersion::V1_2
    }

    /// Returns whether NACK is accepted at this revision.
    pub fn supports_nack(&self) -> bool {
        *self >= StompVersion::V1_2
    }
}

impl fmt::Display for StompVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StompVersion {
    type Err = UnsupportedVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.0" => Ok(StompVersion::V1_0),
            "1.1" => Ok(StompVersion::V1_1),
            "1.2" => Ok(StompVersion::V1_2),
            other => Err(UnsupportedVersion {
                requested: other.to_string(),
                supported: join_versions(&SUPPORTED_VERSIONS),
            }),
        }
    }
}

/// No overlap between the client's acceptable versions and the server's.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported protocol version(s) '{requested}', supported: {supported}")]
pub struct UnsupportedVersion {
    /// The client's `accept-version` value.
    pub requested: String,
    /// The server's supported versions, comma separated.
    pub supported: String,
}

/// Renders versions as a comma separated header value.
pub fn join_versions(versions: &[StompVersion]) -> String {
    versions
        .iter()
        .map(StompVersion::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Picks the highest version present in both the client's list and `supported`.
///
/// `accept_version` is the raw comma separated header value. A client that
/// sends no list speaks the oldest revision.
pub fn negotiate(
    accept_version: Option<&str>,
    supported: &[StompVersion],
) -> Result<StompVersion, UnsupportedVersion> {
    let mismatch = |requested: &str| UnsupportedVersion {
        requested: requested.to_string(),
        supported: join_versions(supported),
    };

    let Some(accept) = accept_version else {
        return if supported.contains(&StompVersion::OLDEST) {
            Ok(StompVersion::OLDEST)
        } else {
            Err(mismatch(StompVersion::OLDEST.as_str()))
        };
    };

    accept
        .split(',')
        .filter_map(|v| v.parse::<StompVersion>().ok())
        .filter(|v| supported.contains(v))
        .max()
        .ok_or_else(|| mismatch(accept))
}

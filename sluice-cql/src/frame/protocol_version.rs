//! Native protocol versions spoken by the driver.

use std::fmt::Display;

use itertools::Itertools;

/// A native protocol version.
///
/// Besides the open-source versions 3 and 4, the DSE versions are supported.
/// Continuous paging exists only in DSE versions, and only [`ProtocolVersion::DseV2`]
/// lets the client control how many pages the server may send ahead of consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum ProtocolVersion {
    V3,
    V4,
    DseV1,
    DseV2,
}

/// The substring by which servers announce that they refused the proposed version.
pub const UNSUPPORTED_VERSION_MESSAGE: &str = "Invalid or unsupported protocol version";

/// Number of stream ids available on a connection for every supported version
/// (the stream id is a signed 16 bit integer and negative ids are reserved for the server).
pub const MAX_STREAM_IDS: usize = 32768;

impl ProtocolVersion {
    /// All known versions, lowest first.
    pub const ALL: [ProtocolVersion; 4] = [
        ProtocolVersion::V3,
        ProtocolVersion::V4,
        ProtocolVersion::DseV1,
        ProtocolVersion::DseV2,
    ];

    /// The version byte put in the frame header (without the direction bit).
    pub const fn code(self) -> u8 {
        match self {
            ProtocolVersion::V3 => 0x03,
            ProtocolVersion::V4 => 0x04,
            ProtocolVersion::DseV1 => 0x41,
            ProtocolVersion::DseV2 => 0x42,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.code() == code & 0x7F)
    }

    /// Whether QUERY can carry continuous paging options and byte-sized pages.
    pub const fn supports_continuous_paging(self) -> bool {
        matches!(self, ProtocolVersion::DseV1 | ProtocolVersion::DseV2)
    }

    /// Whether the client grants the server credit for further continuous pages
    /// (`next_pages` option and `MORE_CONTINUOUS_PAGES` revisions).
    pub const fn supports_page_credits(self) -> bool {
        matches!(self, ProtocolVersion::DseV2)
    }

    /// QUERY flags are an `[int]` in DSE versions and a `[byte]` otherwise.
    pub const fn uses_int_query_flags(self) -> bool {
        self.supports_continuous_paging()
    }

    /// The next lower version, if any.
    pub fn downgrade(self) -> Option<Self> {
        match self {
            ProtocolVersion::V3 => None,
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::DseV1 => Some(ProtocolVersion::V4),
            ProtocolVersion::DseV2 => Some(ProtocolVersion::DseV1),
        }
    }

    /// Picks the version to retry with after `self` was refused by a server
    /// that announced `supported`: the highest announced version below `self`,
    /// or simply the next lower one when the server announced nothing usable.
    pub fn negotiate_down(self, supported: &[ProtocolVersion]) -> Option<Self> {
        supported
            .iter()
            .copied()
            .filter(|v| *v < self)
            .max()
            .or_else(|| self.downgrade())
    }

    fn label(self) -> &'static str {
        match self {
            ProtocolVersion::V3 => "v3",
            ProtocolVersion::V4 => "v4",
            ProtocolVersion::DseV1 => "dse_v1",
            ProtocolVersion::DseV2 => "dse_v2",
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Extracts the versions listed in a server's "unsupported protocol version" error,
/// e.g. `Invalid or unsupported protocol version (66); supported versions are (3/v3, 4/v4, 5/v5-beta)`.
///
/// Versions unknown to the driver (like `5/v5-beta` above) are skipped.
pub fn parse_supported_versions(message: &str) -> Vec<ProtocolVersion> {
    let Some(start) = message.find("supported versions are (") else {
        return Vec::new();
    };
    let list = &message[start + "supported versions are (".len()..];
    let list = list.split(')').next().unwrap_or_default();

    list.split(',')
        .filter_map(|entry| entry.trim().split('/').next()?.parse::<u8>().ok())
        .filter_map(ProtocolVersion::from_code)
        .sorted()
        .dedup()
        .collect()
}

/// Renders the server-side refusal message for `requested`, in the format
/// understood by [`parse_supported_versions`].
pub fn unsupported_version_message(requested: u8, supported: &[ProtocolVersion]) -> String {
    let list = supported
        .iter()
        .map(|v| format!("{}/{}", v.code(), v))
        .join(", ");
    format!("{UNSUPPORTED_VERSION_MESSAGE} ({requested}); supported versions are ({list})")
}

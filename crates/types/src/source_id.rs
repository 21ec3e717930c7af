//! Source identifier normalization.
//!
//! Every cache lookup goes through [`SourceId::normalize`] so that two
//! spellings of the same location (query parameters in a different order,
//! duplicated or trailing slashes, percent-encoded characters) land on the
//! same cache entry.

use std::{borrow::Borrow, fmt};

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::Url;

/// Prefixes that mark a source as a full URL rather than a path.
const URL_PREFIXES: &[&str] = &["http://", "https://", "//"];

/// Bytes that stay percent-encoded inside the path so decoding cannot
/// introduce new separators.
const PATH_RESERVED: &[u8] = b"/?#%";

/// Bytes that stay percent-encoded inside query pairs.
const QUERY_RESERVED: &[u8] = b"&#%";

/// Normalized source identifier used as the cache key.
///
/// Values can only be produced by the normalizer, so holding a `SourceId`
/// guarantees the string is already in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    /// Canonicalize a raw source string.
    ///
    /// The protocol/host prefix is kept, the path has its separators
    /// collapsed and trimmed, query pairs are sorted, and percent-encoding
    /// is decoded. The function is idempotent.
    pub fn normalize(raw: &str) -> Self {
        let (path_part, query_part) = match raw.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (raw, None),
        };

        let (prefix, path) = URL_PREFIXES
            .iter()
            .find_map(|prefix| path_part.strip_prefix(prefix).map(|rest| (*prefix, rest)))
            .unwrap_or(("", path_part));

        let path = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");

        let mut normalized = String::with_capacity(raw.len());
        normalized.push_str(prefix);
        normalized.push_str(&decode_component(&path, PATH_RESERVED));

        if let Some(query) = query_part {
            let mut pairs: Vec<String> = query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| decode_component(pair, QUERY_RESERVED))
                .collect();
            pairs.sort();
            if !pairs.is_empty() {
                normalized.push('?');
                normalized.push_str(&pairs.join("&"));
            }
        }

        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` when the identifier carries a protocol or host prefix.
    pub fn is_url(&self) -> bool {
        is_url(&self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SourceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceId {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

impl From<String> for SourceId {
    fn from(raw: String) -> Self {
        Self::normalize(&raw)
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.0
    }
}

/// Returns `true` when `source` starts with `http://`, `https://` or `//`.
pub fn is_url(source: &str) -> bool {
    URL_PREFIXES.iter().any(|prefix| source.starts_with(prefix))
}

/// Expand a raw source into a full URL against `origin` and normalize it.
///
/// Relative sources are joined onto the origin's scheme and authority,
/// protocol-relative sources inherit the origin's scheme (or `https` when no
/// origin is configured). Full URLs are only normalized.
pub fn absolutize(raw: &str, origin: Option<&Url>) -> SourceId {
    if raw.starts_with("//") {
        let scheme = origin.map(Url::scheme).unwrap_or("https");
        return SourceId::normalize(&format!("{scheme}:{raw}"));
    }
    if is_url(raw) {
        return SourceId::normalize(raw);
    }
    match origin.and_then(|origin| origin.host_str().map(|host| (origin, host))) {
        Some((origin, host)) => {
            let authority = match origin.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            SourceId::normalize(&format!("{}://{}/{}", origin.scheme(), authority, raw))
        }
        None => SourceId::normalize(raw),
    }
}

/// Percent-decode `raw`, leaving escapes for `reserved` bytes encoded.
///
/// A bare `%` that does not start a valid escape is emitted as `%25` so the
/// output never contains a `%` that a second pass could reinterpret.
fn decode_component(raw: &str, reserved: &[u8]) -> String {
    let bytes = raw.as_bytes();
    let mut output = String::with_capacity(raw.len());
    let mut run_start = 0;
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] != b'%' {
            index += 1;
            continue;
        }
        match escaped_byte(bytes, index) {
            Some(byte) if !reserved.contains(&byte) => index += 3,
            escaped => {
                output.push_str(&percent_decode_str(&raw[run_start..index]).decode_utf8_lossy());
                match escaped {
                    Some(byte) => {
                        output.push_str(&format!("%{byte:02X}"));
                        index += 3;
                    }
                    None => {
                        output.push_str("%25");
                        index += 1;
                    }
                }
                run_start = index;
            }
        }
    }

    output.push_str(&percent_decode_str(&raw[run_start..]).decode_utf8_lossy());
    output
}

fn escaped_byte(bytes: &[u8], index: usize) -> Option<u8> {
    let high = (*bytes.get(index + 1)? as char).to_digit(16)?;
    let low = (*bytes.get(index + 2)? as char).to_digit(16)?;
    u8::try_from(high * 16 + low).ok()
}

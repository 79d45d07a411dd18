use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const SEPARATOR: char = '/';
const ESCAPE: char = '~';

/// One step into a `Value`: a map key or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_owned())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => f.write_str(key),
            PathSegment::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Errors from decoding an encoded path string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("malformed path {path:?} at byte {position}: {reason}")]
    Malformed {
        path: String,
        position: usize,
        reason: &'static str,
    },
}

/// Location inside a `Value`, as an ordered list of segments.
///
/// The string form is `""` for the root, otherwise each segment is written
/// as `/segment`. Inside keys `~` is written `~0` and `/` is written `~1`.
/// Keys consisting only of ASCII digits carry a leading `~2` so they read
/// back as keys rather than indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path(Vec<PathSegment>);

impl Path {
    /// The empty path, addressing the whole value.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A new path with `segment` appended.
    pub fn child(&self, segment: impl Into<PathSegment>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Split into (parent, last segment). `None` for the root.
    pub fn split_last(&self) -> Option<(&[PathSegment], &PathSegment)> {
        self.0.split_last().map(|(last, parent)| (parent, last))
    }

    /// Encode to the string form.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for segment in &self.0 {
            out.push(SEPARATOR);
            match segment {
                PathSegment::Index(index) => out.push_str(&index.to_string()),
                PathSegment::Key(key) => {
                    if !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit()) {
                        out.push_str("~2");
                    }
                    for ch in key.chars() {
                        match ch {
                            ESCAPE => out.push_str("~0"),
                            SEPARATOR => out.push_str("~1"),
                            other => out.push(other),
                        }
                    }
                }
            }
        }
        out
    }

    /// Decode the string form. Unbalanced or unknown escapes fail fast.
    pub fn decode(encoded: &str) -> Result<Self, PathError> {
        if encoded.is_empty() {
            return Ok(Self::root());
        }
        let malformed = |position: usize, reason: &'static str| PathError::Malformed {
            path: encoded.to_owned(),
            position,
            reason,
        };
        let Some(body) = encoded.strip_prefix(SEPARATOR) else {
            return Err(malformed(0, "path must start with '/'"));
        };

        let mut segments = Vec::new();
        let mut offset = 1;
        for raw in body.split(SEPARATOR) {
            segments.push(decode_segment(raw, offset, &malformed)?);
            offset += raw.len() + 1;
        }
        Ok(Self(segments))
    }
}

fn decode_segment(
    raw: &str,
    offset: usize,
    malformed: &impl Fn(usize, &'static str) -> PathError,
) -> Result<PathSegment, PathError> {
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        if raw.len() > 1 && raw.starts_with('0') {
            return Err(malformed(offset, "index has leading zeros"));
        }
        return raw
            .parse::<usize>()
            .map(PathSegment::Index)
            .map_err(|_| malformed(offset, "index out of range"));
    }

    let mut key = String::with_capacity(raw.len());
    let mut numeric_marker = false;
    let mut chars = raw.char_indices();
    while let Some((i, ch)) = chars.next() {
        if ch != ESCAPE {
            key.push(ch);
            continue;
        }
        match chars.next() {
            Some((_, '0')) => key.push(ESCAPE),
            Some((_, '1')) => key.push(SEPARATOR),
            Some((_, '2')) if i == 0 => numeric_marker = true,
            Some((_, '2')) => return Err(malformed(offset + i, "'~2' only allowed at segment start")),
            Some(_) => return Err(malformed(offset + i, "unknown escape sequence")),
            None => return Err(malformed(offset + i, "dangling escape character")),
        }
    }

    let is_numeric = !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit());
    if numeric_marker != is_numeric {
        return Err(malformed(offset, "'~2' must mark exactly the all-digit keys"));
    }
    Ok(PathSegment::Key(key))
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl From<Vec<PathSegment>> for Path {
    fn from(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Path::decode(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Build a path from keys and indices: `path!["todos", 3usize, "done"]`.
#[macro_export]
macro_rules! path {
    () => { $crate::Path::root() };
    ($($seg:expr),+ $(,)?) => {
        $crate::Path::new(vec![$($crate::PathSegment::from($seg)),+])
    };
}

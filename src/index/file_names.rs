//! Naming of index files.
//!
//! Generations and segment counters are rendered in base 36 so names stay
//! short. Every name produced here parses back through [`IndexFileKind::parse`];
//! the file deleter only ever touches names that parse.

use std::sync::LazyLock;

use regex::Regex;

/// Prefix of commit descriptor files (`segments_<gen>`).
pub const COMMIT_PREFIX: &str = "segments";
/// Prefix of commit files still being written.
pub const PENDING_COMMIT_PREFIX: &str = "pending_segments";
/// Pointer file recording the latest commit generation.
pub const COMMIT_POINTER: &str = "segments.gen";
/// Temporary name of the pointer file while it is rewritten.
pub const COMMIT_POINTER_TMP: &str = "segments.gen.tmp";

/// Extension of a non-compound segment's postings file.
pub const POSTINGS_EXTENSION: &str = "seg";
/// Extension of a non-compound segment's base norms file.
pub const BASE_NORMS_EXTENSION: &str = "nrm";
/// Extension of a compound segment file (postings and base norms together).
pub const COMPOUND_EXTENSION: &str = "cfs";
/// Extension of deletion generation files.
pub const DELETES_EXTENSION: &str = "del";

static COMMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^segments_([0-9a-z]+)$").expect("valid regex"));
static PENDING_COMMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^pending_segments_([0-9a-z]+)$").expect("valid regex"));
static SEGMENT_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(_[0-9a-z]+)\.(seg|nrm|cfs)$").expect("valid regex"));
static DELETES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(_[0-9a-z]+)_([0-9a-z]+)\.del$").expect("valid regex"));
static NORMS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(_[0-9a-z]+)_([0-9a-z]+)\.s([0-9]+)$").expect("valid regex"));

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Render `value` in base 36.
pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    digits.into_iter().map(char::from).collect()
}

/// Parse a base-36 number. Returns `None` on overflow or bad digits.
pub fn from_base36(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    text.chars().try_fold(0u64, |acc, c| {
        let digit = c.to_digit(36)?;
        if c.is_ascii_uppercase() {
            return None;
        }
        acc.checked_mul(36)?.checked_add(digit as u64)
    })
}

/// `segments_<gen>`
pub fn commit_file_name(generation: u64) -> String {
    format!("{COMMIT_PREFIX}_{}", to_base36(generation))
}

/// `pending_segments_<gen>`
pub fn pending_commit_file_name(generation: u64) -> String {
    format!("{PENDING_COMMIT_PREFIX}_{}", to_base36(generation))
}

/// Name of the segment created from counter value `counter`.
pub fn segment_name(counter: u64) -> String {
    format!("_{}", to_base36(counter))
}

/// `<segment>.<extension>`
pub fn segment_file_name(segment: &str, extension: &str) -> String {
    format!("{segment}.{extension}")
}

/// `<segment>_<gen>.del`
pub fn deletes_file_name(segment: &str, generation: u64) -> String {
    format!("{segment}_{}.{DELETES_EXTENSION}", to_base36(generation))
}

/// `<segment>_<gen>.s<field>`
pub fn norms_file_name(segment: &str, field_number: u32, generation: u64) -> String {
    format!("{segment}_{}.s{field_number}", to_base36(generation))
}

/// A recognized index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexFileKind {
    Commit { generation: u64 },
    PendingCommit { generation: u64 },
    CommitPointer,
    CommitPointerTmp,
    SegmentData { segment: String },
    Deletes { segment: String, generation: u64 },
    Norms { segment: String, field_number: u32, generation: u64 },
}

impl IndexFileKind {
    /// Classify `name`, or `None` if it is not an index file.
    pub fn parse(name: &str) -> Option<IndexFileKind> {
        if name == COMMIT_POINTER {
            return Some(IndexFileKind::CommitPointer);
        }
        if name == COMMIT_POINTER_TMP {
            return Some(IndexFileKind::CommitPointerTmp);
        }
        if let Some(caps) = COMMIT_RE.captures(name) {
            return Some(IndexFileKind::Commit {
                generation: from_base36(&caps[1])?,
            });
        }
        if let Some(caps) = PENDING_COMMIT_RE.captures(name) {
            return Some(IndexFileKind::PendingCommit {
                generation: from_base36(&caps[1])?,
            });
        }
        if let Some(caps) = SEGMENT_FILE_RE.captures(name) {
            return Some(IndexFileKind::SegmentData {
                segment: caps[1].to_string(),
            });
        }
        if let Some(caps) = DELETES_RE.captures(name) {
            return Some(IndexFileKind::Deletes {
                segment: caps[1].to_string(),
                generation: from_base36(&caps[2])?,
            });
        }
        if let Some(caps) = NORMS_RE.captures(name) {
            return Some(IndexFileKind::Norms {
                segment: caps[1].to_string(),
                field_number: caps[3].parse().ok()?,
                generation: from_base36(&caps[2])?,
            });
        }
        None
    }

    /// The segment this file belongs to, if any.
    pub fn segment(&self) -> Option<&str> {
        match self {
            IndexFileKind::SegmentData { segment }
            | IndexFileKind::Deletes { segment, .. }
            | IndexFileKind::Norms { segment, .. } => Some(segment),
            _ => None,
        }
    }
}

/// Generation of a `segments_<gen>` file name.
pub fn commit_generation(name: &str) -> Option<u64> {
    match IndexFileKind::parse(name)? {
        IndexFileKind::Commit { generation } => Some(generation),
        _ => None,
    }
}

/// Whether `name` is an index file the deleter may reclaim.
pub fn is_index_file(name: &str) -> bool {
    IndexFileKind::parse(name).is_some()
}

/// Segment counter encoded in a segment name such as `_1z`.
pub fn segment_counter(segment: &str) -> Option<u64> {
    segment.strip_prefix('_').and_then(from_base36)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(from_base36("10"), Some(36));
        assert_eq!(from_base36(&to_base36(u64::MAX)), Some(u64::MAX));
        assert_eq!(from_base36("Z"), None);
        assert_eq!(from_base36(""), None);
        assert_eq!(from_base36("zzzzzzzzzzzzzzzz"), None);
    }

    #[test]
    fn test_names() {
        assert_eq!(commit_file_name(37), "segments_11");
        assert_eq!(pending_commit_file_name(2), "pending_segments_2");
        assert_eq!(segment_name(10), "_a");
        assert_eq!(deletes_file_name("_a", 3), "_a_3.del");
        assert_eq!(norms_file_name("_a", 2, 36), "_a_10.s2");
        assert_eq!(segment_file_name("_a", COMPOUND_EXTENSION), "_a.cfs");
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            IndexFileKind::parse("segments_a"),
            Some(IndexFileKind::Commit { generation: 10 })
        );
        assert_eq!(
            IndexFileKind::parse("pending_segments_1"),
            Some(IndexFileKind::PendingCommit { generation: 1 })
        );
        assert_eq!(IndexFileKind::parse("segments.gen"), Some(IndexFileKind::CommitPointer));
        assert_eq!(
            IndexFileKind::parse("_3.seg"),
            Some(IndexFileKind::SegmentData {
                segment: "_3".to_string()
            })
        );
        assert_eq!(
            IndexFileKind::parse("_3_2.del"),
            Some(IndexFileKind::Deletes {
                segment: "_3".to_string(),
                generation: 2
            })
        );
        assert_eq!(
            IndexFileKind::parse("_3_b.s12"),
            Some(IndexFileKind::Norms {
                segment: "_3".to_string(),
                field_number: 12,
                generation: 11
            })
        );
        assert_eq!(
            IndexFileKind::parse("_3_b.s12").unwrap().segment(),
            Some("_3")
        );
    }

    #[test]
    fn test_foreign_files_are_not_index_files() {
        for name in ["write.lock", "README", "segments", "segments_", "_3.txt", "x_1.del"] {
            assert!(!is_index_file(name), "{name}");
        }
        assert_eq!(commit_generation("segments_z"), Some(35));
        assert_eq!(commit_generation("_1.seg"), None);
        assert_eq!(segment_counter("_1z"), Some(71));
    }
}

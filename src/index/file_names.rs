//! Index file naming
//!
//! - `_N.<ext>`: segment files, `N` is the base 36 segment counter
//! - `_N_G.liv`: deleted docs of segment `_N` at deletion generation `G`
//! - `_N_G.dvd`: doc values updates of segment `_N` at update generation `G`
//! - `segments_G`: commit point of generation `G`
//! - `pending_segments_G`: first phase of a two-phase commit

pub const SEGMENTS: &str = "segments";
pub const PENDING_SEGMENTS: &str = "pending_segments";
pub const LIVE_DOCS_EXTENSION: &str = "liv";
pub const DOC_VALUES_UPDATES_EXTENSION: &str = "dvd";

/// Render a non-negative number in base 36, the way segment names and
/// generations are written
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

pub fn from_base36(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text, 36).ok()
}

/// Segment name for the n-th allocated segment
pub fn segment_name(counter: u64) -> String {
    format!("_{}", to_base36(counter))
}

pub fn segment_file_name(segment: &str, extension: &str) -> String {
    format!("{}.{}", segment, extension)
}

pub fn live_docs_file_name(segment: &str, del_gen: u64) -> String {
    format!("{}_{}.{}", segment, to_base36(del_gen), LIVE_DOCS_EXTENSION)
}

pub fn doc_values_updates_file_name(segment: &str, dv_gen: u64) -> String {
    format!("{}_{}.{}", segment, to_base36(dv_gen), DOC_VALUES_UPDATES_EXTENSION)
}

pub fn segments_file_name(generation: u64) -> String {
    format!("{}_{}", SEGMENTS, to_base36(generation))
}

pub fn pending_segments_file_name(generation: u64) -> String {
    format!("{}_{}", PENDING_SEGMENTS, to_base36(generation))
}

/// Generation of a `segments_G` file name
pub fn parse_generation(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(SEGMENTS)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(from_base36)
}

/// Highest commit generation among `files`
pub fn last_commit_generation<S: AsRef<str>>(files: &[S]) -> Option<u64> {
    files
        .iter()
        .filter_map(|f| parse_generation(f.as_ref()))
        .max()
}

/// Segment a file belongs to, e.g. `_a` for `_a.tim` and `_a_2.liv`
pub fn parse_segment_name(file_name: &str) -> Option<&str> {
    if !file_name.starts_with('_') {
        return None;
    }
    let end = file_name[1..]
        .find(|c| c == '.' || c == '_')
        .map(|i| i + 1)
        .unwrap_or(file_name.len());
    Some(&file_name[..end])
}

/// Files the index owns: segment files and commit points. Anything else
/// (the lock file, foreign files) is never touched by the file deleter.
pub fn is_index_file(file_name: &str) -> bool {
    parse_segment_name(file_name).is_some()
        || parse_generation(file_name).is_some()
        || file_name.starts_with(PENDING_SEGMENTS)
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
        assert_eq!(from_base36(""), None);
        assert_eq!(from_base36("!"), None);
        for v in [1u64, 999, 46_655, u32::MAX as u64] {
            assert_eq!(from_base36(&to_base36(v)), Some(v));
        }
    }

    #[test]
    fn test_commit_file_names() {
        assert_eq!(segments_file_name(1), "segments_1");
        assert_eq!(segments_file_name(36), "segments_10");
        assert_eq!(pending_segments_file_name(2), "pending_segments_2");
        assert_eq!(parse_generation("segments_10"), Some(36));
        assert_eq!(parse_generation("pending_segments_2"), None);
        assert_eq!(parse_generation("segments"), None);
        assert_eq!(
            last_commit_generation(&["segments_2", "_0.tim", "segments_a", "write.lock"]),
            Some(10)
        );
    }

    #[test]
    fn test_segment_file_names() {
        assert_eq!(segment_name(10), "_a");
        assert_eq!(segment_file_name("_a", "tim"), "_a.tim");
        assert_eq!(live_docs_file_name("_a", 2), "_a_2.liv");
        assert_eq!(parse_segment_name("_a.tim"), Some("_a"));
        assert_eq!(parse_segment_name("_a_2.liv"), Some("_a"));
        assert_eq!(doc_values_updates_file_name("_a", 37), "_a_11.dvd");
        assert_eq!(parse_segment_name("_a_11.dvd"), Some("_a"));
        assert_eq!(parse_segment_name("segments_1"), None);
    }

    #[test]
    fn test_index_file_recognition() {
        assert!(is_index_file("_0.pst"));
        assert!(is_index_file("segments_3"));
        assert!(is_index_file("pending_segments_3"));
        assert!(!is_index_file("write.lock"));
        assert!(!is_index_file("notes.txt"));
    }
}

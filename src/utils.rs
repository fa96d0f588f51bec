//! Name and path validation shared by the metadata layer and the commit
//! engine.

/// Matches project/repository names: `^[0-9A-Za-z](?:[-+_0-9A-Za-z.]*[0-9A-Za-z])?$`,
/// hand-rolled rather than pulling in `regex` for a single fixed pattern.
pub fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    if name.ends_with(".removed") {
        return false;
    }
    let is_word = |b: u8| b.is_ascii_alphanumeric();
    let is_mid = |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'+' | b'_' | b'.');

    if !is_word(bytes[0]) {
        return false;
    }
    if bytes.len() == 1 {
        return true;
    }
    if !is_word(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes[1..bytes.len() - 1].iter().all(|&b| is_mid(b))
}

/// Validates an absolute entry path: starts with `/`, contains no `..`
/// segment, and has no empty segments (a single trailing `/` is allowed —
/// it's how a path denotes a directory, not an empty segment).
pub fn is_valid_path(path: &str) -> bool {
    if !path.starts_with('/') {
        return false;
    }
    if path == "/" {
        return true;
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    trimmed.split('/').skip(1).all(|seg| !seg.is_empty() && seg != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(is_valid_name("my-repo"));
        assert!(is_valid_name("a"));
        assert!(is_valid_name("a.b_c+d"));
    }

    #[test]
    fn rejects_bad_names() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("-leading-dash"));
        assert!(!is_valid_name("trailing-dash-"));
        assert!(!is_valid_name("foo.removed"));
        assert!(!is_valid_name("has space"));
    }

    #[test]
    fn path_validation() {
        assert!(is_valid_path("/a/b.json"));
        assert!(!is_valid_path("a/b.json"));
        assert!(!is_valid_path("/a/../b.json"));
        assert!(!is_valid_path("/a//b.json"));
        assert!(is_valid_path("/a/dir/"));
        assert!(is_valid_path("/"));
    }
}

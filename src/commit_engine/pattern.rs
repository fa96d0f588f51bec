//! Path pattern grammar for `find`/`history`: `/**` recursive, `*` matches
//! one segment, `,` separates alternatives, a leading `/` anchors at root
//! and otherwise the pattern is anchored under `/**/`.
//!
//! Hand-rolled rather than pulled in as a glob crate dependency — the
//! grammar is one fixed, fully-specified shape, not worth an external
//! crate for.

/// One compiled alternative: a sequence of segment matchers.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// `*` — exactly one path segment, any content.
    Star,
    /// `**` — zero or more path segments.
    DoubleStar,
    /// A literal segment name.
    Literal(String),
}

#[derive(Debug, Clone)]
pub struct Pattern {
    alternatives: Vec<Vec<Segment>>,
}

impl Pattern {
    pub fn parse(raw: &str) -> Pattern {
        let alternatives = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(compile_one)
            .collect();
        Pattern { alternatives }
    }

    /// Whether `path` (absolute, `/`-separated) matches any alternative.
    pub fn matches(&self, path: &str) -> bool {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        self.alternatives.iter().any(|alt| matches_segments(alt, &segments))
    }
}

fn compile_one(raw: &str) -> Vec<Segment> {
    let anchored = if let Some(stripped) = raw.strip_prefix('/') {
        stripped.to_string()
    } else {
        format!("**/{raw}")
    };
    anchored
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|seg| match seg {
            "**" => Segment::DoubleStar,
            "*" => Segment::Star,
            lit => Segment::Literal(lit.to_string()),
        })
        .collect()
}

fn matches_segments(pattern: &[Segment], path: &[&str]) -> bool {
    match (pattern.first(), path.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(Segment::DoubleStar), _) => {
            // ** matches zero or more segments: try consuming 0, 1, 2, ...
            if matches_segments(&pattern[1..], path) {
                return true;
            }
            if !path.is_empty() {
                return matches_segments(pattern, &path[1..]);
            }
            false
        }
        (Some(_), None) => false,
        (Some(Segment::Star), Some(_)) => matches_segments(&pattern[1..], &path[1..]),
        (Some(Segment::Literal(lit)), Some(seg)) => {
            glob_segment_match(lit, seg) && matches_segments(&pattern[1..], &path[1..])
        }
    }
}

/// Matches one path segment against a literal pattern segment that may
/// itself contain `*` as a partial wildcard (e.g. `*.json`), distinct from
/// a whole-segment `*`/`**` ([`Segment::Star`]/[`Segment::DoubleStar`]).
/// `*` matches any run of characters within the segment; everything else
/// must match literally.
fn glob_segment_match(pattern: &str, text: &str) -> bool {
    fn go(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(b'*'), _) => go(&p[1..], t) || (!t.is_empty() && go(p, &t[1..])),
            (Some(_), None) => false,
            (Some(pc), Some(tc)) => pc == tc && go(&p[1..], &t[1..]),
        }
    }
    go(pattern.as_bytes(), text.as_bytes())
}

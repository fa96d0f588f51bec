//! Unified-diff generation and application for `APPLY_TEXT_PATCH` and for
//! `diff`'s text-entry results. Generation reuses `similar::TextDiff`;
//! application uses `diffy`, which `similar` itself does not provide.

use similar::TextDiff;

use crate::errors::DogmaError;

/// A unified diff turning `old` into `new`, in the standard `---`/`+++`/`@@`
/// format. Empty when the two texts are identical.
pub fn unified_diff(old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header("old", "new")
        .to_string()
}

/// Applies a unified diff to `base`, failing with `ChangeConflict` if the
/// diff's context no longer matches.
pub fn apply_unified_diff(base: &str, diff: &str) -> Result<String, DogmaError> {
    let patch = diffy::Patch::from_str(diff).map_err(|e| DogmaError::ChangeFormat(e.to_string()))?;
    diffy::apply(base, &patch).map_err(|e| DogmaError::ChangeConflict(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_yields_empty_diff() {
        assert_eq!(unified_diff("same\n", "same\n"), "");
    }

    #[test]
    fn diff_then_apply_round_trips() {
        let old = "a\nb\nc\n";
        let new = "a\nx\nc\n";
        let diff = unified_diff(old, new);
        assert!(!diff.is_empty());
        let applied = apply_unified_diff(old, &diff).unwrap();
        assert_eq!(applied, new);
    }

    #[test]
    fn apply_against_mismatched_base_conflicts() {
        let diff = unified_diff("a\nb\nc\n", "a\nx\nc\n");
        let err = apply_unified_diff("a\nDIFFERENT\nc\n", &diff).unwrap_err();
        assert!(matches!(err, DogmaError::ChangeConflict(_)));
    }
}

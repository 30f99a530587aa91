use similar::{Algorithm, TextDiff};
use std::time::Duration;

const CONTEXT_RADIUS: usize = 3;
const DIFF_DEADLINE: Duration = Duration::from_millis(500);

/// Unified diff turning `old` into `new`; empty when the texts are equal.
pub fn unified_patch(old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }
    TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .timeout(DIFF_DEADLINE)
        .diff_lines(old, new)
        .unified_diff()
        .context_radius(CONTEXT_RADIUS)
        .to_string()
}

/// Character-level similarity in `[0, 1]`. Empty input never matches.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let diff = TextDiff::configure()
        .timeout(DIFF_DEADLINE)
        .diff_chars(a, b);
    f64::from(diff.ratio())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_texts_have_empty_patch() {
        assert!(unified_patch("a\nb\n", "a\nb\n").is_empty());
    }

    #[test]
    fn patch_shows_changed_lines() {
        let patch = unified_patch("one\ntwo\nthree\n", "one\n2\nthree\n");
        assert!(patch.contains("@@"));
        assert!(patch.contains("-two"));
        assert!(patch.contains("+2"));
    }

    #[test]
    fn delete_patch_removes_every_line() {
        let patch = unified_patch("x\ny\n", "");
        assert!(patch.contains("-x"));
        assert!(patch.contains("-y"));
        assert!(!patch.contains("\n+x"));
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity("", "abc"), 0.0);
        assert_eq!(similarity("abc", "abc"), 1.0);
        let s = similarity("hello world", "hello wurld");
        assert!(s > 0.8 && s < 1.0);
        assert!(similarity("aaaa", "zzzz") < 0.2);
    }
}

//! Flag pattern matching

use once_cell::sync::Lazy;
use regex::Regex;

static FLAG_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"(?i)flag\{[^}]+\}", r"(?i)CTF\{[^}]+\}"]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

/// Extracts flags from raw workflow output.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagValidator;

impl FlagValidator {
    pub fn new() -> Self {
        Self
    }

    /// First flag of the first pattern that matches anywhere in `content`.
    pub fn find_flag(&self, content: &str) -> Option<String> {
        self.find_flags(content, 1).into_iter().next()
    }

    /// Up to `limit` flags from the first matching pattern.
    pub fn find_flags(&self, content: &str, limit: usize) -> Vec<String> {
        if content.is_empty() {
            return Vec::new();
        }
        for pattern in FLAG_PATTERNS.iter() {
            let matches: Vec<String> = pattern
                .find_iter(content)
                .take(limit)
                .map(|m| m.as_str().to_string())
                .collect();
            if !matches.is_empty() {
                return matches;
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_first_flag() {
        let v = FlagValidator::new();
        assert_eq!(
            v.find_flag("got it: flag{abc} and flag{def}").as_deref(),
            Some("flag{abc}")
        );
    }

    #[test]
    fn matches_case_insensitively() {
        let v = FlagValidator::new();
        assert_eq!(v.find_flag("FLAG{Upper}").as_deref(), Some("FLAG{Upper}"));
        assert_eq!(v.find_flag("ctf{lower}").as_deref(), Some("ctf{lower}"));
    }

    #[test]
    fn no_flag_in_plain_output() {
        let v = FlagValidator::new();
        assert!(v.find_flag("").is_none());
        assert!(v.find_flag("nothing here, flag{ unterminated").is_none());
    }

    #[test]
    fn limit_caps_matches() {
        let v = FlagValidator::new();
        let flags = v.find_flags("flag{1} flag{2} flag{3} flag{4}", 3);
        assert_eq!(flags, vec!["flag{1}", "flag{2}", "flag{3}"]);
    }
}

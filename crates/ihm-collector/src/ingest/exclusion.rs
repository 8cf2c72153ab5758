//! Remote filename exclusion rules
//!
//! The controller writes monthly reports next to periodic system dumps. Only
//! the reports are ingested; the dumps are recognised by name. Decisions are
//! memoized per filename until the pattern set changes.

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::ConfigurationError;

/// Built-in patterns for system-backup names, applied after user patterns
pub const DEFAULT_PATTERNS: &[&str] = &[r"^Relatorio_(\d{4}_\d{2}_sys|2)\.csv$"];

/// Memoized filename classifier
#[derive(Debug)]
pub struct ExclusionFilter {
    patterns: Vec<Regex>,
    memo: HashMap<String, bool>,
}

impl Default for ExclusionFilter {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ExclusionFilter {
    /// Build a filter from a comma-separated list of user regexes
    ///
    /// Invalid patterns are logged and dropped.
    pub fn new(raw_patterns: Option<&str>) -> Self {
        let mut filter = Self {
            patterns: Vec::new(),
            memo: HashMap::new(),
        };
        filter.set_patterns(raw_patterns);
        filter
    }

    /// Replace the user patterns and clear the memo
    ///
    /// Returns the patterns that failed to compile; the rest are in effect.
    pub fn set_patterns(&mut self, raw_patterns: Option<&str>) -> Vec<ConfigurationError> {
        let user = raw_patterns
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty());

        let mut compiled = Vec::new();
        let mut rejected = Vec::new();

        for pattern in user.chain(DEFAULT_PATTERNS.iter().copied()) {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => compiled.push(re),
                Err(source) => {
                    let err = ConfigurationError::InvalidPattern {
                        pattern: pattern.to_string(),
                        source,
                    };
                    warn!(error = %err, "Ignoring exclusion pattern");
                    rejected.push(err);
                },
            }
        }

        debug!(patterns = compiled.len(), "Exclusion patterns configured");
        self.patterns = compiled;
        self.memo.clear();
        rejected
    }

    pub fn is_excluded(&mut self, name: &str) -> bool {
        if let Some(&excluded) = self.memo.get(name) {
            return excluded;
        }
        let excluded = self.classify(name);
        self.memo.insert(name.to_string(), excluded);
        excluded
    }

    /// Number of memoized decisions
    pub fn memoized(&self) -> usize {
        self.memo.len()
    }

    fn classify(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        if lower.ends_with("_01.csv") {
            return false;
        }
        if lower.ends_with("_02.csv") || lower.contains("_sys") {
            return true;
        }
        self.patterns.iter().any(|re| re.is_match(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classification() {
        let mut filter = ExclusionFilter::default();

        for name in [
            "Relatorio_09_25_SYS.csv",
            "Relatorio_02.csv",
            "something_SYS.csv",
            "Relatorio_2025_01_SYS.csv",
            "Relatorio_2.csv",
        ] {
            assert!(filter.is_excluded(name), "{name} should be excluded");
        }

        for name in [
            "Relatorio_2025_08.csv",
            "Relatorio_2025_10.csv",
            "Relatorio_2024_12.csv",
            "custom_report.csv",
            "Relatorio_01.csv",
        ] {
            assert!(!filter.is_excluded(name), "{name} should be included");
        }
    }

    #[test]
    fn test_month_year_reports_are_included() {
        let mut filter = ExclusionFilter::default();
        for name in ["Relatorio_08_25.csv", "Relatorio_09_25.csv", "Relatorio_12_24.CSV"] {
            assert!(!filter.is_excluded(name), "{name} should be included");
        }
    }

    #[test]
    fn test_first_month_wins_over_any_pattern() {
        let mut filter = ExclusionFilter::new(Some(".*,^Relatorio"));
        assert!(!filter.is_excluded("Relatorio_01.csv"));
        assert!(!filter.is_excluded("RELATORIO_SYS_01.CSV"));
        assert!(filter.is_excluded("Relatorio_2025_08.csv"));
    }

    #[test]
    fn test_second_month_and_sys_always_excluded() {
        let mut filter = ExclusionFilter::new(None);
        assert!(filter.is_excluded("anything_02.CSV"));
        assert!(filter.is_excluded("dump_sys_backup.csv"));
    }

    #[test]
    fn test_invalid_pattern_dropped_others_apply() {
        let mut filter = ExclusionFilter::new(None);
        let rejected = filter.set_patterns(Some("([unclosed, ^custom_"));
        assert_eq!(rejected.len(), 1);
        assert!(matches!(rejected[0], ConfigurationError::InvalidPattern { .. }));
        assert!(filter.is_excluded("custom_report.csv"));
        assert!(filter.is_excluded("Relatorio_2.csv"));
    }

    #[test]
    fn test_reconfiguring_clears_memo() {
        let mut filter = ExclusionFilter::default();
        assert!(!filter.is_excluded("custom_exclude_file.csv"));
        assert_eq!(filter.memoized(), 1);

        filter.set_patterns(Some("^custom_exclude"));
        assert_eq!(filter.memoized(), 0);
        assert!(filter.is_excluded("custom_exclude_file.csv"));
    }

    #[test]
    fn test_user_patterns_are_case_insensitive() {
        let mut filter = ExclusionFilter::new(Some(r"^teste_\d+\.csv$"));
        assert!(filter.is_excluded("TESTE_42.CSV"));
        assert!(!filter.is_excluded("teste_x.csv"));
    }
}

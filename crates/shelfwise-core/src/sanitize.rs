//! Dump sanitiser.
//!
//! Managed PostgreSQL dumps carry session settings, ownership changes and
//! grants that reference roles which do not exist elsewhere. This filter
//! strips them line by line so the dump can be replayed into the mirror or
//! into a fresh primary. Rows inside `COPY ... FROM stdin` blocks are never
//! dropped, only scrubbed of role markers.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Role names removed from every line by default.
pub const DEFAULT_ROLE_MARKERS: &[&str] = &["rds_superuser", "rdsadmin"];

static SESSION_TIMEOUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*SET\s+(statement_timeout|lock_timeout|idle_in_transaction_session_timeout|transaction_timeout)\b",
    )
    .unwrap()
});

static PRIVILEGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*(GRANT|REVOKE)\b").unwrap());

static OWNER_CHANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*ALTER\s+.*\bOWNER\s+TO\b").unwrap());

static COPY_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*COPY\s+.+\s+FROM\s+stdin;?\s*$").unwrap());

/// Counts reported by [`DumpSanitizer::sanitize_with_report`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SanitizeReport {
    pub lines_read: usize,
    pub lines_dropped: usize,
    pub markers_removed: usize,
}

/// Stateless text filter over a SQL dump.
#[derive(Debug, Clone)]
pub struct DumpSanitizer {
    role_markers: Vec<String>,
}

impl Default for DumpSanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_ROLE_MARKERS.iter().map(|s| s.to_string()).collect())
    }
}

impl DumpSanitizer {
    pub fn new(role_markers: Vec<String>) -> Self {
        Self {
            role_markers: role_markers
                .into_iter()
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn sanitize(&self, dump: &str) -> String {
        self.sanitize_with_report(dump).0
    }

    pub fn sanitize_with_report(&self, dump: &str) -> (String, SanitizeReport) {
        let mut out = String::with_capacity(dump.len());
        let mut filter = LineFilter::new(self.clone());
        for line in dump.split_inclusive('\n') {
            if let Some(kept) = filter.push(line) {
                out.push_str(&kept);
            }
        }
        (out, filter.into_report())
    }

    fn drops(&self, line: &str) -> bool {
        SESSION_TIMEOUT.is_match(line) || PRIVILEGE.is_match(line) || OWNER_CHANGE.is_match(line)
    }

    fn strip_markers(&self, line: &str) -> (String, usize) {
        let mut text = line.to_string();
        let mut removed = 0;
        for marker in &self.role_markers {
            let hits = text.matches(marker.as_str()).count();
            if hits > 0 {
                removed += hits;
                text = text.replace(marker.as_str(), "");
            }
        }
        (text, removed)
    }
}

/// Incremental form of [`DumpSanitizer`] for dumps read one line at a time.
///
/// Tracks whether the current line is inside a `COPY` block, so the result
/// is identical to sanitising the whole text at once.
#[derive(Debug, Clone)]
pub struct LineFilter {
    sanitizer: DumpSanitizer,
    in_copy: bool,
    report: SanitizeReport,
}

impl LineFilter {
    pub fn new(sanitizer: DumpSanitizer) -> Self {
        Self {
            sanitizer,
            in_copy: false,
            report: SanitizeReport::default(),
        }
    }

    /// Filter one line. `line` may carry its terminator, which is kept.
    /// Returns `None` when the line is dropped.
    pub fn push(&mut self, line: &str) -> Option<String> {
        self.report.lines_read += 1;
        let content = line.trim_end_matches(['\n', '\r']);

        if self.in_copy {
            if content == "\\." {
                self.in_copy = false;
            }
        } else if self.sanitizer.drops(content) {
            self.report.lines_dropped += 1;
            return None;
        } else if COPY_START.is_match(content) {
            self.in_copy = true;
        }

        let (scrubbed, removed) = self.sanitizer.strip_markers(line);
        self.report.markers_removed += removed;
        Some(scrubbed)
    }

    pub fn report(&self) -> &SanitizeReport {
        &self.report
    }

    pub fn into_report(self) -> SanitizeReport {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
SET statement_timeout = 0;
SET lock_timeout = 0;
SET idle_in_transaction_session_timeout = 0;
SET transaction_timeout = 0;
SET client_encoding = 'UTF8';
CREATE TABLE public.vip_items (store text);
ALTER TABLE public.vip_items OWNER TO rdsadmin;
GRANT ALL ON SCHEMA public TO rds_superuser;
revoke all on schema public from public;
COPY public.vip_items (store) FROM stdin;
GRANT
\\.
SELECT 'rdsadmin-owned';
";

    #[test]
    fn test_drops_session_privilege_and_owner_lines() {
        let (out, report) = DumpSanitizer::default().sanitize_with_report(DUMP);
        assert!(!out.contains("statement_timeout"));
        assert!(!out.contains("lock_timeout"));
        assert!(!out.contains("transaction_timeout"));
        assert!(!out.contains("OWNER TO"));
        assert!(!out.contains("GRANT ALL"));
        assert!(!out.to_lowercase().contains("revoke"));
        assert!(out.contains("SET client_encoding = 'UTF8';\n"));
        assert!(out.contains("CREATE TABLE public.vip_items (store text);\n"));
        assert_eq!(report.lines_dropped, 7);
    }

    #[test]
    fn test_copy_rows_are_kept() {
        let out = DumpSanitizer::default().sanitize(DUMP);
        assert!(out.contains("FROM stdin;\nGRANT\n\\.\n"));
    }

    #[test]
    fn test_role_markers_are_removed_everywhere() {
        let (out, report) = DumpSanitizer::default().sanitize_with_report(DUMP);
        assert!(out.contains("SELECT '-owned';"));
        assert!(!out.contains("rdsadmin"));
        assert_eq!(report.markers_removed, 1);
    }

    #[test]
    fn test_custom_markers() {
        let sanitizer = DumpSanitizer::new(vec!["legacy_owner".into(), String::new()]);
        assert_eq!(
            sanitizer.sanitize("CREATE SCHEMA x AUTHORIZATION legacy_owner;"),
            "CREATE SCHEMA x AUTHORIZATION ;"
        );
    }

    #[test]
    fn test_line_filter_matches_whole_text() {
        let mut filter = LineFilter::new(DumpSanitizer::default());
        let streamed: String = DUMP.lines().filter_map(|l| filter.push(l)).collect::<Vec<_>>().join("\n");
        let whole = DumpSanitizer::default().sanitize(DUMP);
        assert_eq!(format!("{}\n", streamed), whole);
        assert_eq!(filter.report().lines_dropped, 7);
    }

    #[test]
    fn test_output_without_trailing_newline() {
        assert_eq!(DumpSanitizer::default().sanitize("SELECT 1;"), "SELECT 1;");
    }
}

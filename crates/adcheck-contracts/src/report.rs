use serde::{Deserialize, Serialize};

use crate::categories::Category;
use crate::outcomes::CheckOutcome;

/// Closed severity scale. Anything the model returns outside this set is
/// coerced to `Info` on ingestion rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Fail,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Fail => "Fail",
            Severity::Warning => "Warning",
            Severity::Info => "Info",
        }
    }

    /// Case-normalizing parse; unknown or empty values coerce to `Info`.
    pub fn parse_lenient(value: &str) -> Severity {
        match value.trim().to_ascii_lowercase().as_str() {
            "fail" => Severity::Fail,
            "warning" => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

/// One flagged problem extracted from a category's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// Category-local, 1-based ordinal.
    pub number: u32,
    pub severity: Severity,
    pub content: String,
    /// Cited rule id or reference image name.
    pub basis: String,
    /// Literal text/position quoted from the target image.
    pub location: String,
    pub action: String,
}

/// One category's outcome in report form. `error` and `issues` are mutually
/// exclusive: a failed or unparsable outcome carries only the error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSection {
    pub title: String,
    pub category: Category,
    pub issues: Vec<Issue>,
    pub visual_checks: Vec<String>,
    /// Whether the category's subject matter was present in the image at
    /// all. Absent field in the model payload defaults to true.
    pub has_target: bool,
    pub error: Option<String>,
}

impl CheckSection {
    pub fn from_error(category: Category, error: impl Into<String>) -> Self {
        Self {
            title: category.display_name().to_string(),
            category,
            issues: Vec::new(),
            visual_checks: Vec::new(),
            has_target: false,
            error: Some(error.into()),
        }
    }

    /// True when the section has nothing to report but is not erroneous.
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.issues.is_empty()
    }

    /// Issues that participate in the summary tally. Errored sections and
    /// sections whose subject matter is absent contribute nothing.
    pub fn countable_issues(&self) -> &[Issue] {
        if self.error.is_some() || !self.has_target {
            return &[];
        }
        &self.issues
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryCounts {
    pub fail: u32,
    pub warning: u32,
    pub info: u32,
}

impl SummaryCounts {
    pub fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Fail => self.fail += 1,
            Severity::Warning => self.warning += 1,
            Severity::Info => self.info += 1,
        }
    }

    pub fn total(self) -> u32 {
        self.fail + self.warning + self.info
    }
}

/// Final aggregate for one review run. Immutable after construction and
/// never persisted; it lives only for one render/export cycle.
#[derive(Debug, Clone)]
pub struct ParsedReport {
    /// Tally over parsed issues only; visual checks and errors do not count.
    pub summary: SummaryCounts,
    /// Sections in canonical category order, one per dispatched category.
    pub sections: Vec<CheckSection>,
    /// Visual-confirmation items concatenated across sections in canonical
    /// order.
    pub visual_checks: Vec<String>,
    /// Raw outcomes kept for diagnostics.
    pub outcomes: Vec<CheckOutcome>,
}

impl ParsedReport {
    /// Assembles the aggregate from already-ordered sections, computing the
    /// summary tally and the flattened confirmation list.
    pub fn assemble(sections: Vec<CheckSection>, outcomes: Vec<CheckOutcome>) -> Self {
        let mut summary = SummaryCounts::default();
        let mut visual_checks = Vec::new();
        for section in &sections {
            for issue in section.countable_issues() {
                summary.add(issue.severity);
            }
            visual_checks.extend(section.visual_checks.iter().cloned());
        }
        Self {
            summary,
            sections,
            visual_checks,
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn issue(severity: Severity) -> Issue {
        Issue {
            number: 1,
            severity,
            content: "指摘".to_string(),
            basis: "ルール".to_string(),
            location: "中央".to_string(),
            action: "修正必須".to_string(),
        }
    }

    fn section(category: Category, issues: Vec<Issue>) -> CheckSection {
        CheckSection {
            title: category.display_name().to_string(),
            category,
            issues,
            visual_checks: Vec::new(),
            has_target: true,
            error: None,
        }
    }

    #[test]
    fn parse_lenient_normalizes_case_and_coerces_unknown() {
        assert_eq!(Severity::parse_lenient("FAIL"), Severity::Fail);
        assert_eq!(Severity::parse_lenient("warning"), Severity::Warning);
        assert_eq!(Severity::parse_lenient(" Info "), Severity::Info);
        assert_eq!(Severity::parse_lenient("critical"), Severity::Info);
        assert_eq!(Severity::parse_lenient(""), Severity::Info);
    }

    #[test]
    fn summary_skips_errored_sections() {
        let ok = section(Category::Atm, vec![issue(Severity::Fail)]);
        let failed = CheckSection::from_error(Category::Logo, "timeout");
        let report = ParsedReport::assemble(vec![ok, failed], Vec::new());
        assert_eq!(report.summary.fail, 1);
        assert_eq!(report.summary.total(), 1);
    }

    #[test]
    fn summary_skips_sections_without_target() {
        let mut absent = section(Category::Logo, vec![issue(Severity::Warning)]);
        absent.has_target = false;
        let report = ParsedReport::assemble(vec![absent], Vec::new());
        assert_eq!(report.summary, SummaryCounts::default());
    }

    #[test]
    fn visual_checks_concatenate_in_section_order() {
        let mut first = section(Category::Atm, Vec::new());
        first.visual_checks.push("ATMの向き".to_string());
        let mut second = section(Category::Logo, Vec::new());
        second.visual_checks.push("ロゴの余白".to_string());
        let report = ParsedReport::assemble(vec![first, second], Vec::new());
        assert_eq!(
            report.visual_checks,
            vec!["ATMの向き".to_string(), "ロゴの余白".to_string()]
        );
    }

    #[test]
    fn error_section_carries_no_issues() {
        let failed = CheckSection::from_error(Category::Format, "network error");
        assert!(failed.issues.is_empty());
        assert!(!failed.has_target);
        assert!(failed.countable_issues().is_empty());
    }

    #[test]
    fn assemble_keeps_outcomes_for_diagnostics() {
        let outcome = CheckOutcome::failure(Category::Atm, "timeout", Duration::from_secs(1));
        let report = ParsedReport::assemble(Vec::new(), vec![outcome]);
        assert_eq!(report.outcomes.len(), 1);
    }
}

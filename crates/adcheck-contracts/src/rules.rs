use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::report::Severity;

/// Wording rules as resolved by the external rule store. The core consumes
/// them as an opaque enumerable list; authoring and storage live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WordingRule {
    BannedWord {
        id: String,
        pattern: String,
        message: String,
        severity: Severity,
    },
    PreferredWord {
        id: String,
        wrong: String,
        correct: String,
        message: String,
        severity: Severity,
    },
}

impl WordingRule {
    pub fn id(&self) -> &str {
        match self {
            WordingRule::BannedWord { id, .. } => id,
            WordingRule::PreferredWord { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRule {
    pub id: String,
    pub message: String,
    pub severity: Severity,
    /// Applicability condition, e.g. "キャンペーン告知のみ".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// All externally resolved rule text for one run: typed wording/format rules
/// plus free-text additions contributed by preset selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub wording: Vec<WordingRule>,
    #[serde(default)]
    pub format: Vec<FormatRule>,
    #[serde(default)]
    pub additional: Vec<String>,
}

impl RuleSet {
    pub fn load(path: &Path) -> Result<RuleSet> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading rules file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid rules file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_set_round_trips_through_json() -> anyhow::Result<()> {
        let rules = RuleSet {
            wording: vec![
                WordingRule::BannedWord {
                    id: "W-001".to_string(),
                    pattern: "キャッシュコーナー".to_string(),
                    message: "「ATMコーナー」を使用".to_string(),
                    severity: Severity::Fail,
                },
                WordingRule::PreferredWord {
                    id: "W-002".to_string(),
                    wrong: "振込み".to_string(),
                    correct: "振込".to_string(),
                    message: "送り仮名の統一".to_string(),
                    severity: Severity::Warning,
                },
            ],
            format: vec![FormatRule {
                id: "F-001".to_string(),
                message: "日付は西暦表記".to_string(),
                severity: Severity::Warning,
                note: None,
            }],
            additional: vec!["SNSバナーでは注記を省略可".to_string()],
        };

        let json = serde_json::to_string(&rules)?;
        let back: RuleSet = serde_json::from_str(&json)?;
        assert_eq!(back, rules);
        Ok(())
    }

    #[test]
    fn missing_sections_default_to_empty() -> anyhow::Result<()> {
        let rules: RuleSet = serde_json::from_str("{}")?;
        assert!(rules.wording.is_empty());
        assert!(rules.format.is_empty());
        assert!(rules.additional.is_empty());
        Ok(())
    }

    #[test]
    fn load_reads_rules_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("rules.json");
        std::fs::write(
            &path,
            r#"{"format": [{"id": "F-009", "message": "免責文言を記載", "severity": "Fail"}]}"#,
        )?;
        let rules = RuleSet::load(&path)?;
        assert_eq!(rules.format.len(), 1);
        assert_eq!(rules.format[0].severity, Severity::Fail);
        Ok(())
    }

    #[test]
    fn load_rejects_malformed_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("rules.json");
        std::fs::write(&path, "not json")?;
        assert!(RuleSet::load(&path).is_err());
        Ok(())
    }
}

use std::time::Duration;

use crate::categories::{Category, ReferenceSpec};

/// One unit of review work: a category, the reference images it needs, and
/// its fully composed prompt. Built per run, immutable once built.
#[derive(Debug, Clone)]
pub struct CategoryTask {
    pub category: Category,
    pub references: Vec<ReferenceSpec>,
    pub prompt: String,
}

impl CategoryTask {
    pub fn new(category: Category, prompt: impl Into<String>) -> Self {
        Self {
            category,
            references: category.references().to_vec(),
            prompt: prompt.into(),
        }
    }
}

/// Result of one category reviewer invocation. Exactly one outcome exists
/// per dispatched task. The constructors enforce the invariant that a
/// success carries no error and a failure carries no result text.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub category: Category,
    pub title: String,
    pub result_text: String,
    pub ok: bool,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl CheckOutcome {
    pub fn success(category: Category, result_text: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            category,
            title: category.display_name().to_string(),
            result_text: result_text.into(),
            ok: true,
            error: None,
            elapsed,
        }
    }

    pub fn failure(category: Category, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            category,
            title: category.display_name().to_string(),
            result_text: String::new(),
            ok: false,
            error: Some(error.into()),
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_has_no_error() {
        let outcome = CheckOutcome::success(Category::Atm, "{}", Duration::from_millis(10));
        assert!(outcome.ok);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.result_text, "{}");
        assert_eq!(outcome.title, "ATM画像チェック");
    }

    #[test]
    fn failure_has_empty_result_text() {
        let outcome = CheckOutcome::failure(Category::Logo, "timeout", Duration::from_secs(90));
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("timeout"));
        assert!(outcome.result_text.is_empty());
    }

    #[test]
    fn task_inherits_category_references() {
        let task = CategoryTask::new(Category::Atm, "prompt");
        assert_eq!(task.references.len(), 2);
        assert!(CategoryTask::new(Category::Wording, "prompt")
            .references
            .is_empty());
    }
}

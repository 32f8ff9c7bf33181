// ABOUTME: Table selection for a run (--only / --skip)
// ABOUTME: Names match state-document sections case-insensitively

use crate::error::RunError;
use anyhow::Result;

/// Which configured tables a run processes
#[derive(Debug, Clone, Default)]
pub struct TableSelection {
    only: Option<Vec<String>>,
    skip: Option<Vec<String>>,
}

impl TableSelection {
    /// Creates a selection from CLI arguments
    pub fn new(only: Option<Vec<String>>, skip: Option<Vec<String>>) -> Result<Self> {
        let only = normalize(only);
        let skip = normalize(skip);

        // Validate mutually exclusive flags
        if only.is_some() && skip.is_some() {
            return Err(RunError::Configuration(
                "Cannot use both --only and --skip".to_string(),
            )
            .into());
        }

        Ok(Self { only, skip })
    }

    pub fn should_replicate(&self, table: &str) -> bool {
        if let Some(only) = &self.only {
            return contains(only, table);
        }
        if let Some(skip) = &self.skip {
            return !contains(skip, table);
        }
        true
    }

    /// Keeps the selected names, preserving input order, and warns about
    /// `--only` names that match nothing.
    pub fn apply<T>(&self, tables: Vec<T>, name: impl Fn(&T) -> &str) -> Vec<T> {
        if let Some(only) = &self.only {
            for wanted in only {
                if !tables.iter().any(|t| name(t).eq_ignore_ascii_case(wanted)) {
                    tracing::warn!(
                        "Table '{}' was selected with --only but has no section in the state document",
                        wanted
                    );
                }
            }
        }
        tables
            .into_iter()
            .filter(|t| self.should_replicate(name(t)))
            .collect()
    }
}

fn normalize(list: Option<Vec<String>>) -> Option<Vec<String>> {
    list.map(|items| {
        items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
    })
    .filter(|items| !items.is_empty())
}

fn contains(list: &[String], table: &str) -> bool {
    list.iter().any(|t| t.eq_ignore_ascii_case(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Option<Vec<String>> {
        Some(list.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_new_rejects_only_and_skip_together() {
        let err = TableSelection::new(names(&["A"]), names(&["B"])).unwrap_err();
        assert!(err.to_string().contains("Cannot use both --only and --skip"));
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_lists_count_as_absent() {
        let selection = TableSelection::new(names(&[" "]), names(&["B"])).unwrap();
        assert!(!selection.should_replicate("b"));
        assert!(selection.should_replicate("A"));
    }

    #[test]
    fn test_only_is_case_insensitive() {
        let selection = TableSelection::new(names(&["wd_documento"]), None).unwrap();
        assert!(selection.should_replicate("WD_DOCUMENTO"));
        assert!(!selection.should_replicate("WD_PAGAMENTO"));
    }

    #[test]
    fn test_skip_excludes_listed_tables() {
        let selection = TableSelection::new(None, names(&["contratos"])).unwrap();
        assert!(!selection.should_replicate("CONTRATOS"));
        assert!(selection.should_replicate("parcelas"));
    }

    #[test]
    fn test_blank_lists_replicate_everything() {
        let selection = TableSelection::new(names(&[" ", ""]), None).unwrap();
        assert!(selection.should_replicate("anything"));
    }

    #[test]
    fn test_apply_preserves_order() {
        let selection = TableSelection::new(None, names(&["b"])).unwrap();
        let kept = selection.apply(vec!["a", "B", "c"], |s: &&str| *s);
        assert_eq!(kept, vec!["a", "c"]);
    }
}

//! The ordered rule list handed from the composer to the compiler.

use std::path::Path;

use serde::Serialize;

use crate::rules::{PermissionRule, RuleAction, RuleCategory, Scope};

/// An immutable, ordered sequence of permission rules.
///
/// Conceptually three bands: (1) exactly one deny-default rule, always
/// first; (2) coarse category allows required for process viability;
/// (3) fine-grained scoped file allows, most-specific-scope-last.
///
/// Policies are minted only by the template and the composer; once
/// built, the rule list is read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    rules: Vec<PermissionRule>,
}

impl Policy {
    pub(crate) fn from_rules(rules: Vec<PermissionRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[PermissionRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Band-1 invariant: the first rule is the single unscoped deny.
    pub fn opens_with_deny_default(&self) -> bool {
        self.rules.first().is_some_and(PermissionRule::is_deny_default)
            && self
                .rules
                .iter()
                .filter(|rule| rule.category == RuleCategory::Default)
                .count()
                == 1
    }

    /// Subtrees this policy grants write access to. Feeds the
    /// confinement markers exported into the child environment.
    pub fn write_roots(&self) -> Vec<&Path> {
        self.rules
            .iter()
            .filter(|rule| {
                rule.category == RuleCategory::FileWrite && rule.action == RuleAction::Allow
            })
            .filter_map(|rule| match &rule.scope {
                Some(Scope::Subpath(path)) | Some(Scope::Literal(path)) => Some(path.as_path()),
                _ => None,
            })
            .collect()
    }

    /// True when `path` is covered by an unconditional read allow or a
    /// subpath read allow on one of its ancestors.
    pub(crate) fn implies_read(&self, path: &Path) -> bool {
        self.rules
            .iter()
            .filter(|rule| {
                rule.category == RuleCategory::FileRead && rule.action == RuleAction::Allow
            })
            .any(|rule| match &rule.scope {
                None => true,
                Some(Scope::Subpath(root)) => path.starts_with(root),
                _ => false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn deny_default_invariant_checks_position_and_uniqueness() {
        let good = Policy::from_rules(vec![
            PermissionRule::deny(RuleCategory::Default),
            PermissionRule::allow(RuleCategory::ProcessFork),
        ]);
        assert!(good.opens_with_deny_default());

        let misplaced = Policy::from_rules(vec![
            PermissionRule::allow(RuleCategory::ProcessFork),
            PermissionRule::deny(RuleCategory::Default),
        ]);
        assert!(!misplaced.opens_with_deny_default());

        let duplicated = Policy::from_rules(vec![
            PermissionRule::deny(RuleCategory::Default),
            PermissionRule::deny(RuleCategory::Default),
        ]);
        assert!(!duplicated.opens_with_deny_default());
    }

    #[test]
    fn write_roots_reports_scoped_write_allows() {
        let policy = Policy::from_rules(vec![
            PermissionRule::deny(RuleCategory::Default),
            PermissionRule::allow(RuleCategory::FileWrite)
                .with_scope(Scope::subpath("/var/tmp")),
            PermissionRule::allow(RuleCategory::FileRead)
                .with_scope(Scope::subpath("/var/tmp")),
        ]);
        assert_eq!(policy.write_roots(), vec![PathBuf::from("/var/tmp")]);
    }

    #[test]
    fn implies_read_sees_subpath_ancestors_and_unscoped_allows() {
        let scoped = Policy::from_rules(vec![
            PermissionRule::allow(RuleCategory::FileRead).with_scope(Scope::subpath("/usr/share")),
        ]);
        assert!(scoped.implies_read(Path::new("/usr/share/jupyter")));
        assert!(!scoped.implies_read(Path::new("/usr/local")));

        let blanket =
            Policy::from_rules(vec![PermissionRule::allow(RuleCategory::FileRead)]);
        assert!(blanket.implies_read(Path::new("/anything/at/all")));
    }
}

//! Typed permission rules and scope predicates.
//!
//! Rules are pure value objects: construction has no side effects and
//! never fails, with the single exception of regex scopes, which are
//! validated against the engine's regex dialect when built.

use std::path::PathBuf;

use serde::Serialize;

use crate::error::{Result, SandboxError};

/// Whether a rule grants or denies its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// Resource category a rule applies to. Each variant maps onto exactly
/// one enforcement-engine operation; the mapping lives in the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleCategory {
    /// The engine's catch-all. Valid only as the leading unscoped deny.
    Default,
    NetworkInbound,
    NetworkOutbound,
    NetworkBind,
    ProcessExec,
    ProcessFork,
    Signal,
    Ipc,
    System,
    Mach,
    IoKit,
    SysctlRead,
    UserPreferenceRead,
    FileReadMetadata,
    FileRead,
    FileWrite,
    FileIoctl,
}

impl RuleCategory {
    /// Categories whose operations accept path-shaped filters
    /// (literal, subpath, regex).
    pub fn accepts_path_filter(self) -> bool {
        matches!(
            self,
            Self::ProcessExec
                | Self::FileReadMetadata
                | Self::FileRead
                | Self::FileWrite
                | Self::FileIoctl
        )
    }

    /// Categories whose operations accept a file-mode filter.
    pub fn accepts_file_mode(self) -> bool {
        matches!(
            self,
            Self::FileReadMetadata | Self::FileRead | Self::FileWrite | Self::FileIoctl
        )
    }
}

/// A validated regular-expression scope pattern.
///
/// Only obtainable through [`ScopeRegex::new`], which requires the
/// pattern to compile and to be anchored on an absolute path prefix, so
/// a pattern meant for `/var/tmp/*` cannot also match `/var/tmp-evil`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ScopeRegex(String);

impl ScopeRegex {
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        if let Err(err) = regex::Regex::new(&pattern) {
            return Err(SandboxError::invalid_scope(&pattern, err.to_string()));
        }
        if !pattern.starts_with("^/") {
            return Err(SandboxError::invalid_scope(
                &pattern,
                "pattern must be anchored on an absolute path prefix (`^/...`)",
            ));
        }
        Ok(Self(pattern))
    }

    // Fixed template patterns only; every use is covered by a unit test
    // asserting `new` accepts the same pattern.
    pub(crate) fn from_static(pattern: &'static str) -> Self {
        Self(pattern.to_string())
    }

    pub fn pattern(&self) -> &str {
        &self.0
    }
}

/// Predicate narrowing a rule to specific paths, patterns, or file
/// attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// Exactly one path.
    Literal(PathBuf),
    /// A path and everything below it.
    Subpath(PathBuf),
    /// Paths matching an anchored pattern.
    Regex(ScopeRegex),
    /// Files whose mode matches the given octal mask.
    FileMode(u32),
    /// Both predicates must hold.
    RequireAll(Box<Scope>, Box<Scope>),
    /// Either predicate suffices.
    RequireAny(Box<Scope>, Box<Scope>),
}

impl Scope {
    pub fn literal(path: impl Into<PathBuf>) -> Self {
        Self::Literal(path.into())
    }

    pub fn subpath(path: impl Into<PathBuf>) -> Self {
        Self::Subpath(path.into())
    }

    /// Build a regex scope. Fails with
    /// [`SandboxError::InvalidScope`] when the pattern does not compile
    /// or is not anchored.
    pub fn regex(pattern: impl Into<String>) -> Result<Self> {
        Ok(Self::Regex(ScopeRegex::new(pattern)?))
    }

    pub fn file_mode(mask: u32) -> Self {
        Self::FileMode(mask)
    }

    pub fn require_all(lhs: Scope, rhs: Scope) -> Self {
        Self::RequireAll(Box::new(lhs), Box::new(rhs))
    }

    pub fn require_any(lhs: Scope, rhs: Scope) -> Self {
        Self::RequireAny(Box::new(lhs), Box::new(rhs))
    }
}

/// One permission grant or denial, optionally narrowed by a scope.
/// A rule with no scope applies unconditionally within its category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PermissionRule {
    pub category: RuleCategory,
    pub action: RuleAction,
    pub scope: Option<Scope>,
}

impl PermissionRule {
    pub fn allow(category: RuleCategory) -> Self {
        Self {
            category,
            action: RuleAction::Allow,
            scope: None,
        }
    }

    pub fn deny(category: RuleCategory) -> Self {
        Self {
            category,
            action: RuleAction::Deny,
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// The band-1 rule every policy opens with.
    pub fn is_deny_default(&self) -> bool {
        self.category == RuleCategory::Default
            && self.action == RuleAction::Deny
            && self.scope.is_none()
    }
}

//! Error taxonomy for policy composition, compilation, and confined launch.

use std::path::PathBuf;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Every failure in this crate falls into one of four categories, each
/// terminal to the current launch attempt. The split tells the caller
/// whether to fix configuration (`InvalidScope`, `UnsupportedRule`),
/// treat the request as a policy violation (`UnsafeScopeRejected`), or
/// treat the environment as unable to sandbox (`LaunchFailed`). None of
/// them are retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A scope expression is malformed (e.g. a regex that does not
    /// compile, an unanchored pattern, a relative path).
    #[error("invalid scope `{pattern}`: {reason}")]
    InvalidScope { pattern: String, reason: String },

    /// A requested grant resolves outside the allow-listed safe roots.
    /// Never auto-narrowed or auto-widened.
    #[error("permission for `{path}` rejected: {reason}")]
    UnsafeScopeRejected { path: PathBuf, reason: String },

    /// The enforcement engine cannot express a rule; emitting an
    /// approximation could silently grant more than intended.
    #[error("rule not expressible by the enforcement engine: {reason}")]
    UnsupportedRule { reason: String },

    /// The OS failed to spawn the confined process or the enforcement
    /// primitive is unavailable on this platform.
    #[error("confined launch failed: {reason}")]
    LaunchFailed { reason: String },
}

impl SandboxError {
    pub(crate) fn invalid_scope(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidScope {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unsafe_scope(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::UnsafeScopeRejected {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedRule {
            reason: reason.into(),
        }
    }

    pub(crate) fn launch(reason: impl Into<String>) -> Self {
        Self::LaunchFailed {
            reason: reason.into(),
        }
    }
}

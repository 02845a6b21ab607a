//! The deny-by-default baseline every composed policy starts from.

use crate::policy::Policy;
use crate::rules::{PermissionRule, RuleCategory, Scope, ScopeRegex};

/// Bumped whenever the fixed grant set changes, so operators can tell
/// which baseline a recorded profile was compiled from.
pub const BASELINE_REVISION: u32 = 2;

/// Terminal device nodes the baseline permits ioctl on. Anchored so no
/// other device is reachable.
pub const TTY_DEVICE_PATTERN: &str = "^/dev/(tty|pty)";

/// System subtrees every dynamically-linked interpreter reads during
/// startup: the linker cache, shared libraries, frameworks, and the
/// Python stdlib install trees below them.
const SYSTEM_READ_ROOTS: &[&str] = &[
    "/System",
    "/Library/Frameworks",
    "/usr/lib",
    "/usr/share",
    "/private/var/db/dyld",
    "/dev",
];

/// Unconditional category allows a notebook server needs to start,
/// accept connections, talk to its kernels, and shut down on signal.
const COARSE_ALLOWS: &[RuleCategory] = &[
    RuleCategory::ProcessExec,
    RuleCategory::ProcessFork,
    RuleCategory::Signal,
    RuleCategory::Ipc,
    RuleCategory::System,
    RuleCategory::Mach,
    RuleCategory::IoKit,
    RuleCategory::SysctlRead,
    RuleCategory::UserPreferenceRead,
    RuleCategory::FileReadMetadata,
    RuleCategory::NetworkInbound,
    RuleCategory::NetworkOutbound,
    RuleCategory::NetworkBind,
];

/// The minimal fixed policy for the notebook-server program class.
///
/// Anything not granted here (or composed in from an
/// [`ExtraPermissionSet`](crate::compose::ExtraPermissionSet)) is denied.
/// Each entry must stay strictly required for the target to initialize;
/// the per-entry rationale is recorded in DESIGN.md.
pub fn baseline() -> Policy {
    let mut rules = Vec::with_capacity(COARSE_ALLOWS.len() + SYSTEM_READ_ROOTS.len() + 2);
    rules.push(PermissionRule::deny(RuleCategory::Default));
    for category in COARSE_ALLOWS {
        rules.push(PermissionRule::allow(*category));
    }
    rules.push(
        PermissionRule::allow(RuleCategory::FileIoctl)
            .with_scope(Scope::Regex(ScopeRegex::from_static(TTY_DEVICE_PATTERN))),
    );
    for root in SYSTEM_READ_ROOTS {
        rules.push(PermissionRule::allow(RuleCategory::FileRead).with_scope(Scope::subpath(*root)));
    }
    Policy::from_rules(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleAction;
    use std::path::Path;

    #[test]
    fn baseline_opens_with_deny_default() {
        assert!(baseline().opens_with_deny_default());
    }

    #[test]
    fn tty_pattern_passes_scope_validation() {
        assert!(Scope::regex(TTY_DEVICE_PATTERN).is_ok());
    }

    #[test]
    fn baseline_grants_no_write_access() {
        let policy = baseline();
        assert!(policy.write_roots().is_empty());
        assert!(policy.rules().iter().all(|rule| {
            rule.category != RuleCategory::FileWrite || rule.action == RuleAction::Deny
        }));
    }

    #[test]
    fn baseline_covers_process_viability_categories() {
        let policy = baseline();
        for category in [
            RuleCategory::ProcessExec,
            RuleCategory::ProcessFork,
            RuleCategory::Signal,
            RuleCategory::SysctlRead,
            RuleCategory::NetworkInbound,
        ] {
            assert!(
                policy
                    .rules()
                    .iter()
                    .any(|rule| rule.category == category && rule.action == RuleAction::Allow),
                "baseline is missing {category:?}"
            );
        }
    }

    #[test]
    fn baseline_read_grants_cover_stdlib_but_not_user_data() {
        let policy = baseline();
        assert!(policy.implies_read(Path::new("/usr/lib/dyld")));
        assert!(policy.implies_read(Path::new("/usr/share/doc")));
        assert!(!policy.implies_read(Path::new("/Users/alice/secrets.txt")));
    }

    #[test]
    fn baseline_is_deterministic() {
        assert_eq!(baseline(), baseline());
    }
}

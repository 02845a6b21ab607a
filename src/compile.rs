//! Serializing a policy into the enforcement engine's textual syntax.
//!
//! The output grammar is bit-exact SBPL: any deviation changes
//! enforcement semantics. The compiler therefore refuses — with
//! [`SandboxError::UnsupportedRule`] — anything it cannot express
//! faithfully, instead of emitting a profile that silently grants more
//! than intended. A sandbox that fails to start is preferable to one
//! that starts over-permissive.

use std::fmt;

use crate::error::{Result, SandboxError};
use crate::policy::Policy;
use crate::rules::{PermissionRule, RuleAction, RuleCategory, Scope};

/// A compiled SBPL profile, ready for `sandbox-exec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbplProfile {
    text: String,
}

impl SbplProfile {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    /// Collapse the profile to a single line with `;` comments and blank
    /// lines stripped — the form passed via `sandbox-exec -p`.
    pub fn minify(&self) -> String {
        self.text
            .lines()
            .filter_map(strip_comment)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// `;` opens a comment only outside string and regex literals; a
// semicolon inside a quoted path must survive minification.
fn strip_comment(line: &str) -> Option<&str> {
    let mut in_string = false;
    let mut escaped = false;
    let mut cut = line.len();
    for (index, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ';' if !in_string => {
                cut = index;
                break;
            }
            _ => {}
        }
    }
    let trimmed = line[..cut].trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

impl fmt::Display for SbplProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Serialize `policy` preserving rule order exactly.
pub fn compile(policy: &Policy) -> Result<SbplProfile> {
    if !policy.opens_with_deny_default() {
        return Err(SandboxError::unsupported(
            "policy must open with a single unscoped `deny default` rule",
        ));
    }

    let mut text = String::with_capacity(64 * policy.len());
    text.push_str("(version 1)\n");
    for rule in policy.rules() {
        text.push_str(&render_rule(rule)?);
        text.push('\n');
    }
    Ok(SbplProfile { text })
}

fn render_rule(rule: &PermissionRule) -> Result<String> {
    if rule.category == RuleCategory::Default && !rule.is_deny_default() {
        return Err(SandboxError::unsupported(
            "the `default` operation only exists as the leading unscoped deny",
        ));
    }
    let action = match rule.action {
        RuleAction::Allow => "allow",
        RuleAction::Deny => "deny",
    };
    let operation = operation(rule.category);
    match &rule.scope {
        None => Ok(format!("({action} {operation})")),
        Some(scope) => {
            let filter = render_filter(scope, rule.category)?;
            Ok(format!("({action} {operation} {filter})"))
        }
    }
}

fn operation(category: RuleCategory) -> &'static str {
    match category {
        RuleCategory::Default => "default",
        RuleCategory::NetworkInbound => "network-inbound",
        RuleCategory::NetworkOutbound => "network-outbound",
        RuleCategory::NetworkBind => "network-bind",
        RuleCategory::ProcessExec => "process-exec",
        RuleCategory::ProcessFork => "process-fork",
        RuleCategory::Signal => "signal",
        RuleCategory::Ipc => "ipc*",
        RuleCategory::System => "system*",
        RuleCategory::Mach => "mach*",
        RuleCategory::IoKit => "iokit*",
        RuleCategory::SysctlRead => "sysctl-read",
        RuleCategory::UserPreferenceRead => "user-preference-read",
        RuleCategory::FileReadMetadata => "file-read-metadata",
        RuleCategory::FileRead => "file-read*",
        RuleCategory::FileWrite => "file-write*",
        RuleCategory::FileIoctl => "file-ioctl",
    }
}

fn render_filter(scope: &Scope, category: RuleCategory) -> Result<String> {
    match scope {
        Scope::Literal(path) => {
            require_path_filter(category)?;
            Ok(format!("(literal {})", quote(path)?))
        }
        Scope::Subpath(path) => {
            require_path_filter(category)?;
            Ok(format!("(subpath {})", quote(path)?))
        }
        Scope::Regex(regex) => {
            require_path_filter(category)?;
            let pattern = regex.pattern();
            if pattern.contains('"') || pattern.contains('\n') {
                return Err(SandboxError::unsupported(format!(
                    "regex pattern `{pattern}` cannot be carried in an SBPL regex literal"
                )));
            }
            Ok(format!("(regex #\"{pattern}\")"))
        }
        Scope::FileMode(mask) => {
            if !category.accepts_file_mode() {
                return Err(SandboxError::unsupported(format!(
                    "operation `{}` takes no file-mode filter",
                    operation(category)
                )));
            }
            Ok(format!("(file-mode #o{mask:04o})"))
        }
        Scope::RequireAll(lhs, rhs) => Ok(format!(
            "(require-all {} {})",
            render_filter(lhs, category)?,
            render_filter(rhs, category)?
        )),
        Scope::RequireAny(lhs, rhs) => Ok(format!(
            "(require-any {} {})",
            render_filter(lhs, category)?,
            render_filter(rhs, category)?
        )),
    }
}

fn require_path_filter(category: RuleCategory) -> Result<()> {
    if !category.accepts_path_filter() {
        return Err(SandboxError::unsupported(format!(
            "operation `{}` takes no path filter",
            operation(category)
        )));
    }
    Ok(())
}

// SBPL string literals escape backslash and double-quote; control
// characters have no escape syntax, so paths carrying them are refused.
fn quote(path: &std::path::Path) -> Result<String> {
    let raw = path.to_str().ok_or_else(|| {
        SandboxError::unsupported(format!(
            "path `{}` is not valid UTF-8",
            path.display()
        ))
    })?;
    if raw.chars().any(|ch| ch.is_control()) {
        return Err(SandboxError::unsupported(format!(
            "path `{raw:?}` contains control characters"
        )));
    }
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('"');
    for ch in raw.chars() {
        if ch == '\\' || ch == '"' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    Ok(quoted)
}

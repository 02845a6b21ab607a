//! Merging the baseline template with caller-supplied extra grants.

use std::collections::BTreeSet;
use std::iter;
use std::path::{Path, PathBuf};

use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::policy::Policy;
use crate::rules::{PermissionRule, RuleCategory, Scope};

/// Extra file-access grants requested by the surrounding CLI/config
/// layer: the user's notebook data directory, temp directories, and
/// language/package-runtime install paths.
///
/// The path collections are sets, so composition is independent of the
/// order the caller discovered them in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraPermissionSet {
    /// Where the server keeps notebooks and its working-directory
    /// artifacts.
    pub data_directory: PathBuf,
    /// Scratch directories the server and kernels may spill to.
    #[serde(default)]
    pub temp_directories: BTreeSet<PathBuf>,
    /// Installed-runtime trees (virtualenvs, kernelspecs, user site
    /// packages) the kernels import from.
    #[serde(default)]
    pub package_roots: BTreeSet<PathBuf>,
}

impl ExtraPermissionSet {
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
            temp_directories: BTreeSet::new(),
            package_roots: BTreeSet::new(),
        }
    }

    pub fn with_temp_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_directories.insert(path.into());
        self
    }

    pub fn with_package_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.package_roots.insert(path.into());
        self
    }

    fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        iter::once(&self.data_directory)
            .chain(self.temp_directories.iter())
            .chain(self.package_roots.iter())
    }
}

/// The allow-list of safe root categories extra grants may fall under:
/// the user home subtree, OS temp subtrees, and package-manager install
/// subtrees. A grant resolving outside every root is rejected outright.
#[derive(Debug, Clone)]
pub struct SafeRoots {
    roots: Vec<PathBuf>,
}

/// Install prefixes of the package managers notebook runtimes are
/// commonly provisioned with.
const PACKAGE_INSTALL_PREFIXES: &[&str] =
    &["/opt/homebrew", "/usr/local", "/opt/local", "/nix/store"];

const TEMP_PREFIXES: &[&str] = &[
    "/tmp",
    "/var/tmp",
    "/var/folders",
    "/private/tmp",
    "/private/var/tmp",
    "/private/var/folders",
];

impl SafeRoots {
    /// Build an allow-list from explicit root sets. Primarily for tests
    /// and embedders with their own discovery.
    pub fn new(
        home: impl IntoIterator<Item = PathBuf>,
        temp: impl IntoIterator<Item = PathBuf>,
        packages: impl IntoIterator<Item = PathBuf>,
    ) -> Self {
        let mut roots = Vec::new();
        for root in home.into_iter().chain(temp).chain(packages) {
            Self::push_root(&mut roots, root);
        }
        Self { roots }
    }

    /// Resolve the platform's safe roots: the current user's home, the
    /// OS temp locations, and well-known package install prefixes.
    pub fn discover() -> Self {
        let home = dirs::home_dir();
        let temp = iter::once(std::env::temp_dir())
            .chain(TEMP_PREFIXES.iter().map(PathBuf::from))
            .collect::<Vec<_>>();
        let packages = PACKAGE_INSTALL_PREFIXES
            .iter()
            .map(PathBuf::from)
            .collect::<Vec<_>>();
        Self::new(home, temp, packages)
    }

    // Each root is recorded in both its literal and symlink-resolved
    // form, since candidate paths are compared after resolution.
    fn push_root(roots: &mut Vec<PathBuf>, root: PathBuf) {
        if let Ok(resolved) = std::fs::canonicalize(&root)
            && resolved != root
            && !roots.contains(&resolved)
        {
            roots.push(resolved);
        }
        if !roots.contains(&root) {
            roots.push(root);
        }
    }

    pub fn covers(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }
}

/// Merges the immutable baseline with an [`ExtraPermissionSet`] into one
/// ordered, deduplicated policy. Owns policy construction: inputs are
/// never mutated, and no partial policy survives a failure.
#[derive(Debug, Clone)]
pub struct PolicyComposer {
    roots: SafeRoots,
}

impl Default for PolicyComposer {
    fn default() -> Self {
        Self::new(SafeRoots::discover())
    }
}

impl PolicyComposer {
    pub fn new(roots: SafeRoots) -> Self {
        Self { roots }
    }

    /// Append write (and, where not already implied, read) grants for
    /// every extra path, after normalization and safe-root validation.
    ///
    /// The output keeps the baseline's bands intact and orders the new
    /// band by normalized path, so ancestors precede descendants and the
    /// most specific scope lands last.
    pub fn compose(&self, baseline: &Policy, extra: &ExtraPermissionSet) -> Result<Policy> {
        let mut granted: BTreeSet<PathBuf> = BTreeSet::new();
        for path in extra.paths() {
            let normalized = normalize_path(path)?;
            self.check_within_roots(&normalized)?;
            granted.insert(normalized);
        }

        let mut rules = baseline.rules().to_vec();
        let mut seen: BTreeSet<PermissionRule> = rules.iter().cloned().collect();
        for path in &granted {
            if !baseline.implies_read(path) {
                push_unique(
                    &mut rules,
                    &mut seen,
                    PermissionRule::allow(RuleCategory::FileRead).with_scope(Scope::subpath(path)),
                );
            }
            push_unique(
                &mut rules,
                &mut seen,
                PermissionRule::allow(RuleCategory::FileWrite).with_scope(Scope::subpath(path)),
            );
        }

        debug!(
            extra_paths = granted.len(),
            rules = rules.len(),
            "composed policy"
        );
        Ok(Policy::from_rules(rules))
    }

    // Validation resolves symlinks where resolvable; the emitted scope
    // keeps the caller's (normalized) spelling. Rewriting the grant to
    // the resolved path would change what the engine matches.
    fn check_within_roots(&self, normalized: &Path) -> Result<()> {
        let resolved = std::fs::canonicalize(normalized)
            .unwrap_or_else(|_| normalized.to_path_buf());
        if !self.roots.covers(&resolved) {
            return Err(SandboxError::unsafe_scope(
                normalized,
                "resolves outside the user home, temp, and package install roots",
            ));
        }
        Ok(())
    }
}

fn push_unique(
    rules: &mut Vec<PermissionRule>,
    seen: &mut BTreeSet<PermissionRule>,
    rule: PermissionRule,
) {
    if seen.insert(rule.clone()) {
        rules.push(rule);
    }
}

fn normalize_path(path: &Path) -> Result<PathBuf> {
    let raw = path.as_os_str();
    if raw.is_empty() {
        return Err(SandboxError::invalid_scope("", "empty path"));
    }
    if raw.as_encoded_bytes().contains(&0) {
        return Err(SandboxError::invalid_scope(
            path.display().to_string(),
            "path contains a NUL byte",
        ));
    }
    if !path.is_absolute() {
        return Err(SandboxError::invalid_scope(
            path.display().to_string(),
            "path must be absolute",
        ));
    }
    Ok(path.clean())
}

//! Child-environment construction for confined processes.
//!
//! The child environment is rebuilt from an allow-list rather than
//! inherited wholesale: the sandbox denies filesystem reads of
//! credential stores, but secrets riding along in environment variables
//! would bypass that entirely.

use std::collections::HashMap;
use std::path::Path;

/// Variables copied from the launcher's environment into the child.
/// Shell and locale basics, temp locations, and the Python/Jupyter
/// runtime variables a notebook server resolves its trees from.
pub const PRESERVED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TERM",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TZ",
    "TMPDIR",
    "TEMP",
    "TMP",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "XDG_CACHE_HOME",
    "XDG_RUNTIME_DIR",
    "COLORTERM",
    "NO_COLOR",
    "FORCE_COLOR",
    "PYTHONPATH",
    "PYTHONHOME",
    "PYTHONUSERBASE",
    "VIRTUAL_ENV",
    "CONDA_PREFIX",
    "CONDA_DEFAULT_ENV",
    "JUPYTER_CONFIG_DIR",
    "JUPYTER_DATA_DIR",
    "JUPYTER_RUNTIME_DIR",
    "JUPYTER_PATH",
    "IPYTHONDIR",
];

/// Set to `1` in every confined child so in-sandbox tooling can detect
/// confinement.
pub const ENV_CONFINED: &str = "NBJAIL_CONFINED";
/// Colon-joined list of the subtrees the policy grants write access to.
pub const ENV_WRITABLE_ROOTS: &str = "NBJAIL_WRITABLE_ROOTS";

/// Caller-requested variables are still screened: keys that look like
/// credentials or dynamic-linker overrides never reach the child.
pub fn is_sensitive_key(key: &str) -> bool {
    key.starts_with("LD_")
        || key.starts_with("DYLD_")
        || key.starts_with("AWS_")
        || key.starts_with("AZURE_")
        || key.starts_with("GOOGLE_")
        || key.ends_with("_TOKEN")
        || key.ends_with("_KEY")
        || key.ends_with("_SECRET")
        || key.ends_with("_PASSWORD")
        || key.ends_with("_CREDENTIALS")
        || key == "SSH_AUTH_SOCK"
}

/// Build the environment for a confined child: preserved ambient
/// variables, then the caller's screened overrides, then the
/// confinement markers.
pub fn build_child_env(
    ambient: &HashMap<String, String>,
    requested: &HashMap<String, String>,
    writable_roots: &[&Path],
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    for key in PRESERVED_ENV_VARS {
        if let Some(value) = ambient.get(*key) {
            env.insert((*key).to_string(), value.clone());
        }
    }

    for (key, value) in requested {
        if is_sensitive_key(key) {
            tracing::warn!(key = %key, "dropping sensitive environment variable");
            continue;
        }
        env.insert(key.clone(), value.clone());
    }

    env.insert(ENV_CONFINED.to_string(), "1".to_string());
    if !writable_roots.is_empty() {
        let roots = writable_roots
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        env.insert(ENV_WRITABLE_ROOTS.to_string(), roots);
    }

    env
}

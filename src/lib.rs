//! # nbjail — confined launch for local notebook servers
//!
//! nbjail starts an interactive notebook server (and the kernel
//! processes it spawns) inside an OS-enforced sandbox: the server may
//! accept network connections, read its source trees, and write its own
//! working-directory artifacts, while every other filesystem, device,
//! and inter-process capability is denied by default.
//!
//! The crate is organized around one pipeline:
//!
//! - [`rules`]: typed permission rules and scope predicates.
//! - [`template`]: the immutable deny-by-default baseline.
//! - [`compose`]: merging the baseline with caller-supplied extra
//!   grants into one validated, ordered [`Policy`].
//! - [`compile`]: serializing a policy into the enforcement engine's
//!   textual syntax (SBPL), byte-exact.
//! - [`launch`]: applying the compiled profile atomically with `exec`
//!   and supervising the confined child.
//!
//! Capabilities are fixed at launch; there is no way to update the
//! policy of a running child. On platforms without an enforcement
//! primitive the launcher fails closed rather than running the target
//! unconfined.
//!
//! ## Example
//!
//! ```rust,no_run
//! use nbjail::{ExtraPermissionSet, LaunchSpec, Launcher, PolicyComposer, baseline};
//!
//! # async fn confine() -> nbjail::Result<()> {
//! let extra = ExtraPermissionSet::new("/Users/alice/Library/Notebook")
//!     .with_temp_directory("/var/tmp");
//! let policy = PolicyComposer::default().compose(&baseline(), &extra)?;
//!
//! let spec = LaunchSpec::new(policy, "/usr/local/bin/jupyter-server")
//!     .with_args(["--no-browser"]);
//! let status = Launcher::platform_default().launch(spec).await?;
//! # let _ = status;
//! # Ok(())
//! # }
//! ```

pub mod compile;
pub mod compose;
pub mod error;
pub mod launch;
pub mod policy;
pub mod rules;
pub mod spawn_env;
pub mod template;

pub use compile::{SbplProfile, compile};
pub use compose::{ExtraPermissionSet, PolicyComposer, SafeRoots};
pub use error::{Result, SandboxError};
pub use launch::{
    ExitStatus, FailClosedBackend, LaunchSpec, LaunchState, Launcher, SandboxBackend,
    SeatbeltBackend, platform_backend,
};
pub use policy::Policy;
pub use rules::{PermissionRule, RuleAction, RuleCategory, Scope, ScopeRegex};
pub use template::{BASELINE_REVISION, TTY_DEVICE_PATTERN, baseline};

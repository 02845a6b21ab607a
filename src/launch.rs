//! Compile, spawn under enforcement, wait: the confined-launch state
//! machine.
//!
//! A launch moves `Idle → Compiling → Spawning → Confined → Exited`,
//! or lands in `LaunchFailed`. Enforcement is applied atomically with
//! `exec`: compile failures abort before any process exists, so there is
//! no window where the target runs unconfined. Failures are never
//! retried — every one is a correctness or security decision point.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compile::{SbplProfile, compile};
use crate::error::{Result, SandboxError};
use crate::policy::Policy;
use crate::spawn_env;

/// Pre-installed on every macOS version this crate targets.
pub const SANDBOX_EXEC: &str = "/usr/bin/sandbox-exec";

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Everything needed for one confined launch. Constructed once,
/// consumed exactly once, never mutated afterward: there is no channel
/// for updating the policy of a running child.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub policy: Policy,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub environment: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(policy: Policy, executable: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            executable: executable.into(),
            arguments: Vec::new(),
            environment: HashMap::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

/// Termination report for a confined child, forwarded verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Shell convention: the child's code verbatim, `128 + signal` for
    /// signal deaths.
    pub fn shell_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }

    fn from_std(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt as _;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Phases of one launch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Idle,
    Compiling,
    Spawning,
    Confined,
    Exited,
    LaunchFailed,
}

fn transition(state: &mut LaunchState, next: LaunchState) {
    debug!(from = ?state, to = ?next, "launch state");
    *state = next;
}

/// The narrow capability interface over the platform's enforcement
/// primitive. Alternate engines (or the fail-closed stub) substitute
/// here without touching the rule model or composer.
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// Build the enforcement invocation for `spec`. The returned command
    /// must tie policy application to `exec`, so enforcement is active
    /// before the target's first instruction.
    fn command(&self, profile: &SbplProfile, spec: &LaunchSpec) -> Result<Command>;
}

/// macOS Seatbelt via `sandbox-exec`, which applies the profile and then
/// execs the target in one step.
#[derive(Debug, Default)]
pub struct SeatbeltBackend;

impl SandboxBackend for SeatbeltBackend {
    fn name(&self) -> &'static str {
        "seatbelt"
    }

    fn is_available(&self) -> bool {
        cfg!(target_os = "macos") && Path::new(SANDBOX_EXEC).is_file()
    }

    fn command(&self, profile: &SbplProfile, spec: &LaunchSpec) -> Result<Command> {
        if !self.is_available() {
            return Err(SandboxError::launch(format!(
                "`{SANDBOX_EXEC}` is not available on this host"
            )));
        }
        let mut command = Command::new(SANDBOX_EXEC);
        command
            .arg("-p")
            .arg(profile.minify())
            .arg("--")
            .arg(&spec.executable)
            .args(&spec.arguments);
        Ok(command)
    }
}

/// Stub for platforms without an enforcement primitive. Running the
/// target unconfined is never an acceptable fallback, so every launch
/// fails before a process exists.
#[derive(Debug, Default)]
pub struct FailClosedBackend;

impl SandboxBackend for FailClosedBackend {
    fn name(&self) -> &'static str {
        "fail-closed"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn command(&self, _profile: &SbplProfile, _spec: &LaunchSpec) -> Result<Command> {
        Err(SandboxError::launch(
            "no sandbox enforcement primitive is available on this platform",
        ))
    }
}

/// The enforcement backend for the current platform.
pub fn platform_backend() -> Box<dyn SandboxBackend> {
    if cfg!(target_os = "macos") {
        Box::new(SeatbeltBackend)
    } else {
        Box::new(FailClosedBackend)
    }
}

/// Drives [`LaunchSpec`]s through the launch state machine.
pub struct Launcher {
    backend: Box<dyn SandboxBackend>,
    grace_period: Duration,
}

impl Launcher {
    pub fn new(backend: Box<dyn SandboxBackend>) -> Self {
        Self {
            backend,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn platform_default() -> Self {
        Self::new(platform_backend())
    }

    /// Time between a cancellation SIGTERM and the follow-up SIGKILL.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Run `spec` to completion and return the child's exit status.
    pub async fn launch(&self, spec: LaunchSpec) -> Result<ExitStatus> {
        self.launch_with_cancel(spec, CancellationToken::new()).await
    }

    /// Like [`Launcher::launch`], but the wait is cancellable: on
    /// cancellation the child group receives SIGTERM, then SIGKILL after
    /// the grace period. The child is never silently abandoned.
    pub async fn launch_with_cancel(
        &self,
        spec: LaunchSpec,
        cancel: CancellationToken,
    ) -> Result<ExitStatus> {
        let mut state = LaunchState::Idle;

        transition(&mut state, LaunchState::Compiling);
        let profile = match compile(&spec.policy) {
            Ok(profile) => profile,
            Err(err) => {
                transition(&mut state, LaunchState::LaunchFailed);
                return Err(err);
            }
        };
        if !self.backend.is_available() {
            transition(&mut state, LaunchState::LaunchFailed);
            return Err(SandboxError::launch(format!(
                "sandbox backend `{}` is unavailable on this platform",
                self.backend.name()
            )));
        }

        transition(&mut state, LaunchState::Spawning);
        let mut command = match self.backend.command(&profile, &spec) {
            Ok(command) => command,
            Err(err) => {
                transition(&mut state, LaunchState::LaunchFailed);
                return Err(err);
            }
        };

        let ambient: HashMap<String, String> = std::env::vars().collect();
        let child_env =
            spawn_env::build_child_env(&ambient, &spec.environment, &spec.policy.write_roots());
        command.env_clear();
        command.envs(&child_env);
        command.kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        // Forwarding streams are installed before the child exists so no
        // termination request can slip between spawn and wait.
        let signals = match SignalStreams::install() {
            Ok(signals) => signals,
            Err(err) => {
                transition(&mut state, LaunchState::LaunchFailed);
                return Err(SandboxError::launch(format!(
                    "failed to install signal handlers: {err}"
                )));
            }
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                transition(&mut state, LaunchState::LaunchFailed);
                return Err(SandboxError::launch(format!(
                    "failed to spawn `{}` under `{}`: {err}",
                    spec.executable.display(),
                    self.backend.name()
                )));
            }
        };

        transition(&mut state, LaunchState::Confined);
        let status = match self.wait_confined(&mut child, signals, &cancel).await {
            Ok(status) => status,
            Err(err) => {
                transition(&mut state, LaunchState::LaunchFailed);
                return Err(SandboxError::launch(format!(
                    "lost the confined child while waiting: {err}"
                )));
            }
        };

        transition(&mut state, LaunchState::Exited);
        let status = ExitStatus::from_std(status);
        debug!(code = ?status.code, signal = ?status.signal, "confined child exited");
        Ok(status)
    }

    #[cfg(unix)]
    async fn wait_confined(
        &self,
        child: &mut Child,
        mut signals: SignalStreams,
        cancel: &CancellationToken,
    ) -> std::io::Result<std::process::ExitStatus> {
        loop {
            tokio::select! {
                status = child.wait() => return status,
                _ = signals.sigint.recv() => forward_signal(child, libc::SIGINT),
                _ = signals.sigterm.recv() => forward_signal(child, libc::SIGTERM),
                _ = cancel.cancelled() => return self.terminate_with_grace(child).await,
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_confined(
        &self,
        child: &mut Child,
        _signals: SignalStreams,
        cancel: &CancellationToken,
    ) -> std::io::Result<std::process::ExitStatus> {
        tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                child.start_kill()?;
                child.wait().await
            }
        }
    }

    #[cfg(unix)]
    async fn terminate_with_grace(
        &self,
        child: &mut Child,
    ) -> std::io::Result<std::process::ExitStatus> {
        forward_signal(child, libc::SIGTERM);
        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    grace_secs = self.grace_period.as_secs(),
                    "grace period elapsed, killing confined child"
                );
                child.start_kill()?;
                child.wait().await
            }
        }
    }
}

#[cfg(unix)]
struct SignalStreams {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalStreams {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }
}

#[cfg(not(unix))]
struct SignalStreams;

#[cfg(not(unix))]
impl SignalStreams {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }
}

/// Deliver `sig` to the child's process group (the child leads its own
/// group), falling back to the child alone.
#[cfg(unix)]
fn forward_signal(child: &Child, sig: libc::c_int) {
    let Some(pid) = child.id() else {
        return;
    };
    let pid = pid as libc::pid_t;
    let rc = unsafe { libc::kill(-pid, sig) };
    if rc != 0 {
        let _ = unsafe { libc::kill(pid, sig) };
    }
    warn!(signal = sig, pid, "forwarded termination signal to confined child");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::baseline;
    use crate::rules::{PermissionRule, RuleCategory, Scope};

    /// Runs the target directly, without enforcement. Exists only to
    /// exercise the launcher's spawn/wait/signal plumbing in tests.
    struct PassthroughBackend;

    impl SandboxBackend for PassthroughBackend {
        fn name(&self) -> &'static str {
            "passthrough"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn command(&self, _profile: &SbplProfile, spec: &LaunchSpec) -> Result<Command> {
            let mut command = Command::new(&spec.executable);
            command.args(&spec.arguments);
            Ok(command)
        }
    }

    fn passthrough() -> Launcher {
        Launcher::new(Box::new(PassthroughBackend))
    }

    fn shell_spec(script: &str) -> LaunchSpec {
        LaunchSpec::new(baseline(), "/bin/sh").with_args(["-c", script])
    }

    #[test]
    fn spec_builder_collects_args_and_env() {
        let spec = LaunchSpec::new(baseline(), "/usr/bin/jupyter-server")
            .with_args(["--no-browser"])
            .with_env("JUPYTER_DATA_DIR", "/Users/a/nb");
        assert_eq!(spec.arguments, vec!["--no-browser"]);
        assert_eq!(
            spec.environment.get("JUPYTER_DATA_DIR"),
            Some(&"/Users/a/nb".to_string())
        );
    }

    #[test]
    fn shell_code_follows_the_128_plus_signal_convention() {
        let by_code = ExitStatus {
            code: Some(3),
            signal: None,
        };
        assert_eq!(by_code.shell_code(), 3);
        let by_signal = ExitStatus {
            code: None,
            signal: Some(15),
        };
        assert_eq!(by_signal.shell_code(), 143);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_is_propagated_verbatim() {
        let status = passthrough().launch(shell_spec("exit 7")).await.unwrap();
        assert_eq!(status.code, Some(7));
        assert_eq!(status.signal, None);
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_death_is_reported_in_the_exit_status() {
        let status = passthrough()
            .launch(shell_spec("kill -TERM $$"))
            .await
            .unwrap();
        assert_eq!(status.code, None);
        assert_eq!(status.signal, Some(libc::SIGTERM));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_terminates_the_child_within_the_grace_period() {
        let launcher = passthrough().with_grace_period(Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let status = launcher
            .launch_with_cancel(shell_spec("sleep 30"), cancel)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(status.signal, Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn fail_closed_backend_never_spawns() {
        let scratch = tempfile::tempdir().unwrap();
        let marker = scratch.path().join("ran");
        let spec = shell_spec(&format!("touch {}", marker.display()));

        let err = Launcher::new(Box::new(FailClosedBackend))
            .launch(spec)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::LaunchFailed { .. }));
        assert!(!marker.exists(), "target must never run unconfined");
    }

    #[tokio::test]
    async fn compile_failure_aborts_before_any_spawn() {
        let scratch = tempfile::tempdir().unwrap();
        let marker = scratch.path().join("ran");
        let policy = Policy::from_rules(vec![
            PermissionRule::deny(RuleCategory::Default),
            PermissionRule::allow(RuleCategory::Signal).with_scope(Scope::subpath("/var/tmp")),
        ]);
        let spec = LaunchSpec::new(policy, "/bin/sh")
            .with_args(["-c", &format!("touch {}", marker.display())]);

        let err = passthrough().launch(spec).await.unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedRule { .. }));
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_failure_is_reported_as_launch_failed() {
        let spec = LaunchSpec::new(baseline(), "/nonexistent/interpreter");
        let err = passthrough().launch(spec).await.unwrap_err();
        assert!(matches!(err, SandboxError::LaunchFailed { .. }));
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn platform_default_fails_closed_off_macos() {
        let err = Launcher::platform_default()
            .launch(shell_spec("true"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::LaunchFailed { .. }));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn seatbelt_backend_reports_unavailable_off_macos() {
        let backend = SeatbeltBackend;
        assert!(!backend.is_available());
        let profile = compile(&baseline()).unwrap();
        let spec = shell_spec("true");
        assert!(matches!(
            backend.command(&profile, &spec).unwrap_err(),
            SandboxError::LaunchFailed { .. }
        ));
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn seatbelt_backend_wraps_the_target_with_sandbox_exec() {
        let backend = SeatbeltBackend;
        let profile = compile(&baseline()).unwrap();
        let spec = LaunchSpec::new(baseline(), "/usr/bin/true").with_args(["--flag"]);
        let command = backend.command(&profile, &spec).unwrap();
        let std_command = command.as_std();
        assert_eq!(std_command.get_program(), SANDBOX_EXEC);
        let args: Vec<_> = std_command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "-p");
        assert!(args[1].starts_with("(version 1) (deny default)"));
        assert_eq!(args[2], "--");
        assert_eq!(args[3], "/usr/bin/true");
        assert_eq!(args[4], "--flag");
    }
}

//! Thin binary entry point: resolve the extra-permission set from flags
//! and/or a TOML file, compose and compile the policy, then hand off to
//! the confined launcher and propagate the child's exit status.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use nbjail::{
    BASELINE_REVISION, ExtraPermissionSet, LaunchSpec, Launcher, PolicyComposer, baseline, compile,
};

#[derive(Debug, Parser)]
#[command(
    name = "nbjail",
    version,
    about = "Launch a notebook server inside an OS-enforced sandbox"
)]
struct Cli {
    /// Notebook data directory granted read+write.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Extra temp directory granted read+write. Repeatable.
    #[arg(long = "tmp-dir", value_name = "DIR")]
    tmp_dirs: Vec<PathBuf>,

    /// Runtime/package install root granted read+write. Repeatable.
    #[arg(long = "package-root", value_name = "DIR")]
    package_roots: Vec<PathBuf>,

    /// TOML file holding an extra-permission set
    /// (`data_directory`, `temp_directories`, `package_roots`).
    #[arg(long, value_name = "FILE")]
    extra_permissions: Option<PathBuf>,

    /// Print the composed policy as JSON and exit.
    #[arg(long)]
    dump_policy: bool,

    /// Print the compiled profile and exit.
    #[arg(long)]
    dump_profile: bool,

    /// Seconds between SIGTERM and SIGKILL when shutting the child down.
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    grace_secs: u64,

    /// Target executable and its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let code = run(Cli::parse()).await?;
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let extra = resolve_extras(&cli)?;
    let policy = PolicyComposer::default()
        .compose(&baseline(), &extra)
        .context("policy composition failed")?;
    tracing::debug!(baseline = BASELINE_REVISION, rules = policy.len(), "composed policy");

    if cli.dump_policy {
        println!("{}", serde_json::to_string_pretty(&policy)?);
        return Ok(0);
    }
    if cli.dump_profile {
        print!("{}", compile(&policy)?);
        return Ok(0);
    }

    let Some((program, args)) = cli.command.split_first() else {
        bail!("no command given; pass the target executable after the flags");
    };
    let spec = LaunchSpec::new(policy, program).with_args(args.iter().cloned());
    let status = Launcher::platform_default()
        .with_grace_period(Duration::from_secs(cli.grace_secs))
        .launch(spec)
        .await?;
    Ok(status.shell_code())
}

/// Flags override the file; both extend the path sets.
fn resolve_extras(cli: &Cli) -> Result<ExtraPermissionSet> {
    let mut extra = match (&cli.extra_permissions, &cli.data_dir) {
        (Some(file), data_dir) => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let mut set: ExtraPermissionSet =
                toml::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
            if let Some(dir) = data_dir {
                set.data_directory = dir.clone();
            }
            set
        }
        (None, Some(dir)) => ExtraPermissionSet::new(dir),
        (None, None) => bail!("either --data-dir or --extra-permissions is required"),
    };
    extra.temp_directories.extend(cli.tmp_dirs.iter().cloned());
    extra.package_roots.extend(cli.package_roots.iter().cloned());
    Ok(extra)
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nbjail=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn flags_build_an_extra_permission_set() {
        let cli = parse(&[
            "nbjail",
            "--data-dir",
            "/Users/alice/Library/Notebook",
            "--tmp-dir",
            "/var/tmp",
            "--package-root",
            "/opt/homebrew",
            "jupyter-server",
            "--no-browser",
        ]);
        let extra = resolve_extras(&cli).unwrap();
        assert_eq!(
            extra.data_directory,
            PathBuf::from("/Users/alice/Library/Notebook")
        );
        assert!(extra.temp_directories.contains(&PathBuf::from("/var/tmp")));
        assert!(extra.package_roots.contains(&PathBuf::from("/opt/homebrew")));
        assert_eq!(cli.command, vec!["jupyter-server", "--no-browser"]);
    }

    #[test]
    fn extras_file_is_layered_under_the_flags() {
        let scratch = tempfile::tempdir().unwrap();
        let file = scratch.path().join("extra.toml");
        std::fs::write(
            &file,
            "data_directory = \"/Users/alice/nb\"\ntemp_directories = [\"/var/tmp\"]\n",
        )
        .unwrap();

        let cli = parse(&[
            "nbjail",
            "--extra-permissions",
            file.to_str().unwrap(),
            "--tmp-dir",
            "/tmp",
            "sh",
        ]);
        let extra = resolve_extras(&cli).unwrap();
        assert_eq!(extra.data_directory, PathBuf::from("/Users/alice/nb"));
        assert!(extra.temp_directories.contains(&PathBuf::from("/var/tmp")));
        assert!(extra.temp_directories.contains(&PathBuf::from("/tmp")));
    }

    #[test]
    fn missing_data_source_is_an_error() {
        let cli = parse(&["nbjail", "sh"]);
        assert!(resolve_extras(&cli).is_err());
    }
}

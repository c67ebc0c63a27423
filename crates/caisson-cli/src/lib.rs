// Target-specific transitive dependency split (mio/crossterm stack) is accepted for now.
#![allow(clippy::multiple_crate_versions)]

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use caisson_domain::{PlaceholderToken, SubstitutionTable};
use caisson_engine::{DeployOptions, build_plan_for_stack, deploy_stack, materialize};
use caisson_report::{
    ColorChoice, OutputFormat, RenderOptions, redact_sensitive, render_deploy, render_plan,
};
use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand, ValueEnum};
use minus::{ExitStrategy, Pager, page_all};
use tracing_subscriber::EnvFilter;

mod error;

pub use error::CliError;

const LOG_ENV: &str = "CAISSON_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "caisson",
    about = "Templated manifests and dependency-ordered cluster deployments"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Evaluate a stack and show the submission order without touching anything.
    Preview {
        stack: PathBuf,
        #[command(flatten)]
        render: RenderFlags,
        #[arg(long, value_enum, default_value_t = FormatArg::Text)]
        format: FormatArg,
    },
    /// Realize every resource of a stack in dependency order.
    Up {
        stack: PathBuf,
        #[command(flatten)]
        render: RenderFlags,
        #[arg(long, value_enum, default_value_t = FormatArg::Text)]
        format: FormatArg,
        /// Record submissions in memory instead of calling kubectl and docker.
        #[arg(long)]
        dry_run: bool,
        /// Seconds each external command may run before it is abandoned.
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
    /// Substitute placeholders in a single template and print the result.
    Render {
        template: PathBuf,
        #[arg(long = "set", value_name = "TOKEN=VALUE", value_parser = parse_substitution)]
        substitutions: Vec<(PlaceholderToken, String)>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Args)]
struct RenderFlags {
    #[arg(long, value_enum, default_value_t = ColorArg::Auto)]
    color: ColorArg,
    #[arg(long)]
    verbose: bool,
}

impl RenderFlags {
    fn render_options(&self, target: &str) -> RenderOptions {
        RenderOptions {
            color: self.color.into(),
            verbose: self.verbose,
            target: Some(target.to_string()),
        }
    }
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Text => Self::Text,
            FormatArg::Json => Self::Json,
        }
    }
}

impl From<ColorArg> for ColorChoice {
    fn from(value: ColorArg) -> Self {
        match value {
            ColorArg::Auto => Self::Auto,
            ColorArg::Always => Self::Always,
            ColorArg::Never => Self::Never,
        }
    }
}

fn parse_substitution(raw: &str) -> std::result::Result<(PlaceholderToken, String), String> {
    let (token, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TOKEN=VALUE, got \"{raw}\""))?;
    let token = PlaceholderToken::try_from(token).map_err(|error| error.to_string())?;
    Ok((token, value.to_string()))
}

/// Run the CLI using process arguments.
///
/// # Errors
///
/// Returns an error when argument parsing fails (excluding help/version) or command
/// execution fails.
pub fn run() -> std::result::Result<i32, CliError> {
    run_from(std::env::args_os())
}

fn run_from<I, T>(args: I) -> std::result::Result<i32, CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(parsed) => parsed,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(error.into()),
        },
    };

    match cli.command {
        Commands::Preview {
            stack,
            render,
            format,
        } => {
            init_tracing(render.verbose);
            let (report, sensitive_values) = build_plan_for_stack(&stack)?;
            let output_format: OutputFormat = format.into();
            let render_options = render.render_options(&stack.display().to_string());
            let rendered = render_plan(&report, output_format, &render_options)?;
            emit_output(&rendered, output_format, &sensitive_values);
            Ok(i32::from(report.has_errors()))
        }
        Commands::Up {
            stack,
            render,
            format,
            dry_run,
            timeout,
        } => {
            init_tracing(render.verbose);
            let options = DeployOptions {
                dry_run,
                timeout: Duration::from_secs(timeout),
            };
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|source| CliError::Runtime { source })?;
            let (report, sensitive_values) = runtime.block_on(deploy_stack(&stack, options))?;

            let output_format: OutputFormat = format.into();
            let render_options = render.render_options(&stack.display().to_string());
            let rendered = render_deploy(&report, output_format, &render_options)?;
            emit_output(&rendered, output_format, &sensitive_values);
            if report.dry_run && output_format == OutputFormat::Text && !report.has_failures() {
                eprintln!("hint: re-run without --dry-run to submit to the cluster");
            }
            Ok(i32::from(report.has_failures()))
        }
        Commands::Render {
            template,
            substitutions,
        } => {
            init_tracing(false);
            let table: SubstitutionTable = substitutions.into_iter().collect();
            let rendered = materialize(&template, &table)?.consume()?;
            print!("{rendered}");
            Ok(0)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "info" } else { "warn" }));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .try_init();
}

fn emit_output(rendered: &str, format: OutputFormat, sensitive_values: &BTreeSet<String>) {
    let redacted = redact_sensitive(rendered, sensitive_values);

    if format == OutputFormat::Text && should_use_pager() && page_output(&redacted).is_ok() {
        return;
    }

    if redacted.ends_with('\n') {
        print!("{redacted}");
    } else {
        println!("{redacted}");
    }
}

fn should_use_pager() -> bool {
    std::io::stdout().is_terminal() && std::env::var_os("NO_PAGER").is_none()
}

fn page_output(rendered: &str) -> std::result::Result<(), minus::MinusError> {
    let pager = Pager::new();
    pager.set_exit_strategy(ExitStrategy::PagerQuit)?;
    pager.set_text(rendered)?;
    page_all(pager)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::fs;

    use super::{CliError, parse_substitution, run_from};

    #[test]
    fn substitution_splits_on_first_equals() {
        let (token, value) = parse_substitution("local/api:latest=registry.example/api:v1=x")
            .expect("parse substitution");
        assert_eq!(token.as_str(), "local/api:latest");
        assert_eq!(value, "registry.example/api:v1=x");
    }

    #[test]
    fn substitution_requires_token() {
        assert!(parse_substitution("=value").is_err());
        assert!(parse_substitution("no-separator").is_err());
    }

    #[test]
    fn help_exits_cleanly() {
        let code = run_from(["caisson", "--help"]).expect("help");
        assert_eq!(code, 0);
    }

    #[test]
    fn unknown_command_is_an_argument_error() {
        let error = run_from(["caisson", "destroy"]).expect_err("unknown subcommand");
        assert!(matches!(error, CliError::ArgumentParse(_)));
    }

    #[test]
    fn render_reports_missing_template() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("absent.yaml");
        let error = run_from([
            "caisson".into(),
            "render".into(),
            missing.into_os_string(),
            "--set".into(),
            "a=b".into(),
        ])
        .expect_err("missing template");
        assert!(matches!(error, CliError::Template(_)), "{error}");
    }

    #[test]
    fn render_succeeds_for_readable_template() {
        let temp = tempfile::tempdir().expect("tempdir");
        let template = temp.path().join("app.yaml");
        fs::write(&template, "image: local/app:latest\n").expect("write template");
        let code = run_from([
            "caisson".into(),
            "render".into(),
            template.into_os_string(),
            "--set".into(),
            "local/app:latest=registry.example/app:v2".into(),
        ])
        .expect("render");
        assert_eq!(code, 0);
    }
}

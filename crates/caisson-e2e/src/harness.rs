use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

static BUILT: OnceLock<Result<PathBuf, String>> = OnceLock::new();

/// Captured result of one `caisson` process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub command_line: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    /// Human-readable dump used when an assertion fails.
    #[must_use]
    pub fn transcript(&self) -> String {
        format!(
            "$ {}\n[exit: {}]\n[stdout]\n{}[stderr]\n{}",
            self.command_line, self.exit_code, self.stdout, self.stderr
        )
    }
}

/// Handle to the workspace `caisson` binary, built at most once per test process.
#[derive(Debug, Clone)]
pub struct Caisson {
    bin: PathBuf,
}

impl Caisson {
    /// Build the binary (once) and locate it next to the test executable.
    ///
    /// # Errors
    ///
    /// Returns an error if cargo fails or the target directory cannot be found.
    pub fn built() -> Result<Self, String> {
        BUILT
            .get_or_init(build_and_locate)
            .clone()
            .map(|bin| Self { bin })
    }

    /// Run `caisson` with `args` and captured output.
    ///
    /// Paging is disabled and `CAISSON_LOG` is cleared so output stays
    /// deterministic; `env_overrides` are applied last.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned.
    pub fn run(
        &self,
        args: &[OsString],
        env_overrides: &[(String, String)],
    ) -> Result<RunResult, String> {
        let mut command = Command::new(&self.bin);
        command.env("NO_PAGER", "1").env_remove("CAISSON_LOG").args(args);
        command.envs(env_overrides.iter().map(|(name, value)| (name, value)));

        let output = command
            .output()
            .map_err(|error| format!("failed to run {}: {error}", self.bin.display()))?;

        let mut command_line = vec!["caisson".to_string()];
        command_line.extend(args.iter().map(|arg| arg.to_string_lossy().into_owned()));
        Ok(RunResult {
            command_line: command_line.join(" "),
            exit_code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run `caisson <subcommand> <target> [flags]`.
///
/// # Errors
///
/// Returns an error if building or running the binary fails.
pub fn run_caisson(
    subcommand: &str,
    target: &Path,
    flags: &[&str],
    env_overrides: &[(String, String)],
) -> Result<RunResult, String> {
    let mut args = vec![OsString::from(subcommand), target.as_os_str().to_owned()];
    args.extend(flags.iter().map(OsString::from));
    Caisson::built()?.run(&args, env_overrides)
}

/// Write a text file, creating parent directories if needed.
///
/// # Errors
///
/// Returns an error if directories or file contents cannot be written.
pub fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

/// Files directly under `dir` whose name starts with `prefix`, sorted.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed.
pub fn files_with_prefix(dir: &Path, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

fn build_and_locate() -> Result<PathBuf, String> {
    let status = Command::new("cargo")
        .args(["build", "-q", "-p", "caisson"])
        .status()
        .map_err(|error| format!("failed to build caisson binary: {error}"))?;
    if !status.success() {
        return Err(format!(
            "failed to build caisson binary: cargo exited with status {status}"
        ));
    }

    let exe = std::env::current_exe()
        .map_err(|error| format!("failed to determine current executable: {error}"))?;
    let mut dir = exe
        .parent()
        .ok_or_else(|| "failed to resolve test executable directory".to_string())?
        .to_path_buf();
    if dir.ends_with("deps") {
        dir.pop();
    }
    Ok(dir.join(format!("caisson{}", std::env::consts::EXE_SUFFIX)))
}

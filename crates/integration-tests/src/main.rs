//! Integration tests for qrun
//!
//! These run the built binary, mostly in `--dry-run` mode so that no host
//! state is touched and no hypervisor is needed.

use camino::Utf8Path;
use std::process::Output;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

pub(crate) use integration_tests::{integration_test, INTEGRATION_TESTS};

mod tests {
    pub mod cli_errors;
    pub mod dry_run;
}

/// Get the path to the qrun binary, checking QRUN_PATH env var first, then falling back to "qrun"
pub(crate) fn get_qrun_command() -> Result<String> {
    if let Ok(path) = std::env::var("QRUN_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/qrun", "target/release/qrun"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set QRUN_PATH={path} to run using this binary"
        ));
    }
    Ok("qrun".to_owned())
}

/// Captured output from a command with decoded stdout/stderr strings
pub(crate) struct CapturedOutput {
    pub output: Output,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    /// Assert that the command succeeded, printing debug info on failure
    pub fn assert_success(&self, context: &str) {
        assert!(
            self.output.status.success(),
            "{} failed: {}",
            context,
            self.stderr
        );
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.output.status.code()
    }
}

/// Run qrun, capturing output
pub(crate) fn run_qrun(args: &[&str]) -> Result<CapturedOutput> {
    let qrun = get_qrun_command()?;
    let output = std::process::Command::new(&qrun).args(args).output()?;
    Ok(CapturedOutput::new(output))
}

fn main() {
    // Integration tests are only supported on Linux
    if std::env::consts::OS != "linux" {
        eprintln!(
            "Integration tests are only supported on Linux (current OS: {})",
            std::env::consts::OS
        );
        eprintln!("Skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let name = test.name;
            let f = test.f;
            Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    libtest_mimic::run(&args, tests).exit();
}

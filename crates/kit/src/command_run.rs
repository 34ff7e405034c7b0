use std::io::{Read, Seek};
use std::process::{Command, ExitStatus};

use color_eyre::eyre::{Context, Result};

/// A child process exited unsuccessfully.
///
/// Kept as a concrete type inside the `eyre::Report` so callers can
/// `downcast_ref` and look at stderr (e.g. "already exists").
#[derive(Debug)]
pub struct CommandFailed {
    pub status: ExitStatus,
    pub stderr: String,
}

impl CommandFailed {
    /// Whether the failure reports that the target resource already exists.
    pub fn already_exists(&self) -> bool {
        self.stderr.contains("already exists") || self.stderr.contains("File exists")
    }
}

impl std::fmt::Display for CommandFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subprocess failed: {:?}", self.status)?;
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, "\n{stderr}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandFailed {}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRun {
    /// Execute the child process.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its output as a string. This uses `run`
    /// internally and will return an error if the child process exits abnormally.
    fn run_get_string(&mut self) -> Result<String>;
}

/// Helpers intended for [`std::process::ExitStatus`].
pub trait ExitStatusExt {
    /// If the exit status signals it was not successful, return a [`CommandFailed`].
    /// The command string is not included; callers add it as context if they want it.
    fn check_status(&mut self, stderr: std::fs::File) -> Result<()>;
}

impl ExitStatusExt for ExitStatus {
    fn check_status(&mut self, stderr: std::fs::File) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        let stderr = last_utf8_content_from_file(stderr);
        Err(CommandFailed {
            status: *self,
            stderr,
        }
        .into())
    }
}

fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // u16 since we truncate to just the trailing bytes here
    // to avoid pathological error messages
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i32);
    let mut stderr_buf = Vec::with_capacity(size.into());
    match f
        .seek(std::io::SeekFrom::End(seek_offset.into()))
        .and_then(|_| f.read_to_end(&mut stderr_buf))
    {
        Ok(_) => String::from_utf8_lossy(&stderr_buf).into_owned(),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    }
}

impl CommandRun for Command {
    /// Synchronously execute the child, and return an error if the child exited unsuccessfully.
    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {self:?}");
        self.status()
            .with_context(|| format!("Failed to execute {:?}", self.get_program()))?
            .check_status(stderr)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run()?;
        stdout.seek(std::io::SeekFrom::Start(0)).context("seek")?;
        let mut s = String::new();
        stdout.read_to_string(&mut s)?;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_get_string() -> Result<()> {
        let out = Command::new("sh").args(["-c", "echo hello"]).run_get_string()?;
        assert_eq!(out.trim(), "hello");
        Ok(())
    }

    #[test]
    fn test_failure_keeps_stderr() {
        let err = Command::new("sh")
            .args(["-c", "echo 'device br01 already exists' >&2; exit 1"])
            .run()
            .unwrap_err();
        let failed = err.downcast_ref::<CommandFailed>().unwrap();
        assert!(!failed.status.success());
        assert!(failed.already_exists());
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_failure_other_error() {
        let err = Command::new("sh")
            .args(["-c", "echo 'Operation not permitted' >&2; exit 2"])
            .run()
            .unwrap_err();
        let failed = err.downcast_ref::<CommandFailed>().unwrap();
        assert_eq!(failed.status.code(), Some(2));
        assert!(!failed.already_exists());
    }
}

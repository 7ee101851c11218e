//! Thin async wrapper around external commands (make, patch, mount, ...).

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CmdError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{message} (exit code {code:?}): {stderr}")]
    Status {
        message: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Builder for one external command.
///
/// ```ignore
/// Cmd::new("make")
///     .args(["-C", src, "olddefconfig"])
///     .error_msg("make olddefconfig failed")
///     .run()
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Message used when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the output instead of an error on a non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Value `key` will have in the child's environment, if set here.
    pub fn get_env(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        let key = key.as_ref();
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    /// Human-readable command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Run to completion, capturing stdout and stderr.
    pub async fn run(self) -> Result<CmdOutput, CmdError> {
        debug!(cmd = %self.display(), "running");
        let output = self
            .command()
            .output()
            .await
            .map_err(|source| CmdError::Spawn {
                program: self.program.to_string_lossy().into_owned(),
                source,
            })?;

        let out = CmdOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        self.check(out)
    }

    /// Run with stdout/stderr sent to `log` (appended).
    pub async fn run_logged(self, log: &Path) -> Result<CmdOutput, CmdError> {
        let spawn_err = |source| CmdError::Spawn {
            program: self.program.to_string_lossy().into_owned(),
            source,
        };
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .map_err(spawn_err)?;
        let file_err = file.try_clone().map_err(spawn_err)?;

        debug!(cmd = %self.display(), log = %log.display(), "running");
        let status = self
            .command()
            .stdout(Stdio::from(file))
            .stderr(Stdio::from(file_err))
            .status()
            .await
            .map_err(spawn_err)?;

        self.check(CmdOutput {
            code: status.code(),
            stdout: String::new(),
            stderr: format!("see {}", log.display()),
        })
    }

    fn check(&self, out: CmdOutput) -> Result<CmdOutput, CmdError> {
        if out.success() || self.allow_fail {
            return Ok(out);
        }
        Err(CmdError::Status {
            message: self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("`{}` failed", self.display())),
            code: out.code,
            stderr: tail(&out.stderr, 20),
        })
    }
}

/// Last `n` lines of `text`; build logs are long.
fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = Cmd::new("sh").args(["-c", "echo hello"]).run().await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_uses_error_msg() {
        let err = Cmd::new("sh")
            .args(["-c", "echo nope >&2; exit 3"])
            .error_msg("lint failed")
            .run()
            .await
            .unwrap_err();
        match err {
            CmdError::Status {
                message,
                code,
                stderr,
            } => {
                assert_eq!(message, "lint failed");
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn allow_fail_returns_output() {
        let out = Cmd::new("sh")
            .args(["-c", "exit 1"])
            .allow_fail()
            .run()
            .await
            .unwrap();
        assert!(!out.success());
    }

    #[tokio::test]
    async fn env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let out = Cmd::new("sh")
            .args(["-c", "echo $GREETING; pwd"])
            .env("GREETING", "hi")
            .current_dir(dir.path())
            .run()
            .await
            .unwrap();
        let mut lines = out.stdout.lines();
        assert_eq!(lines.next(), Some("hi"));
        let pwd = lines.next().unwrap();
        assert_eq!(
            std::fs::canonicalize(pwd).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = Cmd::new("definitely-not-a-real-binary-xyz")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, CmdError::Spawn { .. }));
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
    }
}

//! External command execution for the LNS `runcmd` message.
//!
//! Mirrors the source's fallback chain: an executable file runs directly;
//! a non-executable file that exists is handed to `bash`; otherwise the
//! whole string is run through `sh -c`. This is a straight port over the
//! OS process API, not a `fork`+`execvp` translation — see DESIGN.md.

use crate::constants::MAX_CMDARGS;
use crate::error::EngineError;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct RunCmd {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunCmdResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunCmd {
    pub fn new(program: String, args: Vec<String>) -> Result<Self, EngineError> {
        if args.len() > MAX_CMDARGS {
            return Err(EngineError::Protocol(format!(
                "runcmd: too many arguments ({} > {MAX_CMDARGS})",
                args.len()
            )));
        }
        Ok(RunCmd { program, args })
    }

    /// Runs the command to completion, resolving the fallback chain
    /// against the filesystem first.
    pub async fn run(&self) -> Result<RunCmdResult, EngineError> {
        let mut command = self.resolve()?;
        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(EngineError::Io)?;
        Ok(RunCmdResult {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn resolve(&self) -> Result<Command, EngineError> {
        let path = Path::new(&self.program);
        if is_executable(path) {
            let mut cmd = Command::new(path);
            cmd.args(&self.args);
            return Ok(cmd);
        }
        if path.exists() {
            let mut cmd = Command::new("/bin/bash");
            cmd.arg(path).args(&self.args);
            return Ok(cmd);
        }
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(shell_join(&self.program, &self.args));
        Ok(cmd)
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn shell_join(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_too_many_arguments() {
        let args = vec!["x".to_string(); MAX_CMDARGS + 1];
        assert!(RunCmd::new("/bin/true".to_string(), args).is_err());
    }

    #[tokio::test]
    async fn falls_back_to_sh_c_for_unknown_program() {
        let cmd = RunCmd::new("echo hello".to_string(), vec![]).unwrap();
        let result = cmd.run().await.unwrap();
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn runs_direct_executable() {
        let cmd = RunCmd::new("/bin/echo".to_string(), vec!["hi".to_string()]).unwrap();
        let result = cmd.run().await.unwrap();
        assert_eq!(result.stdout.trim(), "hi");
    }
}

//! The impls and functions
//!
use std::process::Command;
use log::*;
use crate::{ReplicationError, Result};
use crate::remote::{CommandReturn, RemoteProcessRunner, SshRunner};

pub const DEFAULT_REMOTE_SHELL: &str = "ssh -o BatchMode=yes";

impl SshRunner {
    pub fn new(shell: &str) -> Self {
        SshRunner { shell: shell.split_whitespace().map(str::to_string).collect() }
    }
}

impl Default for SshRunner {
    fn default() -> Self {
        SshRunner::new(DEFAULT_REMOTE_SHELL)
    }
}

impl RemoteProcessRunner for SshRunner {
    fn run(
        &self,
        host: &str,
        command: &str,
    ) -> Result<CommandReturn>
    {
        let (program, arguments) = self.shell.split_first()
            .ok_or_else(|| ReplicationError::PreconditionFailed("the remote shell is empty".to_string()))?;
        debug!("{}: running '{}'", host, command);
        let output = Command::new(program)
            .args(arguments)
            .arg(host)
            .arg(command)
            .output()
            .map_err(|e| ReplicationError::QueryFailed {
                instance: host.to_string(),
                query: command.to_string(),
                errno: i64::from(e.raw_os_error().unwrap_or(-1)),
                errmsg: format!("could not run {}: {}", program, e),
            })?;
        let text = |bytes: Vec<u8>| {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if text.is_empty() { None } else { Some(text) }
        };
        let result = CommandReturn {
            // killed by a signal
            returncode: output.status.code().unwrap_or(-1),
            stdout: text(output.stdout),
            stderr: text(output.stderr),
        };
        debug!("{}: returncode {}", host, result.returncode);
        Ok(result)
    }
}

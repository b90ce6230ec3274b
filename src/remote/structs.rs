//! The structs
//!
use std::fmt::Debug;

/// The outcome of a remote command.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandReturn {
    pub returncode: i32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Runs a shell command on a named host.
pub trait RemoteProcessRunner: Send + Sync + Debug {
    fn run(&self, host: &str, command: &str) -> crate::Result<CommandReturn>;
}

/// Runs commands with a remote shell program, `ssh -o BatchMode=yes` by default.
#[derive(Debug, Clone)]
pub struct SshRunner {
    /// The program and its leading arguments; the host and the command are appended.
    pub shell: Vec<String>,
}

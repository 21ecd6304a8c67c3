//! System collaborators
//!
//! Narrow seams to the machine the migrations mutate: shell commands and
//! service control. Migration bodies only ever touch the system through these.

use std::io;
use std::process::Command;

use crate::migration::MigrationError;

/// Captured result of a shell command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes shell command lines
pub trait CommandRunner: Send + Sync {
    /// Run `command` and capture its output, whatever the exit code
    fn run(&self, command: &str) -> io::Result<CommandOutput>;

    /// Run `command`, failing on a non-zero exit code
    fn check(&self, command: &str) -> Result<CommandOutput, MigrationError> {
        let output = self.run(command)?;
        if !output.success() {
            return Err(MigrationError::Command {
                command: command.to_string(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

/// Runs commands through `bash -c`
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str) -> io::Result<CommandOutput> {
        tracing::debug!(command, "Running command");

        let output = Command::new("bash").arg("-c").arg(command).output()?;

        Ok(CommandOutput {
            // Killed by a signal
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        })
    }
}

/// Starts and stops system services
pub trait ServiceManager: Send + Sync {
    fn stop(&self, service: &str) -> Result<(), MigrationError>;
    fn start(&self, service: &str) -> Result<(), MigrationError>;
}

/// systemd service control on top of a [`CommandRunner`]
pub struct Systemctl<R> {
    runner: R,
}

impl<R: CommandRunner> Systemctl<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> ServiceManager for Systemctl<R> {
    fn stop(&self, service: &str) -> Result<(), MigrationError> {
        tracing::info!(service, "Stopping service");
        self.runner.check(&format!("systemctl stop {}", service))?;
        Ok(())
    }

    fn start(&self, service: &str) -> Result<(), MigrationError> {
        tracing::info!(service, "Starting service");
        self.runner.check(&format!("systemctl start {}", service))?;
        Ok(())
    }
}

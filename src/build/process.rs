use std::io;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use crate::lifecycle::LifecycleGuard;

/// Exit status and captured output of one build command.
#[derive(Debug)]
pub struct CommandOutcome {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (false, true) => stdout.to_string(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

/// Run `command` in `cwd`, capturing output. The child is tracked by the
/// guard while it runs so a termination signal can reach it.
///
/// A nonzero exit is a normal outcome; only spawn and wait failures are
/// errors.
pub fn run_captured(
    command: &[String],
    cwd: &Path,
    guard: &LifecycleGuard,
) -> io::Result<CommandOutcome> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty build command"))?;

    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let _ticket = guard.track_child(child.id());
    let output = child.wait_with_output()?;

    Ok(CommandOutcome {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

use crate::cli::Command;

/// How the process was started; picks the console sink and file rotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionContext {
    /// `run`, `resolve` and `build`: short-lived, driven from a terminal.
    LocalDev,
    /// `worker`: long-lived scheduler process.
    Worker,
}

pub fn detect_context(command: &Command) -> ExecutionContext {
    if matches!(command, Command::Worker(_)) {
        ExecutionContext::Worker
    } else {
        ExecutionContext::LocalDev
    }
}

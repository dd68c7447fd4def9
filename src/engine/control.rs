use std::sync::Arc;

use tracing::info;

use super::state::{RunState, RunStatus};

/// Commands an operator can send to a running test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Print current status
    Status,
    /// Cancel the run; in-flight iterations finish, then the report is produced
    Stop,
}

/// Cloneable operator handle for a run. Obtain it before `Engine::run`
/// and hand it to signal handlers or a command reader.
#[derive(Clone)]
pub struct EngineHandle {
    state: Arc<RunState>,
}

impl EngineHandle {
    pub(crate) fn new(state: Arc<RunState>) -> Self {
        Self { state }
    }

    /// Request external cancellation. Safe to call any number of times.
    pub fn cancel(&self) {
        if self.state.cancel() {
            info!("Cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    pub fn status(&self) -> RunStatus {
        self.state.status()
    }

    /// The run has produced its report; nothing left to control.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn apply(&self, cmd: ControlCommand) -> Option<RunStatus> {
        match cmd {
            ControlCommand::Status => Some(self.status()),
            ControlCommand::Stop => {
                self.cancel();
                None
            }
        }
    }
}

/// Parse a control command from user input
pub fn parse_control_command(input: &str) -> Option<ControlCommand> {
    let word = input.split_whitespace().next()?;
    match word.to_lowercase().as_str() {
        "status" | "stats" => Some(ControlCommand::Status),
        "stop" | "quit" | "exit" => Some(ControlCommand::Stop),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stop() {
        assert_eq!(parse_control_command("stop"), Some(ControlCommand::Stop));
        assert_eq!(parse_control_command("  QUIT "), Some(ControlCommand::Stop));
        assert_eq!(parse_control_command("exit"), Some(ControlCommand::Stop));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_control_command("status"), Some(ControlCommand::Status));
        assert_eq!(parse_control_command("stats"), Some(ControlCommand::Status));
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(parse_control_command(""), None);
        assert_eq!(parse_control_command("ramp 50"), None);
        assert_eq!(parse_control_command("pause"), None);
    }

    #[test]
    fn test_handle_cancel_is_idempotent() {
        let state = Arc::new(RunState::new());
        let handle = EngineHandle::new(state.clone());
        let other = handle.clone();
        assert!(handle.apply(ControlCommand::Status).is_some());
        assert!(handle.apply(ControlCommand::Stop).is_none());
        other.cancel();
        assert!(state.is_cancelled());
        assert!(handle.is_cancelled());
        assert!(!state.is_aborted());
    }
}

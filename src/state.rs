use std::time::Instant;

/// Runtime state of one supervised service.
#[derive(Debug, Clone)]
pub enum ServiceState {
    Running { pid: u32, since: Instant },
    /// No process is attached: the last one exited and either a restart
    /// is pending or the exit was terminal.
    Dead { exit_code: Option<i32> },
}

impl ServiceState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ServiceState::Running { pid, .. } => Some(*pid),
            ServiceState::Dead { .. } => None,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, ServiceState::Dead { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServiceState::Running { .. } => "running",
            ServiceState::Dead { .. } => "dead",
        }
    }
}

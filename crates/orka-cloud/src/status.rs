use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    ScheduledToStart,
    Starting,
    Running,
    ScheduledToStop,
    Stopping,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Stopped)
    }

    /// Whether the instance is on its way out (or already gone).
    pub fn is_stopping_or_stopped(self) -> bool {
        matches!(
            self,
            InstanceStatus::ScheduledToStop
                | InstanceStatus::Stopping
                | InstanceStatus::Stopped
                | InstanceStatus::Error
        )
    }

    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            (Stopped, _) => false,
            (_, Error) => true,
            (ScheduledToStart, Starting) => true,
            (Starting, Running) => true,
            (ScheduledToStart | Starting | Running | Error, ScheduledToStop) => true,
            (ScheduledToStop, Stopping) => true,
            (ScheduledToStop | Stopping | Error, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceStatus::ScheduledToStart => "SCHEDULED_TO_START",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::ScheduledToStop => "SCHEDULED_TO_STOP",
            InstanceStatus::Stopping => "STOPPING",
            InstanceStatus::Stopped => "STOPPED",
            InstanceStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

//! Job status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of the job owning a run directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// No job is known for the directory.
    Missing,
    /// The backend accepted the job but has not confirmed it is running.
    Pending,
    /// The job's process is being supervised.
    Running,
    /// The process exited successfully.
    Completed,
    /// The job was killed on request.
    Canceled,
    /// The process failed, or its supervisor died.
    Error,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Missing
            (Missing, Pending) | (Missing, Running) |
            // From Pending
            (Pending, Running) | (Pending, Canceled) | (Pending, Error) |
            // From Running
            (Running, Completed) | (Running, Canceled) | (Running, Error)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Error)
    }

    /// Check if a process may still be alive for this state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// The spelling used in status files and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "missing" => Ok(Self::Missing),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "canceled" => Ok(Self::Canceled),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(JobStatus::Missing.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Error));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Canceled.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Error.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Missing.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Missing.is_terminal());
    }

    #[test]
    fn parses_status_file_text() {
        assert_eq!("running\n".parse::<JobStatus>(), Ok(JobStatus::Running));
        assert_eq!("canceled".parse::<JobStatus>(), Ok(JobStatus::Canceled));
        assert!("cancelled".parse::<JobStatus>().is_err());
    }

    #[test]
    fn serde_uses_disk_spelling() {
        let json = serde_json::to_string(&JobStatus::Canceled).unwrap();
        assert_eq!(json, "\"canceled\"");
        assert_eq!(JobStatus::Completed.to_string(), "completed");
    }
}

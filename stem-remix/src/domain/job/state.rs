//! Job lifecycle state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle states of a separation job.
///
/// States only move forward: `QUEUED -> LOADING -> SEPARATING -> SEPARATED`.
/// `FAILED` is reachable from every non-terminal state and is irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Upload accepted, waiting for a process request.
    #[default]
    Queued,
    /// Decoding input and acquiring the model/device.
    Loading,
    /// The separation model is running.
    Separating,
    /// Stems are persisted. Remix operations are allowed.
    Separated,
    /// Terminal failure with an error detail.
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Loading => "LOADING",
            Self::Separating => "SEPARATING",
            Self::Separated => "SEPARATED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "LOADING" => Some(Self::Loading),
            "SEPARATING" => Some(Self::Separating),
            "SEPARATED" => Some(Self::Separated),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Separated | Self::Failed)
    }

    /// Whether a separation is currently in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Loading | Self::Separating)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Queued, Loading)
                | (Loading, Separating)
                | (Separating, Separated)
                | (Queued | Loading | Separating, Failed)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: JobState) -> Result<JobState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::invalid_transition(self, target))
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

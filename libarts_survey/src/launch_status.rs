//! Per-beam launch progress, reported from the orchestrator to the UI.

use std::fmt;

/// The startup state machine of one beam's node session. Transitions are
/// strictly ordered; Completed here means "everything started", the capture
/// process itself runs for the configured duration and then exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Idle,
    Cleaning,
    BufferAllocated,
    ReadersAttached,
    NetworkCapturing,
    Completed,
    Failed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Cleaning => "cleaning",
            Self::BufferAllocated => "buffer allocated",
            Self::ReadersAttached => "readers attached",
            Self::NetworkCapturing => "capturing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchStatus {
    pub progress: f32,
    pub beam: usize,
    pub state: NodeState,
}

impl LaunchStatus {
    pub fn new(progress: f32, beam: usize, state: NodeState) -> Self {
        Self {
            progress,
            beam,
            state,
        }
    }
}

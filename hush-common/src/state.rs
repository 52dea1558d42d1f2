//! Status enums reported to and accepted from the host application

use serde::{Deserialize, Serialize};

/// Lifecycle state of one device monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MonitorState {
    /// No events handled, no sessions tracked
    #[default]
    Stopped,
    /// Reductions are applied to matching sessions
    Running,
    /// Sessions tracked at their default volume, no reduction applied
    Paused,
    /// Construction failed; terminal
    InitError,
}

/// Enabled/disabled toggle used for clients, channels and the engine as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ToggleStatus {
    #[default]
    Enabled,
    Disabled,
}

impl ToggleStatus {
    pub fn is_enabled(self) -> bool {
        self == ToggleStatus::Enabled
    }
}

//! Ducking settings
//!
//! Parameters that control how much other applications are ducked, for how
//! long, and which sessions are affected. The host application owns
//! persistence; this type is only (de)serialized and validated here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Default volume reduction (halve the volume)
pub const DEFAULT_VOLUME_REDUCTION: f32 = 0.5;

/// Default delay before a ducked session is restored (milliseconds)
pub const DEFAULT_RESTORE_DELAY_MS: i64 = 400;

/// Default inactivity timeout before a silent session is forgotten (seconds)
pub const DEFAULT_SESSION_EXPIRY_SECS: u64 = 300;

/// Lowest reduction accepted in percentage mode (negative values raise volume)
pub const MIN_PERCENTAGE_REDUCTION: f32 = -1.0;

/// Highest reduction accepted in either mode
pub const MAX_VOLUME_REDUCTION: f32 = 1.0;

/// Lowest reduction accepted in fixed mode
pub const MIN_FIXED_REDUCTION: f32 = 0.0;

// =============================================================================
// Volume Mode
// =============================================================================

/// How `volume_reduction` is turned into a target volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VolumeMode {
    /// Target is the session's default volume scaled by `1 - reduction`
    #[default]
    Percentage,
    /// Target is `1 - reduction` regardless of the session's default volume
    Fixed,
}

impl VolumeMode {
    /// Allowed reduction range for this mode
    pub fn reduction_range(self) -> (f32, f32) {
        match self {
            VolumeMode::Percentage => (MIN_PERCENTAGE_REDUCTION, MAX_VOLUME_REDUCTION),
            VolumeMode::Fixed => (MIN_FIXED_REDUCTION, MAX_VOLUME_REDUCTION),
        }
    }
}

// =============================================================================
// Filter Rules
// =============================================================================

/// One entry of the include or exclude filter list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterRule {
    /// Match sessions owned by this process id
    ProcessId(u32),
    /// Case-insensitive substring match against the session identity string
    Name(String),
}

// =============================================================================
// Settings
// =============================================================================

/// Ducking settings for every monitored device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Amount of reduction (see [`VolumeMode`])
    #[serde(default = "default_volume_reduction")]
    pub volume_reduction: f32,

    /// Percentage or fixed reduction
    #[serde(default)]
    pub volume_mode: VolumeMode,

    /// Delay before a ducked session goes back to its default volume
    #[serde(default = "default_restore_delay_ms")]
    pub restore_delay_ms: i64,

    /// Only duck sessions that are currently producing audio
    #[serde(default = "default_true")]
    pub only_active_sessions: bool,

    /// Never duck sessions belonging to this process
    #[serde(default = "default_true")]
    pub exclude_own_process: bool,

    /// Ignore our own talk activity
    #[serde(default = "default_true")]
    pub exclude_own_client: bool,

    /// Consult `included_filter` instead of `excluded_filter`
    #[serde(default)]
    pub use_included_filter: bool,

    /// Sessions to duck when `use_included_filter` is set (everything else is excluded)
    #[serde(default)]
    pub included_filter: Vec<FilterRule>,

    /// Sessions never to duck when `use_included_filter` is not set
    #[serde(default)]
    pub excluded_filter: Vec<FilterRule>,

    /// Inactive sessions older than this are dropped by the expiry sweep (0 = never)
    #[serde(default = "default_session_expiry_secs")]
    pub session_expiry_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_volume_reduction() -> f32 {
    DEFAULT_VOLUME_REDUCTION
}

fn default_restore_delay_ms() -> i64 {
    DEFAULT_RESTORE_DELAY_MS
}

fn default_session_expiry_secs() -> u64 {
    DEFAULT_SESSION_EXPIRY_SECS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            volume_reduction: DEFAULT_VOLUME_REDUCTION,
            volume_mode: VolumeMode::default(),
            restore_delay_ms: DEFAULT_RESTORE_DELAY_MS,
            only_active_sessions: true,
            exclude_own_process: true,
            exclude_own_client: true,
            use_included_filter: false,
            included_filter: Vec::new(),
            excluded_filter: Vec::new(),
            session_expiry_secs: DEFAULT_SESSION_EXPIRY_SECS,
        }
    }
}

impl Settings {
    /// Return a copy with every value clamped into its legal range
    ///
    /// - `volume_reduction` is clamped to `[-1, 1]` in percentage mode and
    ///   `[0, 1]` in fixed mode (NaN becomes 0)
    /// - a negative `restore_delay_ms` becomes 0
    #[must_use]
    pub fn validated(mut self) -> Self {
        let (min, max) = self.volume_mode.reduction_range();
        self.volume_reduction = if self.volume_reduction.is_nan() {
            0.0
        } else {
            self.volume_reduction.clamp(min, max)
        };
        self.restore_delay_ms = self.restore_delay_ms.max(0);
        self
    }

    /// Restore delay as a duration (negative values count as zero)
    pub fn restore_delay(&self) -> Duration {
        Duration::from_millis(self.restore_delay_ms.max(0) as u64)
    }

    /// Expiry timeout for inactive sessions, if enabled
    pub fn session_expiry(&self) -> Option<Duration> {
        (self.session_expiry_secs > 0).then(|| Duration::from_secs(self.session_expiry_secs))
    }

    /// The filter list currently in effect (include-xor-exclude)
    pub fn active_filter(&self) -> &[FilterRule] {
        if self.use_included_filter {
            &self.included_filter
        } else {
            &self.excluded_filter
        }
    }
}

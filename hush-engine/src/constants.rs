//! Engine-wide constants and error message strings

use std::time::Duration;

// =============================================================================
// Timing
// =============================================================================

/// How often the dispatcher sweeps for long-inactive sessions
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Volumes closer than this are considered equal
pub const VOLUME_EPSILON: f32 = 0.0001;

/// Name prefix for dispatcher threads (device id is appended)
pub const DISPATCHER_THREAD_PREFIX: &str = "hush-monitor";

// =============================================================================
// Error Messages
// =============================================================================

pub const ERR_DEVICE_NOT_FOUND: &str = "Audio device not found";
pub const ERR_DEVICE_ALREADY_IN_USE: &str = "Audio device is already monitored by this process";
pub const ERR_DISPATCHER_FAILED: &str = "Failed to start monitor thread";
pub const ERR_BACKEND: &str = "Audio subsystem error";
pub const ERR_SESSION_GONE: &str = "Audio session no longer exists";

//! Hush Common Library
//!
//! Value types shared between the ducking engine and the application that
//! embeds it: settings, voice-chat identifiers, and status enums. Nothing in
//! here has behavior beyond validation.

pub mod ids;
pub mod settings;
mod state;

pub use ids::{ChannelId, ChannelKey, ClientId, ServerUid};
pub use settings::{FilterRule, Settings, VolumeMode};
pub use state::{MonitorState, ToggleStatus};

/// Device id meaning "whatever the system default output device is"
pub const DEFAULT_DEVICE_ID: &str = "";

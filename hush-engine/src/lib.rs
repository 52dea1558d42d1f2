//! Hush Engine
//!
//! Lowers ("ducks") the volume of other applications while someone in a voice
//! chat is talking, and restores it afterwards.
//!
//! - [`backend`]: the audio subsystem capability, with an in-memory and a
//!   WASAPI implementation
//! - [`monitor`]: one [`Monitor`] per output device, tracking its sessions on a
//!   dedicated dispatcher thread
//! - [`talk`]: the [`TalkAggregator`] turning talk events into start/pause
//! - [`host`]: [`DuckingHost`], tying it together for an embedding client
//!
//! The engine logs through `tracing` and never installs a subscriber itself.

pub mod backend;
pub mod constants;
pub mod error;
pub mod host;
pub mod monitor;
pub mod talk;

pub use backend::{AudioBackend, DeviceInfo, MemoryBackend};
pub use error::{BackendError, MonitorError};
pub use host::DuckingHost;
pub use monitor::{Monitor, SessionKey, SessionSnapshot};
pub use talk::{DuckingControl, TalkAggregator};

pub use hush_common::{
    ChannelId, ChannelKey, ClientId, FilterRule, MonitorState, ServerUid, Settings, ToggleStatus,
    VolumeMode,
};

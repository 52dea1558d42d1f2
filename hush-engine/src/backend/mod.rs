//! Audio subsystem capability
//!
//! The engine never talks to an operating system audio API directly. It
//! consumes the three traits below, which an audio subsystem implementation
//! provides:
//!
//! - [`AudioBackend`]: device enumeration and opening a device's session manager
//! - [`DeviceSessions`]: session enumeration and new-session notifications for one device
//! - [`SessionHandle`]: one native session (volume, activity, per-session notifications)
//!
//! Notifications flow back through [`NewSessionSink`] and [`SessionEventSink`].
//! Those sinks are the only way notification code can reach the engine; they
//! never block and may be called from any thread.

pub mod memory;
#[cfg(target_os = "windows")]
pub mod wasapi;

use std::sync::Arc;

use once_cell::sync::Lazy;
use uuid::Uuid;

use hush_common::DEFAULT_DEVICE_ID;

use crate::error::BackendError;
use crate::monitor::SessionKey;

pub use memory::MemoryBackend;
#[cfg(target_os = "windows")]
pub use wasapi::WasapiBackend;

// =============================================================================
// Value Types
// =============================================================================

/// An audio output device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Stable platform id of the device
    pub id: String,
    /// Human-readable device name
    pub name: String,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Identity of a native session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Owning process
    pub process_id: u32,
    /// Identity shared by every session of the same program image
    pub group_id: String,
    /// Globally unique id of this session instance
    pub instance_id: String,
    /// Name for logs and introspection
    pub display_name: String,
}

/// Whether a session is producing audible output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Active,
    Inactive,
}

/// Tag attached to volume writes so their echo notifications can be recognized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventContext(pub Uuid);

static ENGINE_CONTEXT: Lazy<EventContext> = Lazy::new(|| EventContext(Uuid::new_v4()));

impl EventContext {
    /// The tag this engine uses for its own volume writes
    pub fn engine() -> Self {
        *ENGINE_CONTEXT
    }

    /// A fresh tag that is not the engine's (for other writers and tests)
    pub fn foreign() -> Self {
        EventContext(Uuid::new_v4())
    }

    pub fn is_engine(&self) -> bool {
        *self == Self::engine()
    }
}

// =============================================================================
// Capability Traits
// =============================================================================

/// Entry point of an audio subsystem
pub trait AudioBackend: Send + Sync {
    /// List active output devices
    fn output_devices(&self) -> Result<Vec<DeviceInfo>, BackendError>;

    /// The current system default output device
    fn default_output_device(&self) -> Result<DeviceInfo, BackendError>;

    /// Open the session manager of a device
    fn open_device(&self, device_id: &str) -> Result<Box<dyn DeviceSessions>, BackendError>;
}

/// Session manager of one output device
pub trait DeviceSessions: Send {
    /// Enumerate every current session on the device
    ///
    /// The caller must not hold any previously returned handle while calling
    /// this: some platforms leak, or stop delivering new-session notifications,
    /// when sessions are re-enumerated while handles are retained.
    fn enumerate_sessions(&mut self) -> Result<Vec<Box<dyn SessionHandle>>, BackendError>;

    /// Start delivering new-session notifications to `sink`
    fn subscribe_new_sessions(&mut self, sink: NewSessionSink) -> Result<(), BackendError>;

    /// Stop delivering new-session notifications
    fn unsubscribe_new_sessions(&mut self);
}

/// Exclusively owned native session handle
///
/// `release` must be called exactly once before the handle is dropped; it
/// unsubscribes notifications and frees the native resources. Every call made
/// after `release` fails with [`BackendError::SessionGone`].
pub trait SessionHandle: Send {
    fn identity(&self) -> Result<SessionIdentity, BackendError>;

    /// Current volume in `[0, 1]`
    fn volume(&self) -> Result<f32, BackendError>;

    /// Set the volume, tagging the change with `context`
    fn set_volume(&mut self, volume: f32, context: EventContext) -> Result<(), BackendError>;

    fn activity(&self) -> Result<ActivityState, BackendError>;

    /// Start delivering per-session notifications to `sink`
    fn subscribe(&mut self, sink: SessionEventSink) -> Result<(), BackendError>;

    fn release(&mut self);
}

// =============================================================================
// Notification Sinks
// =============================================================================

/// Receiver side of notifications, implemented by the monitor
pub(crate) trait NotificationTarget: Send + Sync {
    fn session_created(&self, handle: Box<dyn SessionHandle>);
    fn volume_changed(&self, key: SessionKey, volume: f32, context: Option<EventContext>);
    fn activity_changed(&self, key: SessionKey, activity: ActivityState);
    fn disconnected(&self, key: SessionKey);
}

/// Delivers new-session notifications for one device
#[derive(Clone)]
pub struct NewSessionSink {
    target: Arc<dyn NotificationTarget>,
}

impl NewSessionSink {
    pub(crate) fn new(target: Arc<dyn NotificationTarget>) -> Self {
        Self { target }
    }

    /// Hand a newly created session to the engine (ownership moves with it)
    pub fn session_created(&self, handle: Box<dyn SessionHandle>) {
        self.target.session_created(handle);
    }
}

/// Delivers notifications for one tracked session
#[derive(Clone)]
pub struct SessionEventSink {
    key: SessionKey,
    target: Arc<dyn NotificationTarget>,
}

impl SessionEventSink {
    pub(crate) fn new(key: SessionKey, target: Arc<dyn NotificationTarget>) -> Self {
        Self { key, target }
    }

    /// The session's volume changed; `context` is the writer's tag, if any
    pub fn volume_changed(&self, volume: f32, context: Option<EventContext>) {
        self.target.volume_changed(self.key, volume, context);
    }

    pub fn activity_changed(&self, activity: ActivityState) {
        self.target.activity_changed(self.key, activity);
    }

    /// The session expired or its device went away
    pub fn disconnected(&self) {
        self.target.disconnected(self.key);
    }
}

impl std::fmt::Debug for SessionEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventSink")
            .field("key", &self.key)
            .finish()
    }
}

// =============================================================================
// Device Resolution
// =============================================================================

/// Resolve a device id, where the empty id means the current default device
pub fn resolve_device(
    backend: &dyn AudioBackend,
    device_id: &str,
) -> Result<DeviceInfo, BackendError> {
    if device_id == DEFAULT_DEVICE_ID {
        return backend.default_output_device();
    }

    backend
        .output_devices()?
        .into_iter()
        .find(|d| d.id == device_id)
        .ok_or_else(|| BackendError::DeviceNotFound(device_id.to_string()))
}

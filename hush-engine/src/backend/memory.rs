//! In-memory audio subsystem
//!
//! A simulated audio subsystem with devices and sessions that live entirely in
//! process memory. Hosts without a native backend can use it, and the test
//! suites drive it to create sessions, flip their activity, change volumes
//! behind the engine's back and inject failures.
//!
//! It also keeps the books on native handles: how many are open per device,
//! and how often a device was enumerated while handles were still open.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use super::{
    ActivityState, AudioBackend, DeviceInfo, DeviceSessions, EventContext, NewSessionSink,
    SessionEventSink, SessionHandle, SessionIdentity,
};
use crate::error::BackendError;

/// Id of a simulated session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimSessionId(u64);

/// Description of a session to create
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub process_id: u32,
    /// Program identity; sessions of the same program share it
    pub group_id: String,
    pub display_name: String,
    pub volume: f32,
    pub activity: ActivityState,
}

impl SessionSpec {
    /// An active session at full volume
    pub fn new(process_id: u32, group_id: &str) -> Self {
        Self {
            process_id,
            group_id: group_id.to_string(),
            display_name: group_id.to_string(),
            volume: 1.0,
            activity: ActivityState::Active,
        }
    }

    pub fn volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    pub fn activity(mut self, activity: ActivityState) -> Self {
        self.activity = activity;
        self
    }

    pub fn display_name(mut self, name: &str) -> Self {
        self.display_name = name.to_string();
        self
    }
}

struct SimSession {
    device: String,
    identity: SessionIdentity,
    volume: f32,
    activity: ActivityState,
    alive: bool,
    fail_volume: bool,
    volume_writes: usize,
    /// handle id -> subscribed sink
    subscribers: HashMap<u64, SessionEventSink>,
}

#[derive(Default)]
struct MemoryState {
    devices: Vec<DeviceInfo>,
    default_device: Option<String>,
    failing_devices: HashSet<String>,
    sessions: BTreeMap<SimSessionId, SimSession>,
    new_session_sinks: HashMap<String, NewSessionSink>,
    open_handles: HashMap<String, usize>,
    enumerations_with_open_handles: usize,
    leaked_handles: usize,
    next_session: u64,
    next_handle: u64,
}

impl MemoryState {
    fn open_handle(&mut self, device: &str) -> u64 {
        self.next_handle += 1;
        *self.open_handles.entry(device.to_string()).or_default() += 1;
        self.next_handle
    }

    fn close_handle(&mut self, device: &str, session: SimSessionId, handle_id: u64) {
        if let Some(count) = self.open_handles.get_mut(device) {
            *count = count.saturating_sub(1);
        }
        if let Some(s) = self.sessions.get_mut(&session) {
            s.subscribers.remove(&handle_id);
        }
    }
}

// =============================================================================
// Memory Backend
// =============================================================================

/// Simulated audio subsystem (cheap to clone; clones share state)
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    /// Add an output device; the first device added becomes the default
    pub fn add_device(&self, id: &str, name: &str) {
        let mut state = self.lock();
        state.devices.push(DeviceInfo::new(id, name));
        if state.default_device.is_none() {
            state.default_device = Some(id.to_string());
        }
    }

    pub fn set_default_device(&self, id: &str) {
        self.lock().default_device = Some(id.to_string());
    }

    /// Make `open_device` fail for this device
    pub fn fail_device(&self, id: &str) {
        self.lock().failing_devices.insert(id.to_string());
    }

    /// Create a session on a device and announce it to new-session subscribers
    pub fn spawn_session(&self, device: &str, spec: SessionSpec) -> SimSessionId {
        let (id, announce) = {
            let mut state = self.lock();
            state.next_session += 1;
            let id = SimSessionId(state.next_session);
            let identity = SessionIdentity {
                process_id: spec.process_id,
                instance_id: format!("{}%b{}", spec.group_id, Uuid::new_v4()),
                group_id: spec.group_id,
                display_name: spec.display_name,
            };
            state.sessions.insert(
                id,
                SimSession {
                    device: device.to_string(),
                    identity,
                    volume: spec.volume.clamp(0.0, 1.0),
                    activity: spec.activity,
                    alive: true,
                    fail_volume: false,
                    volume_writes: 0,
                    subscribers: HashMap::new(),
                },
            );

            let announce = match state.new_session_sinks.get(device).cloned() {
                Some(sink) => {
                    let handle_id = state.open_handle(device);
                    Some((sink, self.handle(device, id, handle_id)))
                }
                None => None,
            };
            (id, announce)
        };

        if let Some((sink, handle)) = announce {
            sink.session_created(Box::new(handle));
        }
        id
    }

    /// Change a session's activity and notify subscribers
    pub fn set_activity(&self, id: SimSessionId, activity: ActivityState) {
        let sinks = {
            let mut state = self.lock();
            let Some(session) = state.sessions.get_mut(&id) else {
                return;
            };
            session.activity = activity;
            session.subscribers.values().cloned().collect::<Vec<_>>()
        };
        for sink in sinks {
            sink.activity_changed(activity);
        }
    }

    /// Change a session's volume the way a user in a mixer would
    pub fn set_volume_externally(&self, id: SimSessionId, volume: f32) {
        let context = EventContext::foreign();
        let sinks = {
            let mut state = self.lock();
            let Some(session) = state.sessions.get_mut(&id) else {
                return;
            };
            session.volume = volume.clamp(0.0, 1.0);
            session.subscribers.values().cloned().collect::<Vec<_>>()
        };
        for sink in sinks {
            sink.volume_changed(volume, Some(context));
        }
    }

    /// Expire a session and notify subscribers
    pub fn expire_session(&self, id: SimSessionId) {
        let sinks = {
            let mut state = self.lock();
            let Some(session) = state.sessions.get_mut(&id) else {
                return;
            };
            session.alive = false;
            session.subscribers.values().cloned().collect::<Vec<_>>()
        };
        for sink in sinks {
            sink.disconnected();
        }
    }

    /// Make volume reads and writes of a session fail
    pub fn set_volume_fails(&self, id: SimSessionId, fail: bool) {
        if let Some(session) = self.lock().sessions.get_mut(&id) {
            session.fail_volume = fail;
        }
    }

    /// Current volume of a session
    pub fn volume(&self, id: SimSessionId) -> Option<f32> {
        self.lock().sessions.get(&id).map(|s| s.volume)
    }

    /// Number of volume writes made through handles
    pub fn volume_writes(&self, id: SimSessionId) -> usize {
        self.lock()
            .sessions
            .get(&id)
            .map(|s| s.volume_writes)
            .unwrap_or(0)
    }

    /// Number of unreleased handles for a device
    pub fn open_handles(&self, device: &str) -> usize {
        self.lock().open_handles.get(device).copied().unwrap_or(0)
    }

    /// How often a device was enumerated while handles were still open
    pub fn enumerations_with_open_handles(&self) -> usize {
        self.lock().enumerations_with_open_handles
    }

    /// Handles dropped without `release`
    pub fn leaked_handles(&self) -> usize {
        self.lock().leaked_handles
    }

    /// Whether anyone listens for new sessions on this device
    pub fn new_session_subscribed(&self, device: &str) -> bool {
        self.lock().new_session_sinks.contains_key(device)
    }

    fn handle(&self, device: &str, session: SimSessionId, handle_id: u64) -> MemorySessionHandle {
        MemorySessionHandle {
            state: self.state.clone(),
            device: device.to_string(),
            session,
            handle_id,
            released: false,
        }
    }
}

impl AudioBackend for MemoryBackend {
    fn output_devices(&self) -> Result<Vec<DeviceInfo>, BackendError> {
        Ok(self.lock().devices.clone())
    }

    fn default_output_device(&self) -> Result<DeviceInfo, BackendError> {
        let state = self.lock();
        state
            .default_device
            .as_ref()
            .and_then(|id| state.devices.iter().find(|d| &d.id == id))
            .cloned()
            .ok_or_else(|| BackendError::DeviceNotFound(String::new()))
    }

    fn open_device(&self, device_id: &str) -> Result<Box<dyn DeviceSessions>, BackendError> {
        let state = self.lock();
        if !state.devices.iter().any(|d| d.id == device_id) {
            return Err(BackendError::DeviceNotFound(device_id.to_string()));
        }
        if state.failing_devices.contains(device_id) {
            return Err(BackendError::native("open_device", "simulated failure"));
        }
        Ok(Box::new(MemoryDevice {
            backend: self.clone(),
            device: device_id.to_string(),
        }))
    }
}

// =============================================================================
// Device Sessions
// =============================================================================

struct MemoryDevice {
    backend: MemoryBackend,
    device: String,
}

impl DeviceSessions for MemoryDevice {
    fn enumerate_sessions(&mut self) -> Result<Vec<Box<dyn SessionHandle>>, BackendError> {
        let mut state = self.backend.lock();
        if state.open_handles.get(&self.device).copied().unwrap_or(0) > 0 {
            state.enumerations_with_open_handles += 1;
        }

        let ids: Vec<SimSessionId> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.alive && s.device == self.device)
            .map(|(id, _)| *id)
            .collect();

        let mut handles: Vec<Box<dyn SessionHandle>> = Vec::with_capacity(ids.len());
        for id in ids {
            let handle_id = state.open_handle(&self.device);
            handles.push(Box::new(self.backend.handle(&self.device, id, handle_id)));
        }
        Ok(handles)
    }

    fn subscribe_new_sessions(&mut self, sink: NewSessionSink) -> Result<(), BackendError> {
        self.backend
            .lock()
            .new_session_sinks
            .insert(self.device.clone(), sink);
        Ok(())
    }

    fn unsubscribe_new_sessions(&mut self) {
        self.backend.lock().new_session_sinks.remove(&self.device);
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        self.unsubscribe_new_sessions();
    }
}

// =============================================================================
// Session Handle
// =============================================================================

struct MemorySessionHandle {
    state: Arc<Mutex<MemoryState>>,
    device: String,
    session: SimSessionId,
    handle_id: u64,
    released: bool,
}

impl MemorySessionHandle {
    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut SimSession) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        if self.released {
            return Err(BackendError::SessionGone);
        }
        let mut state = lock_state(&self.state);
        match state.sessions.get_mut(&self.session) {
            Some(session) => f(session),
            None => Err(BackendError::SessionGone),
        }
    }
}

impl SessionHandle for MemorySessionHandle {
    fn identity(&self) -> Result<SessionIdentity, BackendError> {
        self.with_session(|s| Ok(s.identity.clone()))
    }

    fn volume(&self) -> Result<f32, BackendError> {
        self.with_session(|s| {
            if s.fail_volume {
                return Err(BackendError::native("GetMasterVolume", "simulated failure"));
            }
            Ok(s.volume)
        })
    }

    fn set_volume(&mut self, volume: f32, context: EventContext) -> Result<(), BackendError> {
        let sinks = self.with_session(|s| {
            if !s.alive {
                return Err(BackendError::SessionGone);
            }
            if s.fail_volume {
                return Err(BackendError::native("SetMasterVolume", "simulated failure"));
            }
            s.volume = volume.clamp(0.0, 1.0);
            s.volume_writes += 1;
            Ok(s.subscribers.values().cloned().collect::<Vec<_>>())
        })?;

        for sink in sinks {
            sink.volume_changed(volume, Some(context));
        }
        Ok(())
    }

    fn activity(&self) -> Result<ActivityState, BackendError> {
        self.with_session(|s| Ok(s.activity))
    }

    fn subscribe(&mut self, sink: SessionEventSink) -> Result<(), BackendError> {
        let handle_id = self.handle_id;
        self.with_session(|s| {
            s.subscribers.insert(handle_id, sink);
            Ok(())
        })
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        lock_state(&self.state).close_handle(&self.device, self.session, self.handle_id);
    }
}

impl Drop for MemorySessionHandle {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(device = %self.device, "session handle dropped without release");
            let mut state = lock_state(&self.state);
            state.leaked_handles += 1;
            state.close_handle(&self.device, self.session, self.handle_id);
        }
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

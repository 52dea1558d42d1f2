//! Tracked audio session
//!
//! A `Session` is the registry's record of one native audio session. It is the
//! single owner of the native handle and knows the volume the session must
//! return to when ducking ends.

use std::time::Instant;

use crate::backend::{ActivityState, EventContext, SessionHandle, SessionIdentity};
use crate::constants::VOLUME_EPSILON;
use crate::error::BackendError;

/// Engine-assigned key of a tracked session (increases with every admission)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(pub(crate) u64);

/// Read-only view of a tracked session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub process_id: u32,
    pub group_id: String,
    pub instance_id: String,
    pub display_name: String,
    pub default_volume: f32,
    pub is_at_default: bool,
    pub excluded: bool,
    pub activity: ActivityState,
    /// A delayed restore is scheduled for this session
    pub restore_pending: bool,
}

pub(crate) struct Session {
    key: SessionKey,
    identity: SessionIdentity,
    default_volume: f32,
    is_at_default: bool,
    /// Target written by the last reduction, cleared on restore
    applied_volume: Option<f32>,
    excluded: bool,
    activity: ActivityState,
    last_modified_at: Instant,
    last_active_transition_at: Instant,
    handle: Option<Box<dyn SessionHandle>>,
}

impl Session {
    pub fn new(
        key: SessionKey,
        identity: SessionIdentity,
        handle: Box<dyn SessionHandle>,
        default_volume: f32,
        activity: ActivityState,
        excluded: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            key,
            identity,
            default_volume: default_volume.clamp(0.0, 1.0),
            is_at_default: true,
            applied_volume: None,
            excluded,
            activity,
            last_modified_at: now,
            last_active_transition_at: now,
            handle: Some(handle),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn group_id(&self) -> &str {
        &self.identity.group_id
    }

    pub fn instance_id(&self) -> &str {
        &self.identity.instance_id
    }

    pub fn default_volume(&self) -> f32 {
        self.default_volume
    }

    pub fn is_at_default(&self) -> bool {
        self.is_at_default
    }

    pub fn excluded(&self) -> bool {
        self.excluded
    }

    pub fn set_excluded(&mut self, excluded: bool) {
        self.excluded = excluded;
    }

    pub fn activity(&self) -> ActivityState {
        self.activity
    }

    pub fn last_modified_at(&self) -> Instant {
        self.last_modified_at
    }

    pub fn last_active_transition_at(&self) -> Instant {
        self.last_active_transition_at
    }

    /// Record an activity transition
    pub fn set_activity(&mut self, activity: ActivityState, at: Instant) {
        self.activity = activity;
        self.last_active_transition_at = at;
    }

    /// Write a reduced volume
    ///
    /// Skips the native write when the same target is already applied.
    /// Returns whether a native write happened.
    pub fn duck_to(&mut self, target: f32) -> Result<bool, BackendError> {
        if !self.is_at_default
            && self
                .applied_volume
                .is_some_and(|v| (v - target).abs() < VOLUME_EPSILON)
        {
            return Ok(false);
        }

        self.write_volume(target)?;
        self.is_at_default = false;
        self.applied_volume = Some(target);
        Ok(true)
    }

    /// Write the default volume back
    pub fn restore(&mut self) -> Result<(), BackendError> {
        if self.is_at_default {
            return Ok(());
        }
        self.write_volume(self.default_volume)?;
        self.is_at_default = true;
        self.applied_volume = None;
        Ok(())
    }

    /// Someone else set the volume: it becomes the new baseline
    pub fn adopt_external_volume(&mut self, volume: f32) {
        self.default_volume = volume.clamp(0.0, 1.0);
        self.is_at_default = true;
        self.applied_volume = None;
        self.last_modified_at = Instant::now();
    }

    fn write_volume(&mut self, volume: f32) -> Result<(), BackendError> {
        let handle = self.handle.as_mut().ok_or(BackendError::SessionGone)?;
        handle.set_volume(volume, EventContext::engine())?;
        self.last_modified_at = Instant::now();
        Ok(())
    }

    /// Release the native handle (idempotent)
    pub fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.release();
        }
    }

    pub fn snapshot(&self, restore_pending: bool) -> SessionSnapshot {
        SessionSnapshot {
            key: self.key,
            process_id: self.identity.process_id,
            group_id: self.identity.group_id.clone(),
            instance_id: self.identity.instance_id.clone(),
            display_name: self.identity.display_name.clone(),
            default_volume: self.default_volume,
            is_at_default: self.is_at_default,
            excluded: self.excluded,
            activity: self.activity,
            restore_pending,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.handle.is_some() {
            tracing::debug!(
                session = %self.identity.display_name,
                "releasing handle of dropped session"
            );
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{SessionSpec, SimSessionId};
    use crate::backend::{AudioBackend, MemoryBackend};

    fn session_with_volume(volume: f32) -> (MemoryBackend, SimSessionId, Session) {
        let backend = MemoryBackend::new();
        backend.add_device("spk", "Speakers");
        let id = backend.spawn_session("spk", SessionSpec::new(10, "game.exe").volume(volume));

        let mut device = backend.open_device("spk").unwrap();
        let handle = device.enumerate_sessions().unwrap().remove(0);
        let identity = handle.identity().unwrap();
        let session = Session::new(
            SessionKey(1),
            identity,
            handle,
            volume,
            ActivityState::Active,
            false,
        );
        (backend, id, session)
    }

    #[test]
    fn test_duck_and_restore() {
        let (_backend, _id, mut session) = session_with_volume(0.8);
        assert!(session.duck_to(0.4).unwrap());
        assert!(!session.is_at_default());

        session.restore().unwrap();
        assert!(session.is_at_default());
        assert_eq!(session.default_volume(), 0.8);
    }

    #[test]
    fn test_duck_to_same_target_skips_native_write() {
        let (_backend, _id, mut session) = session_with_volume(1.0);
        assert!(session.duck_to(0.5).unwrap());
        assert!(!session.duck_to(0.5).unwrap());
        assert!(session.duck_to(0.3).unwrap());
    }

    #[test]
    fn test_restore_at_default_is_noop() {
        let (backend, id, mut session) = session_with_volume(1.0);
        session.restore().unwrap();
        assert_eq!(backend.volume_writes(id), 0);

        session.duck_to(0.5).unwrap();
        session.restore().unwrap();
        session.restore().unwrap();
        assert_eq!(backend.volume_writes(id), 2);
    }

    #[test]
    fn test_external_volume_becomes_default() {
        let (_backend, _id, mut session) = session_with_volume(1.0);
        session.duck_to(0.5).unwrap();
        session.adopt_external_volume(0.7);
        assert!(session.is_at_default());
        assert_eq!(session.default_volume(), 0.7);
    }

    #[test]
    fn test_drop_releases_handle() {
        let (backend, _id, session) = session_with_volume(1.0);
        assert_eq!(backend.open_handles("spk"), 1);
        drop(session);
        assert_eq!(backend.open_handles("spk"), 0);
        assert_eq!(backend.leaked_handles(), 0);
    }

    #[test]
    fn test_write_after_release_fails() {
        let (_backend, _id, mut session) = session_with_volume(1.0);
        session.release();
        assert_eq!(session.duck_to(0.5), Err(BackendError::SessionGone));
    }
}

//! Session registry running on the dispatcher
//!
//! `MonitorCore` owns everything a monitor mutates: the tracked sessions, the
//! pending delayed restores, the settings and the Stopped/Running/Paused state.
//! It is only ever touched from tasks executed by the monitor's dispatcher.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hush_common::{MonitorState, Settings};
use tokio::task::JoinHandle;

use super::dispatcher::Poster;
use super::filter::{is_excluded, target_volume};
use super::session::{Session, SessionKey, SessionSnapshot};
use crate::backend::{
    ActivityState, DeviceInfo, DeviceSessions, EventContext, NewSessionSink, NotificationTarget,
    SessionEventSink, SessionHandle,
};
use crate::constants::VOLUME_EPSILON;

pub(crate) type CorePoster = Poster<MonitorCore>;

/// Default volumes of released sessions, keyed by instance id
type RecoveredDefaults = HashMap<String, f32>;

struct PendingRestore {
    generation: u64,
    task: JoinHandle<()>,
}

/// Copy of the core's state, readable without a dispatcher round trip
///
/// Used when a call onto the dispatcher had to be deferred.
#[derive(Clone, Default)]
pub(crate) struct StateMirror(Arc<Mutex<MonitorState>>);

impl StateMirror {
    pub fn get(&self) -> MonitorState {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, state: MonitorState) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Marshals audio subsystem notifications onto the dispatcher
struct MonitorNotifier {
    poster: CorePoster,
}

impl NotificationTarget for MonitorNotifier {
    fn session_created(&self, mut handle: Box<dyn SessionHandle>) {
        if self.poster.is_closed() {
            handle.release();
            return;
        }
        self.poster
            .post(move |core, _| core.on_session_created(handle));
    }

    fn volume_changed(&self, key: SessionKey, volume: f32, context: Option<EventContext>) {
        self.poster
            .post(move |core, _| core.on_volume_changed(key, volume, context));
    }

    fn activity_changed(&self, key: SessionKey, activity: ActivityState) {
        self.poster
            .post(move |core, poster| core.on_activity_changed(key, activity, poster));
    }

    fn disconnected(&self, key: SessionKey) {
        self.poster.post(move |core, _| {
            core.remove_session(key);
        });
    }
}

// =============================================================================
// Monitor Core
// =============================================================================

pub(crate) struct MonitorCore {
    device: DeviceInfo,
    sessions_api: Box<dyn DeviceSessions>,
    notifier: Arc<dyn NotificationTarget>,
    state: MonitorState,
    mirror: StateMirror,
    settings: Settings,
    sessions: BTreeMap<SessionKey, Session>,
    pending_restores: HashMap<SessionKey, PendingRestore>,
    next_key: u64,
    next_generation: u64,
    own_pid: u32,
}

impl MonitorCore {
    pub fn new(
        device: DeviceInfo,
        sessions_api: Box<dyn DeviceSessions>,
        poster: &CorePoster,
        settings: Settings,
        mirror: StateMirror,
    ) -> Self {
        mirror.set(MonitorState::Stopped);
        Self {
            device,
            sessions_api,
            notifier: Arc::new(MonitorNotifier {
                poster: poster.clone(),
            }),
            state: MonitorState::Stopped,
            mirror,
            settings: settings.validated(),
            sessions: BTreeMap::new(),
            pending_restores: HashMap::new(),
            next_key: 0,
            next_generation: 0,
            own_pid: std::process::id(),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    fn set_state(&mut self, state: MonitorState) {
        self.state = state;
        self.mirror.set(state);
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .values()
            .map(|s| s.snapshot(self.pending_restores.contains_key(&s.key())))
            .collect()
    }

    /// Periodic dispatcher tick
    pub fn on_tick(core: &mut MonitorCore, _poster: &CorePoster) {
        if core.state != MonitorState::Stopped {
            core.sweep_expired(Instant::now());
        }
    }

    // -------------------------------------------------------------------------
    // State machine
    // -------------------------------------------------------------------------

    pub fn start(&mut self) -> MonitorState {
        match self.state {
            MonitorState::Running | MonitorState::InitError => return self.state,
            MonitorState::Stopped => {
                self.refresh_sessions();
                let sink = NewSessionSink::new(self.notifier.clone());
                if let Err(e) = self.sessions_api.subscribe_new_sessions(sink) {
                    tracing::warn!(
                        device = %self.device.id,
                        error = %e,
                        "new-session notifications unavailable"
                    );
                }
            }
            MonitorState::Paused => {}
        }

        self.set_state(MonitorState::Running);
        tracing::debug!(
            device = %self.device.id,
            sessions = self.sessions.len(),
            "ducking started"
        );
        self.apply_all();
        self.state
    }

    pub fn pause(&mut self, poster: &CorePoster) -> MonitorState {
        if self.state != MonitorState::Running {
            return self.state;
        }

        self.set_state(MonitorState::Paused);
        tracing::debug!(device = %self.device.id, "ducking paused");
        for key in self.keys() {
            self.restore_volume(key, false, poster);
        }
        self.state
    }

    pub fn stop(&mut self) -> MonitorState {
        if matches!(self.state, MonitorState::Stopped | MonitorState::InitError) {
            return self.state;
        }

        self.sessions_api.unsubscribe_new_sessions();
        self.cancel_all_restores();
        self.clear_sessions();
        self.set_state(MonitorState::Stopped);
        tracing::debug!(device = %self.device.id, "monitor stopped");
        self.state
    }

    pub fn set_settings(&mut self, settings: Settings, poster: &CorePoster) -> Settings {
        self.settings = settings.validated();

        for key in self.keys() {
            let Some(session) = self.sessions.get_mut(&key) else {
                continue;
            };
            let excluded = is_excluded(&self.settings, session.identity(), self.own_pid);
            session.set_excluded(excluded);
            if excluded {
                self.restore_volume(key, true, poster);
            } else if self.state == MonitorState::Running {
                if self.should_duck(key) {
                    self.apply_volume(key);
                } else {
                    self.restore_volume(key, false, poster);
                }
            }
        }

        self.settings.clone()
    }

    // -------------------------------------------------------------------------
    // Session collection
    // -------------------------------------------------------------------------

    /// Drop every tracked session and enumerate the device again
    ///
    /// All handles are released before enumerating. Returns the number of
    /// sessions tracked afterwards.
    pub fn refresh_sessions(&mut self) -> usize {
        self.cancel_all_restores();
        let recovered = self.clear_sessions();

        let handles = match self.sessions_api.enumerate_sessions() {
            Ok(handles) => handles,
            Err(e) => {
                tracing::warn!(device = %self.device.id, error = %e, "session enumeration failed");
                return 0;
            }
        };

        for handle in handles {
            self.save_session(handle, Some(&recovered));
        }
        self.sessions.len()
    }

    /// Restore, release and forget every session
    fn clear_sessions(&mut self) -> RecoveredDefaults {
        let mut recovered = RecoveredDefaults::new();
        for (key, mut session) in std::mem::take(&mut self.sessions) {
            self.cancel_restore(key);
            if let Err(e) = session.restore() {
                tracing::debug!(
                    session = %session.identity().display_name,
                    error = %e,
                    "restore failed"
                );
            }
            recovered.insert(session.instance_id().to_string(), session.default_volume());
            session.release();
        }
        recovered
    }

    /// Admit a session handle into the registry
    fn save_session(
        &mut self,
        mut handle: Box<dyn SessionHandle>,
        recovered: Option<&RecoveredDefaults>,
    ) -> Option<SessionKey> {
        let identity = match handle.identity() {
            Ok(identity) => identity,
            Err(e) => {
                tracing::debug!(
                    device = %self.device.id,
                    error = %e,
                    "skipping session without identity"
                );
                handle.release();
                return None;
            }
        };

        let duplicate = self.sessions.values().any(|s| {
            s.group_id() == identity.group_id && s.instance_id() == identity.instance_id
        });
        if duplicate {
            tracing::trace!(session = %identity.display_name, "duplicate session notification");
            handle.release();
            return None;
        }

        let reported = match handle.volume() {
            Ok(volume) => volume,
            Err(e) => {
                tracing::warn!(
                    session = %identity.display_name,
                    error = %e,
                    "failed to read session volume"
                );
                handle.release();
                return None;
            }
        };

        // The platform persists one volume per group, so a new instance starts
        // at whatever we last ducked a sibling to.
        let recovered_default = self
            .sessions
            .values()
            .filter(|s| s.group_id() == identity.group_id)
            .max_by_key(|s| s.last_modified_at())
            .map(|s| s.default_volume())
            .or_else(|| recovered.and_then(|m| m.get(&identity.instance_id).copied()));

        let default_volume = recovered_default.unwrap_or(reported);
        if recovered_default.is_some() && (default_volume - reported).abs() > VOLUME_EPSILON {
            if let Err(e) = handle.set_volume(default_volume, EventContext::engine()) {
                tracing::warn!(
                    session = %identity.display_name,
                    error = %e,
                    "failed to reset recovered volume"
                );
            }
        }

        let activity = handle.activity().unwrap_or_else(|e| {
            tracing::debug!(
                session = %identity.display_name,
                error = %e,
                "activity unknown,
                assuming active"
            );
            ActivityState::Active
        });

        self.next_key += 1;
        let key = SessionKey(self.next_key);
        if let Err(e) = handle.subscribe(SessionEventSink::new(key, self.notifier.clone())) {
            tracing::warn!(
                session = %identity.display_name,
                error = %e,
                "failed to subscribe to session"
            );
            handle.release();
            return None;
        }

        let excluded = is_excluded(&self.settings, &identity, self.own_pid);
        tracing::debug!(
            device = %self.device.id,
            session = %identity.display_name,
            group = %identity.group_id,
            default_volume,
            excluded,
            "tracking session"
        );

        self.sessions.insert(
            key,
            Session::new(key, identity, handle, default_volume, activity, excluded),
        );
        self.apply_volume(key);
        Some(key)
    }

    /// Restore and forget one session
    pub fn remove_session(&mut self, key: SessionKey) -> bool {
        self.cancel_restore(key);
        let Some(mut session) = self.sessions.remove(&key) else {
            return false;
        };
        if let Err(e) = session.restore() {
            tracing::debug!(
                session = %session.identity().display_name,
                error = %e,
                "restore of removed session failed"
            );
        }
        session.release();
        tracing::debug!(
            device = %self.device.id,
            session = %session.identity().display_name,
            "session removed"
        );
        true
    }

    /// Remove inactive sessions whose last activity change is older than the expiry timeout
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let Some(expiry) = self.settings.session_expiry() else {
            return 0;
        };

        let expired: Vec<SessionKey> = self
            .sessions
            .values()
            .filter(|s| {
                s.activity() == ActivityState::Inactive
                    && now.saturating_duration_since(s.last_active_transition_at()) >= expiry
            })
            .map(|s| s.key())
            .collect();

        for key in &expired {
            self.remove_session(*key);
        }
        if !expired.is_empty() {
            tracing::debug!(
                device = %self.device.id,
                count = expired.len(),
                "expired sessions swept"
            );
        }
        expired.len()
    }

    fn keys(&self) -> Vec<SessionKey> {
        self.sessions.keys().copied().collect()
    }

    // -------------------------------------------------------------------------
    // Volume
    // -------------------------------------------------------------------------

    fn should_duck(&self, key: SessionKey) -> bool {
        let Some(session) = self.sessions.get(&key) else {
            return false;
        };
        !session.excluded()
            && !(self.settings.only_active_sessions
                && session.activity() == ActivityState::Inactive)
    }

    fn apply_all(&mut self) {
        for key in self.keys() {
            self.apply_volume(key);
        }
    }

    /// Duck one session if ducking is active and the session qualifies
    fn apply_volume(&mut self, key: SessionKey) {
        if self.state != MonitorState::Running || !self.should_duck(key) {
            return;
        }

        self.cancel_restore(key);
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        let target = target_volume(&self.settings, session.default_volume());
        match session.duck_to(target) {
            Ok(true) => {
                tracing::trace!(
                    session = %session.identity().display_name,
                    target,
                    "session ducked"
                );
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    session = %session.identity().display_name,
                    error = %e,
                    "failed to duck session"
                );
            }
        }
    }

    /// Bring a session back to its default volume, now or after the restore delay
    fn restore_volume(&mut self, key: SessionKey, immediate: bool, poster: &CorePoster) {
        let Some(at_default) = self.sessions.get(&key).map(|s| s.is_at_default()) else {
            return;
        };

        let delay = self.settings.restore_delay();
        if immediate || delay.is_zero() {
            self.cancel_restore(key);
            self.restore_now(key);
            return;
        }
        if at_default {
            return;
        }
        self.schedule_restore(key, delay, poster);
    }

    fn restore_now(&mut self, key: SessionKey) {
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        if let Err(e) = session.restore() {
            tracing::warn!(
                session = %session.identity().display_name,
                error = %e,
                "failed to restore session volume"
            );
        }
    }

    fn schedule_restore(&mut self, key: SessionKey, delay: Duration, poster: &CorePoster) {
        self.cancel_restore(key);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // not on the dispatcher runtime, nothing can wait for the delay
            self.restore_now(key);
            return;
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        let poster = poster.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            poster.post(move |core, _| core.fire_restore(key, generation));
        });
        self.pending_restores
            .insert(key, PendingRestore { generation, task });
    }

    /// Timer elapsed; acts only if this exact restore is still pending
    fn fire_restore(&mut self, key: SessionKey, generation: u64) {
        match self.pending_restores.get(&key) {
            Some(pending) if pending.generation == generation => {
                self.pending_restores.remove(&key);
                self.restore_now(key);
            }
            _ => {
                tracing::trace!(?key, generation, "stale restore timer ignored");
            }
        }
    }

    fn cancel_restore(&mut self, key: SessionKey) {
        if let Some(pending) = self.pending_restores.remove(&key) {
            pending.task.abort();
        }
    }

    fn cancel_all_restores(&mut self) {
        for (_, pending) in self.pending_restores.drain() {
            pending.task.abort();
        }
    }

    // -------------------------------------------------------------------------
    // Notifications
    // -------------------------------------------------------------------------

    fn on_session_created(&mut self, mut handle: Box<dyn SessionHandle>) {
        if self.state == MonitorState::Stopped {
            handle.release();
            return;
        }
        self.save_session(handle, None);
    }

    fn on_volume_changed(&mut self, key: SessionKey, volume: f32, context: Option<EventContext>) {
        if context.is_some_and(|c| c.is_engine()) {
            return;
        }
        self.cancel_restore(key);
        if let Some(session) = self.sessions.get_mut(&key) {
            tracing::debug!(
                session = %session.identity().display_name,
                volume,
                "volume changed externally"
            );
            session.adopt_external_volume(volume);
        }
    }

    fn on_activity_changed(
        &mut self,
        key: SessionKey,
        activity: ActivityState,
        poster: &CorePoster,
    ) {
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        session.set_activity(activity, Instant::now());
        match activity {
            ActivityState::Active => self.apply_volume(key),
            ActivityState::Inactive => self.restore_volume(key, false, poster),
        }
    }
}

impl Drop for MonitorCore {
    fn drop(&mut self) {
        self.sessions_api.unsubscribe_new_sessions();
        self.cancel_all_restores();
        self.clear_sessions();
    }
}

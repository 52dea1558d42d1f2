//! Per-device session monitor
//!
//! A [`Monitor`] tracks every audio session of one output device and ducks
//! them while it is Running. All of its work happens on a dedicated
//! dispatcher thread; the public methods marshal onto that thread and wait.
//!
//! Construction never fails outright. If the device cannot be resolved,
//! claimed or opened, the monitor stays in `InitError` forever and every
//! operation is a no-op reporting that state.

mod claims;
mod dispatcher;
mod filter;
mod registry;
mod session;

use hush_common::{MonitorState, Settings};

use self::claims::DeviceClaim;
use self::dispatcher::Dispatcher;
use self::registry::{CorePoster, MonitorCore, StateMirror};
use crate::backend::{AudioBackend, DeviceInfo, resolve_device};
use crate::constants::{DISPATCHER_THREAD_PREFIX, SESSION_SWEEP_INTERVAL};
use crate::error::MonitorError;
use crate::talk::DuckingControl;

pub use claims::is_device_monitored;
pub use session::{SessionKey, SessionSnapshot};

enum Inner {
    Ready {
        device: DeviceInfo,
        dispatcher: Dispatcher<MonitorCore>,
        state: StateMirror,
        _claim: DeviceClaim,
    },
    Failed {
        error: MonitorError,
        settings: Settings,
    },
}

/// Ducking monitor for one output device
pub struct Monitor {
    requested_device_id: String,
    inner: Inner,
}

impl Monitor {
    /// Create a monitor for a device (empty id = current default output device)
    ///
    /// The monitor starts out `Stopped`, or `InitError` if the device could not
    /// be set up (see [`Monitor::init_error`]).
    pub fn new(backend: &dyn AudioBackend, device_id: &str, settings: Settings) -> Self {
        let settings = settings.validated();
        let inner = match Self::init(backend, device_id, settings.clone()) {
            Ok(inner) => inner,
            Err(error) => {
                tracing::error!(device = %device_id, %error, "monitor initialization failed");
                Inner::Failed { error, settings }
            }
        };

        Self {
            requested_device_id: device_id.to_string(),
            inner,
        }
    }

    fn init(
        backend: &dyn AudioBackend,
        device_id: &str,
        settings: Settings,
    ) -> Result<Inner, MonitorError> {
        let device = resolve_device(backend, device_id)?;
        let claim = DeviceClaim::acquire(&device.id)?;
        let sessions_api = backend.open_device(&device.id)?;

        let core_device = device.clone();
        let state = StateMirror::default();
        let core_state = state.clone();
        let dispatcher = Dispatcher::spawn(
            format!("{}-{}", DISPATCHER_THREAD_PREFIX, device.id),
            SESSION_SWEEP_INTERVAL,
            MonitorCore::on_tick,
            move |poster| MonitorCore::new(core_device, sessions_api, poster, settings, core_state),
        )
        .map_err(MonitorError::DispatcherFailed)?;

        tracing::info!(device = %device.id, name = %device.name, "monitoring audio device");
        Ok(Inner::Ready {
            device,
            dispatcher,
            state,
            _claim: claim,
        })
    }

    fn call<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut MonitorCore, &CorePoster) -> R + Send + 'static,
    ) -> Option<R> {
        match &self.inner {
            Inner::Ready { dispatcher, .. } => dispatcher.call(task),
            Inner::Failed { .. } => None,
        }
    }

    /// State as of the last completed transition
    ///
    /// Answers for calls that could not run right away, e.g. a call made from
    /// inside a task of this monitor, which is queued behind that task.
    fn last_state(&self) -> MonitorState {
        match &self.inner {
            Inner::Ready { state, .. } => state.get(),
            Inner::Failed { .. } => MonitorState::InitError,
        }
    }

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------

    /// Begin ducking (refreshing sessions first when Stopped)
    pub fn start(&self) -> MonitorState {
        self.call(|core, _| core.start())
            .unwrap_or_else(|| self.last_state())
    }

    /// Restore every ducked session but keep tracking
    pub fn pause(&self) -> MonitorState {
        self.call(|core, poster| core.pause(poster))
            .unwrap_or_else(|| self.last_state())
    }

    /// Restore and forget every session and stop listening for new ones
    pub fn stop(&self) -> MonitorState {
        self.call(|core, _| core.stop())
            .unwrap_or_else(|| self.last_state())
    }

    pub fn status(&self) -> MonitorState {
        self.call(|core, _| core.state())
            .unwrap_or_else(|| self.last_state())
    }

    // -------------------------------------------------------------------------
    // Settings
    // -------------------------------------------------------------------------

    /// Apply new settings; returns them clamped to their legal ranges
    pub fn set_settings(&self, settings: Settings) -> Settings {
        match &self.inner {
            Inner::Ready { dispatcher, .. } => {
                let fallback = settings.clone().validated();
                dispatcher
                    .call(move |core, poster| core.set_settings(settings, poster))
                    .unwrap_or(fallback)
            }
            Inner::Failed { .. } => settings.validated(),
        }
    }

    pub fn settings(&self) -> Settings {
        match &self.inner {
            Inner::Ready { dispatcher, .. } => dispatcher
                .call(|core, _| core.settings().clone())
                .unwrap_or_default(),
            Inner::Failed { settings, .. } => settings.clone(),
        }
    }

    pub fn volume_reduction(&self) -> f32 {
        self.settings().volume_reduction
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Snapshot of every tracked session
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.call(|core, _| core.snapshots()).unwrap_or_default()
    }

    /// Release every session and enumerate the device again
    ///
    /// Does nothing while Stopped. Returns the number of tracked sessions.
    pub fn refresh_sessions(&self) -> usize {
        self.call(|core, _| match core.state() {
            MonitorState::Stopped => 0,
            _ => core.refresh_sessions(),
        })
        .unwrap_or(0)
    }

    /// Run the inactive-session sweep now; returns the number of removed sessions
    pub fn sweep_expired(&self) -> usize {
        self.call(|core, _| core.sweep_expired(std::time::Instant::now()))
            .unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Device
    // -------------------------------------------------------------------------

    /// Resolved device id, unless initialization failed
    pub fn device_id(&self) -> Option<&str> {
        match &self.inner {
            Inner::Ready { device, .. } => Some(&device.id),
            Inner::Failed { .. } => None,
        }
    }

    pub fn device_name(&self) -> Option<&str> {
        match &self.inner {
            Inner::Ready { device, .. } => Some(&device.name),
            Inner::Failed { .. } => None,
        }
    }

    /// The id this monitor was created with (may be the empty default id)
    pub fn requested_device_id(&self) -> &str {
        &self.requested_device_id
    }

    pub fn init_error(&self) -> Option<&MonitorError> {
        match &self.inner {
            Inner::Ready { .. } => None,
            Inner::Failed { error, .. } => Some(error),
        }
    }
}

impl DuckingControl for Monitor {
    fn start_ducking(&self) {
        Monitor::start(self);
    }

    fn pause_ducking(&self) {
        Monitor::pause(self);
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Inner::Ready { device, dispatcher, .. } = &mut self.inner {
            dispatcher.call(|core, _| core.stop());
            dispatcher.shutdown();
            tracing::info!(device = %device.id, "stopped monitoring audio device");
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("requested_device_id", &self.requested_device_id)
            .field("device_id", &self.device_id())
            .field("init_error", &self.init_error())
            .finish()
    }
}

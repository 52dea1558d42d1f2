//! Host surface
//!
//! [`DuckingHost`] is the one object a voice-chat client embeds. It owns the
//! talk aggregator and a monitor per selected output device, and fans the
//! aggregator's start/pause decision out to every monitor.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use hush_common::{ChannelKey, ClientId, MonitorState, ServerUid, Settings, ToggleStatus};

use crate::backend::{AudioBackend, DeviceInfo};
use crate::error::{BackendError, MonitorError};
use crate::monitor::Monitor;
use crate::talk::{DuckingControl, TalkAggregator};

/// The monitors of every selected device
#[derive(Default)]
pub struct MonitorSet {
    monitors: RwLock<Vec<Arc<Monitor>>>,
}

impl MonitorSet {
    fn snapshot(&self) -> Vec<Arc<Monitor>> {
        self.monitors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn push(&self, monitor: Arc<Monitor>) {
        self.monitors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(monitor);
    }

    fn take(&self, device_id: &str) -> Vec<Arc<Monitor>> {
        let mut monitors = self
            .monitors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (removed, kept): (Vec<_>, Vec<_>) =
            monitors.drain(..).partition(|m| monitors_device(m, device_id));
        *monitors = kept;
        removed
    }

    fn find(&self, device_id: &str) -> Option<Arc<Monitor>> {
        self.snapshot()
            .into_iter()
            .find(|m| monitors_device(m, device_id))
    }
}

/// Match by the id a monitor was created with or the id it resolved to
fn monitors_device(monitor: &Monitor, device_id: &str) -> bool {
    monitor.requested_device_id() == device_id || monitor.device_id() == Some(device_id)
}

impl DuckingControl for MonitorSet {
    fn start_ducking(&self) {
        for monitor in self.snapshot() {
            monitor.start();
        }
    }

    fn pause_ducking(&self) {
        for monitor in self.snapshot() {
            monitor.pause();
        }
    }
}

/// Ducking engine for a voice-chat client
pub struct DuckingHost {
    backend: Arc<dyn AudioBackend>,
    monitors: Arc<MonitorSet>,
    aggregator: TalkAggregator<Arc<MonitorSet>>,
    settings: Mutex<Settings>,
}

impl DuckingHost {
    pub fn new(backend: Arc<dyn AudioBackend>, settings: Settings) -> Self {
        let settings = settings.validated();
        let monitors = Arc::new(MonitorSet::default());
        Self {
            backend,
            aggregator: TalkAggregator::new(monitors.clone(), settings.exclude_own_client),
            monitors,
            settings: Mutex::new(settings),
        }
    }

    fn lock_settings(&self) -> MutexGuard<'_, Settings> {
        self.settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Output devices offered by the audio subsystem
    pub fn output_devices(&self) -> Result<Vec<DeviceInfo>, BackendError> {
        self.backend.output_devices()
    }

    /// Start monitoring a device (empty id = current default output device)
    ///
    /// If someone is talking, the new monitor starts ducking right away.
    pub fn add_device(&self, device_id: &str) -> Result<MonitorState, MonitorError> {
        let settings = self.settings();
        let monitor = Monitor::new(self.backend.as_ref(), device_id, settings);
        if let Some(error) = monitor.init_error() {
            return Err(error.clone());
        }

        let monitor = Arc::new(monitor);
        self.monitors.push(monitor.clone());
        if self.aggregator.is_ducking() {
            return Ok(Monitor::start(&monitor));
        }
        Ok(monitor.status())
    }

    /// Stop monitoring a device; returns whether it was monitored
    pub fn remove_device(&self, device_id: &str) -> bool {
        let removed = self.monitors.take(device_id);
        // dropping the last reference stops the monitor and restores volumes
        !removed.is_empty()
    }

    /// Resolved ids of every monitored device
    pub fn monitored_devices(&self) -> Vec<String> {
        self.monitors
            .snapshot()
            .iter()
            .filter_map(|m| m.device_id().map(str::to_string))
            .collect()
    }

    pub fn device_status(&self, device_id: &str) -> Option<MonitorState> {
        self.monitors.find(device_id).map(|m| m.status())
    }

    /// The monitor of a device, for inspection
    pub fn monitor(&self, device_id: &str) -> Option<Arc<Monitor>> {
        self.monitors.find(device_id)
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Apply settings to every monitor; returns them clamped
    pub fn set_settings(&self, settings: Settings) -> Settings {
        let settings = settings.validated();
        *self.lock_settings() = settings.clone();
        self.aggregator
            .set_exclude_own_client(settings.exclude_own_client);
        for monitor in self.monitors.snapshot() {
            monitor.set_settings(settings.clone());
        }
        settings
    }

    pub fn settings(&self) -> Settings {
        self.lock_settings().clone()
    }

    // =========================================================================
    // Talk activity
    // =========================================================================

    pub fn process_talk_event(
        &self,
        talking: bool,
        channel: ChannelKey,
        client: ClientId,
        is_self: bool,
    ) {
        self.aggregator
            .process_talk_event(talking, channel, client, is_self);
    }

    pub fn set_client_status(&self, client: ClientId, status: ToggleStatus) {
        self.aggregator.set_client_status(client, status);
    }

    pub fn set_channel_status(&self, channel: ChannelKey, status: ToggleStatus) {
        self.aggregator.set_channel_status(channel, status);
    }

    pub fn reset_all_clients_settings(&self) {
        self.aggregator.reset_all_clients_settings();
    }

    pub fn reset_all_channels_settings(&self) {
        self.aggregator.reset_all_channels_settings();
    }

    pub fn server_disconnected(&self, server: &ServerUid) {
        self.aggregator.server_disconnected(server);
    }

    /// Globally enable or disable ducking
    pub fn set_status(&self, status: ToggleStatus) {
        self.aggregator.set_status(status);
    }

    pub fn status(&self) -> ToggleStatus {
        self.aggregator.status()
    }

    pub fn is_ducking(&self) -> bool {
        self.aggregator.is_ducking()
    }
}

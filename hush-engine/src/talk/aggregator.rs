//! Talk activity aggregator
//!
//! Tracks who is talking and in which channels, split into an enabled and a
//! disabled partition by the user's per-client and per-channel toggles. Only
//! the enabled partitions decide whether ducking is active.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use hush_common::{ChannelKey, ClientId, ServerUid, ToggleStatus};

use super::DuckingControl;

/// An enabled and a disabled half of the same structure
///
/// An id lives in at most one half at a time.
#[derive(Debug, Default)]
struct Partitioned<T> {
    enabled: T,
    disabled: T,
}

impl<T> Partitioned<T> {
    fn pick_mut(&mut self, enabled: bool) -> &mut T {
        if enabled {
            &mut self.enabled
        } else {
            &mut self.disabled
        }
    }

    /// (source, destination) for a move into the given half
    fn split_toward(&mut self, enabled: bool) -> (&mut T, &mut T) {
        if enabled {
            (&mut self.disabled, &mut self.enabled)
        } else {
            (&mut self.enabled, &mut self.disabled)
        }
    }
}

type ChannelActivity = HashMap<ChannelKey, HashSet<ClientId>>;

#[derive(Debug, Default)]
struct AggregatorState {
    talking_clients: Partitioned<HashSet<ClientId>>,
    channels_with_activity: Partitioned<ChannelActivity>,
    ignored_clients: HashSet<ClientId>,
    ignored_channels: HashSet<ChannelKey>,
    someone_enabled_is_talking: bool,
    status: ToggleStatus,
    exclude_own_client: bool,
}

impl AggregatorState {
    fn is_talking(&self, client: &ClientId) -> bool {
        self.talking_clients.enabled.contains(client)
            || self.talking_clients.disabled.contains(client)
    }

    fn should_duck(&self) -> bool {
        !self.talking_clients.enabled.is_empty() && !self.channels_with_activity.enabled.is_empty()
    }

    fn remove_from_channels(&mut self, client: &ClientId) {
        for map in [
            &mut self.channels_with_activity.enabled,
            &mut self.channels_with_activity.disabled,
        ] {
            map.retain(|_, clients| {
                clients.remove(client);
                !clients.is_empty()
            });
        }
    }
}

/// Folds talk events into a single start/pause decision
pub struct TalkAggregator<C: DuckingControl> {
    control: C,
    state: Mutex<AggregatorState>,
}

impl<C: DuckingControl> TalkAggregator<C> {
    pub fn new(control: C, exclude_own_client: bool) -> Self {
        Self {
            control,
            state: Mutex::new(AggregatorState {
                exclude_own_client,
                ..Default::default()
            }),
        }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Talk events
    // =========================================================================

    /// Record that a client started or stopped talking
    ///
    /// Our own events are ignored while own-client exclusion is on, unless we
    /// are already tracked as talking (so a stop is never lost).
    pub fn process_talk_event(
        &self,
        talking: bool,
        channel: ChannelKey,
        client: ClientId,
        is_self: bool,
    ) {
        let mut state = self.lock();
        if is_self && state.exclude_own_client && !state.is_talking(&client) {
            return;
        }

        if talking {
            let client_enabled = !state.ignored_clients.contains(&client);
            let (other, target) = state.talking_clients.split_toward(client_enabled);
            other.remove(&client);
            target.insert(client.clone());

            let channel_enabled = !state.ignored_channels.contains(&channel);
            state
                .channels_with_activity
                .pick_mut(channel_enabled)
                .entry(channel)
                .or_default()
                .insert(client);
        } else {
            state.talking_clients.enabled.remove(&client);
            state.talking_clients.disabled.remove(&client);
            // The reported channel can be the destination of a move, so look
            // everywhere the client is recorded.
            state.remove_from_channels(&client);
        }

        self.apply_status_locked(&mut state);
    }

    /// Forget every channel of a server and anyone talking only there
    pub fn server_disconnected(&self, server: &ServerUid) {
        let mut guard = self.lock();
        let state = &mut *guard;

        let mut dropped: HashSet<ClientId> = HashSet::new();
        for map in [
            &mut state.channels_with_activity.enabled,
            &mut state.channels_with_activity.disabled,
        ] {
            map.retain(|channel, clients| {
                if channel.is_on(server) {
                    dropped.extend(clients.drain());
                    false
                } else {
                    true
                }
            });
        }

        for client in dropped {
            let channels = &state.channels_with_activity;
            let elsewhere = channels
                .enabled
                .values()
                .chain(channels.disabled.values())
                .any(|clients| clients.contains(&client));
            if !elsewhere {
                state.talking_clients.enabled.remove(&client);
                state.talking_clients.disabled.remove(&client);
            }
        }

        tracing::debug!(%server, "server talk activity cleared");
        self.apply_status_locked(state);
    }

    // =========================================================================
    // Per-client and per-channel toggles
    // =========================================================================

    pub fn set_client_status(&self, client: ClientId, status: ToggleStatus) {
        let mut state = self.lock();
        let enabled = status.is_enabled();
        if enabled {
            state.ignored_clients.remove(&client);
        } else {
            state.ignored_clients.insert(client.clone());
        }

        let (source, target) = state.talking_clients.split_toward(enabled);
        if source.remove(&client) {
            target.insert(client);
        }

        self.apply_status_locked(&mut state);
    }

    pub fn set_channel_status(&self, channel: ChannelKey, status: ToggleStatus) {
        let mut state = self.lock();
        let enabled = status.is_enabled();
        if enabled {
            state.ignored_channels.remove(&channel);
        } else {
            state.ignored_channels.insert(channel.clone());
        }

        let (source, target) = state.channels_with_activity.split_toward(enabled);
        if let Some(clients) = source.remove(&channel) {
            target.entry(channel).or_default().extend(clients);
        }

        self.apply_status_locked(&mut state);
    }

    /// Enable every client again
    pub fn reset_all_clients_settings(&self) {
        let mut state = self.lock();
        state.ignored_clients.clear();
        let talking = &mut state.talking_clients;
        talking.enabled.extend(talking.disabled.drain());
        self.apply_status_locked(&mut state);
    }

    /// Enable every channel again
    pub fn reset_all_channels_settings(&self) {
        let mut state = self.lock();
        state.ignored_channels.clear();
        let channels = &mut state.channels_with_activity;
        for (channel, clients) in channels.disabled.drain() {
            channels.enabled.entry(channel).or_default().extend(clients);
        }
        self.apply_status_locked(&mut state);
    }

    // =========================================================================
    // Decision
    // =========================================================================

    /// Recompute the decision and start or pause ducking if it changed
    pub fn apply_status(&self) {
        let mut state = self.lock();
        self.apply_status_locked(&mut state);
    }

    fn apply_status_locked(&self, state: &mut AggregatorState) {
        let active = state.should_duck();
        if active == state.someone_enabled_is_talking {
            return;
        }
        state.someone_enabled_is_talking = active;

        if !state.status.is_enabled() {
            return;
        }
        if active {
            tracing::debug!("talk activity, ducking");
            self.control.start_ducking();
        } else {
            tracing::debug!("talk activity ended, restoring");
            self.control.pause_ducking();
        }
    }

    /// Globally enable or disable ducking
    ///
    /// Enabling while someone is talking starts ducking right away; disabling
    /// while ducked pauses so no volume stays reduced.
    pub fn set_status(&self, status: ToggleStatus) {
        let mut state = self.lock();
        if state.status == status {
            return;
        }
        state.status = status;

        if state.someone_enabled_is_talking {
            if status.is_enabled() {
                self.control.start_ducking();
            } else {
                self.control.pause_ducking();
            }
        }
    }

    pub fn status(&self) -> ToggleStatus {
        self.lock().status
    }

    pub fn set_exclude_own_client(&self, exclude: bool) {
        self.lock().exclude_own_client = exclude;
    }

    /// Whether ducking is currently requested
    pub fn is_ducking(&self) -> bool {
        let state = self.lock();
        state.someone_enabled_is_talking && state.status.is_enabled()
    }

    /// Talking clients across both partitions
    pub fn talking_count(&self) -> usize {
        let state = self.lock();
        state.talking_clients.enabled.len() + state.talking_clients.disabled.len()
    }
}

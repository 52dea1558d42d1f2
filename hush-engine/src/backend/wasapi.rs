//! WASAPI audio subsystem (Windows)
//!
//! Sessions come from `IAudioSessionManager2` of a render endpoint; volume goes
//! through `ISimpleAudioVolume` and writes are tagged with an event context
//! GUID so their echo can be told apart from user changes.
//!
//! Every thread that touches COM joins the multithreaded apartment first.
//! Interface pointers obtained in the MTA may be used from any MTA thread,
//! which is what makes the `Send` wrappers below sound.

use std::cell::Cell;

use uuid::Uuid;
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;
use windows::core::{BOOL, GUID, HSTRING, Interface, PCWSTR, PWSTR, Ref, implement};

use super::{
    ActivityState, AudioBackend, DeviceInfo, DeviceSessions, EventContext, NewSessionSink,
    SessionEventSink, SessionHandle, SessionIdentity,
};
use crate::error::BackendError;

thread_local! {
    static COM_READY: Cell<bool> = const { Cell::new(false) };
}

/// Join the multithreaded apartment on this thread (once)
fn ensure_com() -> Result<(), BackendError> {
    if COM_READY.with(Cell::get) {
        return Ok(());
    }
    // RPC_E_CHANGED_MODE means the host already initialized this thread as
    // STA; calls still work through the proxies.
    let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
    if hr.is_err() && hr != windows::Win32::Foundation::RPC_E_CHANGED_MODE {
        return Err(BackendError::native("CoInitializeEx", hr.message()));
    }
    COM_READY.with(|ready| ready.set(true));
    Ok(())
}

fn native(operation: &'static str) -> impl FnOnce(windows::core::Error) -> BackendError {
    move |e| BackendError::native(operation, e.to_string())
}

/// Take ownership of a COM-allocated string
fn take_pwstr(value: PWSTR) -> String {
    if value.is_null() {
        return String::new();
    }
    let text = unsafe { value.to_string() }.unwrap_or_default();
    unsafe { CoTaskMemFree(Some(value.0 as *const _)) };
    text
}

fn context_guid(context: EventContext) -> GUID {
    GUID::from_u128(context.0.as_u128())
}

/// COM interface pointer created in the MTA
struct Mta<T>(T);

unsafe impl<T> Send for Mta<T> {}
unsafe impl<T> Sync for Mta<T> {}

// =============================================================================
// Backend
// =============================================================================

/// Windows audio subsystem
#[derive(Debug, Default, Clone, Copy)]
pub struct WasapiBackend;

impl WasapiBackend {
    pub fn new() -> Result<Self, BackendError> {
        ensure_com()?;
        Ok(Self)
    }

    fn enumerator() -> Result<IMMDeviceEnumerator, BackendError> {
        ensure_com()?;
        unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
            .map_err(native("CoCreateInstance"))
    }

    fn describe(device: &IMMDevice) -> Result<DeviceInfo, BackendError> {
        let id = take_pwstr(unsafe { device.GetId() }.map_err(native("IMMDevice::GetId"))?);
        let name = unsafe { device.OpenPropertyStore(STGM_READ) }
            .and_then(|store| unsafe { store.GetValue(&PKEY_Device_FriendlyName) })
            .map(|value| value.to_string())
            .unwrap_or_else(|_| id.clone());
        Ok(DeviceInfo::new(id, name))
    }
}

impl AudioBackend for WasapiBackend {
    fn output_devices(&self) -> Result<Vec<DeviceInfo>, BackendError> {
        let enumerator = Self::enumerator()?;
        let collection = unsafe { enumerator.EnumAudioEndpoints(eRender, DEVICE_STATE_ACTIVE) }
            .map_err(native("EnumAudioEndpoints"))?;
        let count = unsafe { collection.GetCount() }.map_err(native("GetCount"))?;

        let mut devices = Vec::with_capacity(count as usize);
        for i in 0..count {
            match unsafe { collection.Item(i) } {
                Ok(device) => devices.push(Self::describe(&device)?),
                Err(e) => tracing::debug!(index = i, error = %e, "skipping audio endpoint"),
            }
        }
        Ok(devices)
    }

    fn default_output_device(&self) -> Result<DeviceInfo, BackendError> {
        let enumerator = Self::enumerator()?;
        let device = unsafe { enumerator.GetDefaultAudioEndpoint(eRender, eConsole) }
            .map_err(|_| BackendError::DeviceNotFound(String::new()))?;
        Self::describe(&device)
    }

    fn open_device(&self, device_id: &str) -> Result<Box<dyn DeviceSessions>, BackendError> {
        let enumerator = Self::enumerator()?;
        let device = unsafe { enumerator.GetDevice(&HSTRING::from(device_id)) }
            .map_err(|_| BackendError::DeviceNotFound(device_id.to_string()))?;
        let manager: IAudioSessionManager2 = unsafe { device.Activate(CLSCTX_ALL, None) }
            .map_err(native("IMMDevice::Activate"))?;

        Ok(Box::new(WasapiDevice {
            manager: Mta(manager),
            notification: None,
        }))
    }
}

// =============================================================================
// Device Sessions
// =============================================================================

struct WasapiDevice {
    manager: Mta<IAudioSessionManager2>,
    notification: Option<Mta<IAudioSessionNotification>>,
}

impl DeviceSessions for WasapiDevice {
    fn enumerate_sessions(&mut self) -> Result<Vec<Box<dyn SessionHandle>>, BackendError> {
        ensure_com()?;
        let sessions = unsafe { self.manager.0.GetSessionEnumerator() }
            .map_err(native("GetSessionEnumerator"))?;
        let count = unsafe { sessions.GetCount() }.map_err(native("GetCount"))?;

        let mut handles: Vec<Box<dyn SessionHandle>> = Vec::with_capacity(count.max(0) as usize);
        for i in 0..count {
            let handle = unsafe { sessions.GetSession(i) }
                .map_err(native("GetSession"))
                .and_then(WasapiSessionHandle::new);
            match handle {
                Ok(handle) => handles.push(Box::new(handle)),
                Err(e) => tracing::debug!(index = i, error = %e, "skipping audio session"),
            }
        }
        Ok(handles)
    }

    fn subscribe_new_sessions(&mut self, sink: NewSessionSink) -> Result<(), BackendError> {
        ensure_com()?;
        self.unsubscribe_new_sessions();
        let notification: IAudioSessionNotification = NewSessionCallback { sink }.into();
        unsafe { self.manager.0.RegisterSessionNotification(&notification) }
            .map_err(native("RegisterSessionNotification"))?;
        self.notification = Some(Mta(notification));
        Ok(())
    }

    fn unsubscribe_new_sessions(&mut self) {
        if let Some(notification) = self.notification.take() {
            let _ = ensure_com();
            let result = unsafe {
                self.manager
                    .0
                    .UnregisterSessionNotification(&notification.0)
            };
            if let Err(e) = result {
                tracing::debug!(error = %e, "UnregisterSessionNotification failed");
            }
        }
    }
}

impl Drop for WasapiDevice {
    fn drop(&mut self) {
        self.unsubscribe_new_sessions();
    }
}

#[implement(IAudioSessionNotification)]
struct NewSessionCallback {
    sink: NewSessionSink,
}

impl IAudioSessionNotification_Impl for NewSessionCallback_Impl {
    fn OnSessionCreated(
        &self,
        newsession: Ref<'_, IAudioSessionControl>,
    ) -> windows::core::Result<()> {
        let control = newsession.ok()?.clone();
        match WasapiSessionHandle::new(control) {
            Ok(handle) => self.sink.session_created(Box::new(handle)),
            Err(e) => tracing::debug!(error = %e, "ignoring new audio session"),
        }
        Ok(())
    }
}

// =============================================================================
// Session Handle
// =============================================================================

struct SessionInterfaces {
    control: IAudioSessionControl2,
    volume: ISimpleAudioVolume,
    events: Option<IAudioSessionEvents>,
}

struct WasapiSessionHandle {
    inner: Option<Mta<SessionInterfaces>>,
}

impl WasapiSessionHandle {
    fn new(control: IAudioSessionControl) -> Result<Self, BackendError> {
        let volume: ISimpleAudioVolume = control.cast().map_err(native("ISimpleAudioVolume"))?;
        let control: IAudioSessionControl2 = control
            .cast()
            .map_err(native("IAudioSessionControl2"))?;
        Ok(Self {
            inner: Some(Mta(SessionInterfaces {
                control,
                volume,
                events: None,
            })),
        })
    }

    fn interfaces(&self) -> Result<&SessionInterfaces, BackendError> {
        ensure_com()?;
        self.inner
            .as_ref()
            .map(|i| &i.0)
            .ok_or(BackendError::SessionGone)
    }
}

impl SessionHandle for WasapiSessionHandle {
    fn identity(&self) -> Result<SessionIdentity, BackendError> {
        let i = self.interfaces()?;
        let process_id = unsafe { i.control.GetProcessId() }.unwrap_or(0);
        let group_id = take_pwstr(
            unsafe { i.control.GetSessionIdentifier() }.map_err(native("GetSessionIdentifier"))?,
        );
        let instance_id = take_pwstr(
            unsafe { i.control.GetSessionInstanceIdentifier() }
                .map_err(native("GetSessionInstanceIdentifier"))?,
        );
        let display_name = unsafe { i.control.GetDisplayName() }
            .map(take_pwstr)
            .ok()
            .filter(|name| !name.is_empty() && !name.starts_with('@'))
            .unwrap_or_else(|| image_name(&group_id));

        Ok(SessionIdentity {
            process_id,
            group_id,
            instance_id,
            display_name,
        })
    }

    fn volume(&self) -> Result<f32, BackendError> {
        let i = self.interfaces()?;
        unsafe { i.volume.GetMasterVolume() }.map_err(native("GetMasterVolume"))
    }

    fn set_volume(&mut self, volume: f32, context: EventContext) -> Result<(), BackendError> {
        let i = self.interfaces()?;
        let guid = context_guid(context);
        unsafe { i.volume.SetMasterVolume(volume.clamp(0.0, 1.0), &guid) }
            .map_err(native("SetMasterVolume"))
    }

    fn activity(&self) -> Result<ActivityState, BackendError> {
        let i = self.interfaces()?;
        let state = unsafe { i.control.GetState() }.map_err(native("GetState"))?;
        Ok(activity_from(state).unwrap_or(ActivityState::Inactive))
    }

    fn subscribe(&mut self, sink: SessionEventSink) -> Result<(), BackendError> {
        ensure_com()?;
        let Some(Mta(i)) = self.inner.as_mut() else {
            return Err(BackendError::SessionGone);
        };
        let events: IAudioSessionEvents = SessionCallback { sink }.into();
        unsafe { i.control.RegisterAudioSessionNotification(&events) }
            .map_err(native("RegisterAudioSessionNotification"))?;
        i.events = Some(events);
        Ok(())
    }

    fn release(&mut self) {
        let Some(Mta(i)) = self.inner.take() else {
            return;
        };
        let _ = ensure_com();
        if let Some(events) = &i.events {
            if let Err(e) = unsafe { i.control.UnregisterAudioSessionNotification(events) } {
                tracing::debug!(error = %e, "UnregisterAudioSessionNotification failed");
            }
        }
    }
}

impl Drop for WasapiSessionHandle {
    fn drop(&mut self) {
        if self.inner.is_some() {
            tracing::warn!("audio session handle dropped without release");
            self.release();
        }
    }
}

fn activity_from(state: AudioSessionState) -> Option<ActivityState> {
    if state == AudioSessionStateActive {
        Some(ActivityState::Active)
    } else if state == AudioSessionStateInactive {
        Some(ActivityState::Inactive)
    } else {
        None
    }
}

/// Executable name from a session identifier (`...|\Device\...\app.exe%b{...}`)
fn image_name(group_id: &str) -> String {
    let path = group_id.split('%').next().unwrap_or(group_id);
    path.rsplit('\\').next().unwrap_or(path).to_string()
}

#[implement(IAudioSessionEvents)]
struct SessionCallback {
    sink: SessionEventSink,
}

impl IAudioSessionEvents_Impl for SessionCallback_Impl {
    fn OnDisplayNameChanged(
        &self,
        _newdisplayname: &PCWSTR,
        _eventcontext: *const GUID,
    ) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnIconPathChanged(
        &self,
        _newiconpath: &PCWSTR,
        _eventcontext: *const GUID,
    ) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnSimpleVolumeChanged(
        &self,
        newvolume: f32,
        _newmute: BOOL,
        eventcontext: *const GUID,
    ) -> windows::core::Result<()> {
        let context = if eventcontext.is_null() {
            None
        } else {
            let guid = unsafe { *eventcontext };
            Some(EventContext(Uuid::from_u128(guid.to_u128())))
        };
        self.sink.volume_changed(newvolume, context);
        Ok(())
    }

    fn OnChannelVolumeChanged(
        &self,
        _channelcount: u32,
        _newchannelvolumearray: *const f32,
        _changedchannel: u32,
        _eventcontext: *const GUID,
    ) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnGroupingParamChanged(
        &self,
        _newgroupingparam: *const GUID,
        _eventcontext: *const GUID,
    ) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnStateChanged(&self, newstate: AudioSessionState) -> windows::core::Result<()> {
        match activity_from(newstate) {
            Some(activity) => self.sink.activity_changed(activity),
            // AudioSessionStateExpired
            None => self.sink.disconnected(),
        }
        Ok(())
    }

    fn OnSessionDisconnected(
        &self,
        _disconnectreason: AudioSessionDisconnectReason,
    ) -> windows::core::Result<()> {
        self.sink.disconnected();
        Ok(())
    }
}

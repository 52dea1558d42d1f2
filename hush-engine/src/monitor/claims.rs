//! Process-wide registry of monitored devices
//!
//! At most one monitor per output device may exist in a process. A monitor
//! claims its device during construction and the claim is dropped with it.
//! Tests touching this registry must run serially or use distinct device ids.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::error::MonitorError;

static MONITORED_DEVICES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn devices() -> MutexGuard<'static, HashSet<String>> {
    MONITORED_DEVICES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Whether some monitor in this process owns the device
pub fn is_device_monitored(device_id: &str) -> bool {
    devices().contains(device_id)
}

/// Exclusive claim on a device, released on drop
#[derive(Debug)]
pub(crate) struct DeviceClaim {
    device_id: String,
}

impl DeviceClaim {
    pub fn acquire(device_id: &str) -> Result<Self, MonitorError> {
        if !devices().insert(device_id.to_string()) {
            return Err(MonitorError::DeviceAlreadyInUse(device_id.to_string()));
        }
        Ok(Self {
            device_id: device_id.to_string(),
        })
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        devices().remove(&self.device_id);
    }
}

//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use hush_engine::{MemoryBackend, Settings};
use tracing_subscriber::EnvFilter;

static NEXT_DEVICE: AtomicUsize = AtomicUsize::new(0);

/// Route engine logs to the test output (`RUST_LOG=hush_engine=debug`)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A device id no other test uses (device claims are process-wide)
pub fn unique_device(tag: &str) -> String {
    format!("{}-{}", tag, NEXT_DEVICE.fetch_add(1, Ordering::SeqCst))
}

/// A memory backend with one device, returned with its id
pub fn backend_with_device(tag: &str) -> (MemoryBackend, String) {
    init_tracing();
    let backend = MemoryBackend::new();
    let device = unique_device(tag);
    backend.add_device(&device, "Speakers");
    (backend, device)
}

/// Default settings without a restore delay
pub fn no_delay() -> Settings {
    Settings {
        restore_delay_ms: 0,
        ..Default::default()
    }
}

pub fn approx(actual: Option<f32>, expected: f32) -> bool {
    actual.is_some_and(|v| (v - expected).abs() < 1e-4)
}

/// Poll until `check` holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

//! Shared test utilities for the portside test suites.
//!
//! This module provides common test infrastructure including:
//! - Host device builders for scripting the mock enumerator
//! - Engine constructors wired to a scripted mock host
//! - Settings builders for the different timeout modes

#![allow(dead_code)]

use std::time::Duration;

use portside::host::HostDeviceInfo;
use portside::{MockHost, PortEngine, PortInfo, PortSettings, TimeoutMode, TimeoutSettings};

/// Build a USB-attached device the way the host enumerator would report it.
///
/// # Arguments
/// * `port_name` - The host's port name (e.g. "COM7" or "/dev/ttyUSB0")
/// * `bus` - USB bus number
/// * `address` - Port number on the bus
pub fn usb_device(port_name: &str, bus: u32, address: u32) -> HostDeviceInfo {
    HostDeviceInfo {
        port_name: port_name.to_string(),
        friendly_name: Some(format!("USB Serial Device ({port_name})")),
        bus_description: Some("USB Serial Device".to_string()),
        bus_number: Some(bus),
        address: Some(address),
        location_info: None,
        serial_number: None,
    }
}

/// Build a bare device that reports nothing beyond its port name.
pub fn bare_device(port_name: &str) -> HostDeviceInfo {
    HostDeviceInfo {
        port_name: port_name.to_string(),
        ..HostDeviceInfo::default()
    }
}

/// Install a fmt subscriber so `RUST_LOG=portside=trace` makes failing
/// tests narrate engine activity. Repeat calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a mock host pre-loaded with `devices` and an engine bound to it.
pub fn engine_with_devices(devices: Vec<HostDeviceInfo>) -> (MockHost, PortEngine) {
    init_tracing();
    let host = MockHost::new();
    host.set_devices(devices);
    let engine = PortEngine::new(host.services());
    (host, engine)
}

/// Create a mock host exposing a single bare device and an engine bound to it.
pub fn engine_with_port(port_name: &str) -> (MockHost, PortEngine) {
    engine_with_devices(vec![bare_device(port_name)])
}

/// Settings with everything at defaults except the read timeout policy.
pub fn settings_with_timeouts(mode: TimeoutMode, read_ms: u64) -> PortSettings {
    PortSettings {
        timeouts: TimeoutSettings {
            mode,
            read: Duration::from_millis(read_ms),
            write: Duration::ZERO,
        },
        ..PortSettings::default()
    }
}

/// Extract the paths from a discovery snapshot, in listing order.
pub fn paths_of(infos: &[PortInfo]) -> Vec<String> {
    infos.iter().map(|info| info.path.clone()).collect()
}

//! Device discovery and registry reconciliation.
//!
//! A refresh walks the host's current device list and reconciles it against
//! the registry in place: known paths keep their record (only the physical
//! location is rewritten, and only when it changed), unknown paths get a new
//! record appended, and records whose device vanished are swept out unless a
//! session is still open on them. An optional vendor lookup then overlays
//! richer descriptions for devices it can identify by serial number.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

use crate::error::{os_code, ErrorSlot, PortError, Stage};
use crate::host::{DeviceEnumerator, HostDeviceInfo, VendorLookup};
use crate::record::{PortMeta, PortRecord};
use crate::registry::PortRegistry;

static HUB_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"Hub[^#]*#(\d+)").unwrap());
static PORT_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"Port[^#]*#(\d+)").unwrap());

fn token_number(pattern: &Regex, text: &str) -> Option<u32> {
    pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Build the `bus-hub.port` location string from whatever subset of location
/// data the host reported. The bus-reported address wins over a `Port#N`
/// token; every missing component becomes 0.
fn derive_location(device: &HostDeviceInfo) -> String {
    let bus = device.bus_number.unwrap_or(0);
    let mut hub = 0;
    let mut port = device.address;
    if let Some(info) = &device.location_info {
        if let Some(n) = token_number(&HUB_TOKEN, info) {
            hub = n;
        }
        if port.is_none() {
            port = token_number(&PORT_TOKEN, info);
        }
    }
    format!("{}-{}.{}", bus, hub, port.unwrap_or(0))
}

/// Parallel-port devices share enumeration classes with serial ones on some
/// hosts and must not be listed.
fn is_parallel(port_name: &str) -> bool {
    port_name.contains("LPT") || port_name.starts_with("/dev/lp")
}

/// Resolve one scanned device into registry properties, or `None` when the
/// device is filtered out.
fn describe_device(device: &HostDeviceInfo) -> Option<PortMeta> {
    if device.port_name.is_empty() || is_parallel(&device.port_name) {
        return None;
    }
    let friendly_name = device
        .friendly_name
        .clone()
        .unwrap_or_else(|| device.port_name.clone());
    let description = device
        .bus_description
        .clone()
        .unwrap_or_else(|| friendly_name.clone());
    Some(PortMeta {
        friendly_name,
        description,
        location: derive_location(device),
        serial_number: device.serial_number.clone(),
    })
}

/// Run one full discovery pass against `registry`.
///
/// On scan failure the registry is left exactly as it was, the failure is
/// recorded in `engine_errors`, and the error is returned; no partial sweep
/// can drop records for a transient enumeration problem.
pub(crate) fn refresh(
    registry: &PortRegistry,
    enumerator: &dyn DeviceEnumerator,
    vendor: Option<&dyn VendorLookup>,
    engine_errors: &ErrorSlot,
) -> Result<(), PortError> {
    // Open sessions survive a scan that misses their device.
    for record in registry.snapshot() {
        record.mark(record.is_open());
    }

    let devices = match enumerator.scan() {
        Ok(devices) => devices,
        Err(e) => {
            engine_errors.record(Stage::Enumerate, os_code(&e));
            return Err(PortError::Enumerate(e));
        }
    };
    trace!(count = devices.len(), "scanned devices");

    for device in &devices {
        let Some(meta) = describe_device(device) else {
            continue;
        };
        match registry.find(&device.port_name) {
            Some(record) => {
                record.mark(true);
                reconcile_location(&record, &meta.location);
            }
            None => {
                debug!(path = %device.port_name, location = %meta.location, "new port");
                let record = registry.find_or_insert_with(&device.port_name, || meta);
                record.mark(true);
            }
        }
    }

    if let Some(vendor) = vendor {
        apply_vendor_pass(registry, vendor);
    }

    registry.sweep();
    Ok(())
}

/// Rewrite the stored location only when it actually moved, so an unchanged
/// device causes no lock write traffic beyond the comparison.
fn reconcile_location(record: &Arc<PortRecord>, location: &str) {
    let mut meta = record.meta.lock();
    if meta.location != location {
        debug!(path = %record.path, from = %meta.location, to = %location, "port moved");
        meta.location = location.to_string();
    }
}

/// Overlay vendor-supplied descriptions.
///
/// Devices the vendor driver holds open, or reports without a serial number,
/// are skipped entirely. A record that is open and already carries the
/// device's serial number is marked as seen but left untouched; otherwise the
/// record is matched by the vendor-resolved port name and, when the vendor
/// description is non-empty, marked and patched with the description and
/// serial number. Nothing else about the record changes.
fn apply_vendor_pass(registry: &PortRegistry, vendor: &dyn VendorLookup) {
    for device in vendor.devices() {
        if device.in_use || device.serial_number.is_empty() {
            continue;
        }

        let open_match = registry.snapshot().into_iter().find(|r| {
            r.is_open() && r.meta.lock().serial_number.as_deref() == Some(&device.serial_number)
        });
        if let Some(record) = open_match {
            record.mark(true);
            continue;
        }

        let Some(port_name) = &device.port_name else {
            continue;
        };
        if device.description.is_empty() {
            continue;
        }
        if let Some(record) = registry.find(port_name) {
            record.mark(true);
            let mut meta = record.meta.lock();
            meta.description = device.description.clone();
            meta.serial_number = Some(device.serial_number.clone());
            debug!(path = %record.path, serial = %device.serial_number, "vendor description applied");
        }
    }
}

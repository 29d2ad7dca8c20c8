//! Integration tests for device discovery and the port registry.
//!
//! Covers:
//! - Snapshot ordering, rescan behavior, and the describe() fast path
//! - Device filtering (parallel ports, nameless entries) and name fallbacks
//! - Location derivation from bus numbers and location tokens
//! - In-place reconciliation when a device moves between refreshes
//! - Open-port survival across disappearance and the final sweep
//! - Scan-failure atomicity and error recording
//! - The vendor identification pass and its patching rules

mod common;

use common::{bare_device, engine_with_devices, engine_with_port, paths_of, usb_device};
use portside::host::VendorDevice;
use portside::{LastError, PortError, PortSettings, Stage};

// ============================================================
// Snapshot Tests
// ============================================================

mod snapshot_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ports_listed_in_first_seen_order() {
        // Arrange: the host reports devices in its own order
        let (host, engine) = engine_with_devices(vec![bare_device("COM9"), bare_device("COM2")]);

        // Act
        let first = engine.ports().unwrap();
        host.add_device(bare_device("COM5"));
        let second = engine.ports().unwrap();

        // Assert: listing order is first-seen order, new arrivals append
        assert_eq!(
            paths_of(&first),
            vec!["COM9", "COM2"],
            "Snapshot should preserve the order devices were first seen"
        );
        assert_eq!(
            paths_of(&second),
            vec!["COM9", "COM2", "COM5"],
            "A new device should append after existing entries"
        );
    }

    #[test]
    fn test_ports_rescans_on_every_call() {
        let (host, engine) = engine_with_port("COM3");

        assert_eq!(paths_of(&engine.ports().unwrap()), vec!["COM3"]);

        // The device drops off the bus between calls
        host.remove_device("COM3");

        assert!(
            engine.ports().unwrap().is_empty(),
            "ports() should rescan and drop the vanished device"
        );
    }

    #[test]
    fn test_describe_scans_at_most_once() {
        let (host, engine) = engine_with_port("COM3");

        // First describe triggers the initial scan
        let info = engine.describe("COM3").unwrap();
        assert_eq!(info.path, "COM3");

        // Act: the device vanishes, then describe again
        host.remove_device("COM3");
        let cached = engine.describe("COM3");

        // Assert: describe serves the existing registry without rescanning
        assert!(
            cached.is_ok(),
            "describe() should not rescan once a scan has happened"
        );

        // A full listing does rescan, after which the entry is swept
        assert!(engine.ports().unwrap().is_empty());
        assert!(
            matches!(engine.describe("COM3"), Err(PortError::NotFound(_))),
            "describe() should miss after the sweep removed the entry"
        );
    }

    #[test]
    fn test_describe_unknown_path_is_not_recorded() {
        let (_host, engine) = engine_with_port("COM3");

        let err = engine.describe("COM99").unwrap_err();

        assert!(matches!(err, PortError::NotFound(path) if path == "COM99"));
        assert_eq!(
            engine.last_error(),
            None,
            "A registry miss is not a host failure and must not be recorded"
        );
    }

    #[test]
    fn test_parallel_ports_are_filtered() {
        let (_host, engine) = engine_with_devices(vec![
            bare_device("COM1"),
            bare_device("LPT1"),
            bare_device("/dev/lp0"),
            bare_device("/dev/ttyS0"),
        ]);

        let listed = paths_of(&engine.ports().unwrap());

        assert_eq!(
            listed,
            vec!["COM1", "/dev/ttyS0"],
            "Parallel-port device names should never be listed"
        );
    }

    #[test]
    fn test_nameless_devices_are_skipped() {
        let (_host, engine) = engine_with_devices(vec![bare_device(""), bare_device("COM4")]);

        assert_eq!(paths_of(&engine.ports().unwrap()), vec!["COM4"]);
    }

    #[test]
    fn test_name_fallbacks_for_bare_device() {
        // A device reporting nothing but its port name
        let (_host, engine) = engine_with_port("COM6");

        let info = engine.describe("COM6").unwrap();

        // Assert: friendly name falls back to the path, description to the
        // friendly name, location to all-zero components
        assert_eq!(info.friendly_name, "COM6");
        assert_eq!(info.description, "COM6");
        assert_eq!(info.location, "0-0.0");
    }
}

// ============================================================
// Location Tests
// ============================================================

mod location_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_location_from_bus_and_reported_address() {
        let (_host, engine) = engine_with_devices(vec![usb_device("COM7", 1, 4)]);

        let info = engine.describe("COM7").unwrap();

        assert_eq!(info.location, "1-0.4", "Location should be bus-hub.port");
    }

    #[test]
    fn test_location_tokens_parsed_when_address_missing() {
        let mut dev = usb_device("COM8", 2, 0);
        dev.address = None;
        dev.location_info = Some("Port_#0002.Hub_#0003".to_string());
        let (_host, engine) = engine_with_devices(vec![dev]);

        let info = engine.describe("COM8").unwrap();

        assert_eq!(
            info.location, "2-3.2",
            "Hub and port numbers should come from the location tokens"
        );
    }

    #[test]
    fn test_reported_address_wins_over_port_token() {
        let mut dev = usb_device("COM8", 2, 9);
        dev.location_info = Some("Port_#0002.Hub_#0003".to_string());
        let (_host, engine) = engine_with_devices(vec![dev]);

        let info = engine.describe("COM8").unwrap();

        assert_eq!(
            info.location, "2-3.9",
            "A directly reported address takes priority over the token"
        );
    }
}

// ============================================================
// Reconcile Tests
// ============================================================

mod reconcile_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_relocation_updates_entry_in_place() {
        let (host, engine) = engine_with_devices(vec![usb_device("COM7", 1, 2), bare_device("COM3")]);

        let before = engine.ports().unwrap();
        assert_eq!(before[0].location, "1-0.2");

        // Act: the device moves to another physical port
        host.update_device("COM7", |dev| dev.address = Some(5));
        let after = engine.ports().unwrap();

        // Assert: same entry, same position, new location
        assert_eq!(
            paths_of(&after),
            paths_of(&before),
            "Relocation must not reorder or duplicate entries"
        );
        assert_eq!(after[0].location, "1-0.5", "Location should track the move");
    }

    #[test]
    fn test_open_port_survives_disappearance() {
        let (host, engine) = engine_with_port("COM3");

        let handle = engine.open("COM3", &PortSettings::default()).unwrap();
        host.remove_device("COM3");

        // Act: rescan while the session is still up
        let listed = paths_of(&engine.ports().unwrap());

        // Assert: the open session keeps its entry alive
        assert_eq!(
            listed,
            vec!["COM3"],
            "An open port must survive disappearing from the scan"
        );
        assert!(handle.is_open(), "The session itself should be unaffected");

        // Once closed, the next rescan sweeps the entry
        handle.close();
        assert!(
            engine.ports().unwrap().is_empty(),
            "A closed, vanished port should be swept on the next refresh"
        );
    }

    #[test]
    fn test_scan_failure_leaves_registry_untouched() {
        let (host, engine) = engine_with_port("COM3");
        engine.ports().unwrap();

        // Act: one failing scan
        host.fail_next_scan(13);
        let err = engine.ports().unwrap_err();

        // Assert: the failure is surfaced and recorded, nothing was swept
        assert!(matches!(err, PortError::Enumerate(_)));
        assert_eq!(
            engine.last_error(),
            Some(LastError {
                stage: Stage::Enumerate,
                code: 13,
            }),
            "The enumeration failure should land in the engine slot"
        );
        assert!(
            engine.describe("COM3").is_ok(),
            "A failed scan must not drop existing entries"
        );

        // The next scan succeeds and the listing is intact
        assert_eq!(paths_of(&engine.ports().unwrap()), vec!["COM3"]);
    }
}

// ============================================================
// Vendor Pass Tests
// ============================================================

mod vendor_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vendor_device(serial: &str, description: &str, port_name: Option<&str>) -> VendorDevice {
        VendorDevice {
            serial_number: serial.to_string(),
            description: description.to_string(),
            in_use: false,
            port_name: port_name.map(str::to_string),
        }
    }

    #[test]
    fn test_vendor_description_replaces_bus_description() {
        let (host, engine) = engine_with_devices(vec![usb_device("COM7", 1, 2)]);
        host.set_vendor_devices(vec![vendor_device("FT12345", "FT232R USB UART", Some("COM7"))]);

        let info = engine.describe("COM7").unwrap();

        assert_eq!(
            info.description, "FT232R USB UART",
            "The vendor's description should replace the generic bus one"
        );
        assert_eq!(
            info.friendly_name, "USB Serial Device (COM7)",
            "The friendly name is not the vendor's to patch"
        );
    }

    #[test]
    fn test_vendor_device_in_use_is_skipped() {
        let (host, engine) = engine_with_devices(vec![usb_device("COM7", 1, 2)]);
        let mut dev = vendor_device("FT12345", "FT232R USB UART", Some("COM7"));
        dev.in_use = true;
        host.set_vendor_devices(vec![dev]);

        let info = engine.describe("COM7").unwrap();

        assert_eq!(
            info.description, "USB Serial Device",
            "A device the vendor driver holds open must not be patched"
        );
    }

    #[test]
    fn test_vendor_device_without_serial_is_skipped() {
        let (host, engine) = engine_with_devices(vec![usb_device("COM7", 1, 2)]);
        host.set_vendor_devices(vec![vendor_device("", "FT232R USB UART", Some("COM7"))]);

        let info = engine.describe("COM7").unwrap();

        assert_eq!(info.description, "USB Serial Device");
    }

    #[test]
    fn test_vendor_empty_description_is_not_applied() {
        let (host, engine) = engine_with_devices(vec![usb_device("COM7", 1, 2)]);
        host.set_vendor_devices(vec![vendor_device("FT12345", "", Some("COM7"))]);

        let info = engine.describe("COM7").unwrap();

        assert_eq!(
            info.description, "USB Serial Device",
            "An empty vendor description must not clobber the existing one"
        );
    }

    #[test]
    fn test_vendor_unresolved_port_name_is_not_applied() {
        let (host, engine) = engine_with_devices(vec![usb_device("COM7", 1, 2)]);
        host.set_vendor_devices(vec![vendor_device("FT12345", "FT232R USB UART", None)]);

        let info = engine.describe("COM7").unwrap();

        assert_eq!(
            info.description, "USB Serial Device",
            "Without a resolved port name there is nothing to match against"
        );
    }

    #[test]
    fn test_vendor_serial_match_keeps_open_port_alive() {
        let (host, engine) = engine_with_devices(vec![usb_device("COM7", 1, 2)]);
        host.set_vendor_devices(vec![vendor_device("FT12345", "FT232R USB UART", Some("COM7"))]);

        // First scan patches the serial number onto the entry, then a
        // session opens it
        engine.ports().unwrap();
        let handle = engine.open("COM7", &PortSettings::default()).unwrap();

        // Act: the host scan loses the device; the vendor driver still sees
        // it, now under a different description and no resolved port name
        host.remove_device("COM7");
        host.set_vendor_devices(vec![vendor_device("FT12345", "FT232R (renamed)", None)]);
        let listed = paths_of(&engine.ports().unwrap());

        // Assert: the serial match keeps the open entry alive without
        // touching its properties
        assert_eq!(listed, vec!["COM7"]);
        let info = engine.describe("COM7").unwrap();
        assert_eq!(
            info.description, "FT232R USB UART",
            "A serial match on an open port marks it present but patches nothing"
        );

        handle.close();
    }

    #[test]
    fn test_vendor_pass_never_creates_entries() {
        let (host, engine) = engine_with_devices(vec![bare_device("COM1")]);
        host.set_vendor_devices(vec![vendor_device("FT99999", "Ghost Device", Some("COM42"))]);

        let listed = paths_of(&engine.ports().unwrap());

        assert_eq!(
            listed,
            vec!["COM1"],
            "Vendor devices only annotate entries the host scan produced"
        );
    }

    #[test]
    fn test_vendor_patch_applies_to_matching_entry_only() {
        let (host, engine) =
            engine_with_devices(vec![usb_device("COM7", 1, 2), usb_device("COM8", 1, 3)]);
        host.set_vendor_devices(vec![vendor_device("FT12345", "FT232R USB UART", Some("COM8"))]);

        engine.ports().unwrap();

        assert_eq!(engine.describe("COM7").unwrap().description, "USB Serial Device");
        assert_eq!(engine.describe("COM8").unwrap().description, "FT232R USB UART");
    }
}

// ============================================================
// Placeholder Entry Tests
// ============================================================

mod placeholder_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_open_by_user_path_registers_placeholder() {
        // A path the scan has never reported can still be opened directly
        let (_host, engine) = engine_with_devices(Vec::new());

        let handle = engine.open("/dev/ttyCUSTOM", &PortSettings::default()).unwrap();

        // Assert: the placeholder carries the path for its names
        let info = engine.describe("/dev/ttyCUSTOM").unwrap();
        assert_eq!(info.friendly_name, "/dev/ttyCUSTOM");
        assert_eq!(info.description, "/dev/ttyCUSTOM");
        assert_eq!(info.location, "0-0", "A placeholder has no bus position");

        handle.close();
    }
}

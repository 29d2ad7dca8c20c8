//! The engine: construction, discovery surface, and session opening.
//!
//! One [`PortEngine`] owns the registry and the injected host capabilities.
//! Discovery runs on demand through [`ports`](PortEngine::ports) (always
//! refreshes) and [`describe`](PortEngine::describe) (refreshes only if no
//! pass has ever run), and sessions are opened through
//! [`open`](PortEngine::open), which hands back a [`PortHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::discovery;
use crate::error::{ErrorSlot, LastError, PortError, Stage};
use crate::handle::PortHandle;
use crate::host::HostServices;
use crate::record::{OpenStreams, PortMeta, PortRecord};
use crate::registry::PortRegistry;
use crate::settings::PortSettings;

/// Descriptive snapshot of one registered port.
///
/// Detached from the underlying record: holding a `PortInfo` does not keep
/// the port alive across refreshes, and its fields do not change once taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Endpoint path, unique and stable across refreshes.
    pub path: String,
    pub friendly_name: String,
    /// Bus-reported device description, or the vendor's when one was found.
    pub description: String,
    /// Physical location as `bus-hub.port`.
    pub location: String,
}

impl PortInfo {
    fn from_record(record: &PortRecord) -> Self {
        let meta = record.meta.lock();
        Self {
            path: record.path.clone(),
            friendly_name: meta.friendly_name.clone(),
            description: meta.description.clone(),
            location: meta.location.clone(),
        }
    }
}

/// Serial port registry and transport engine.
///
/// Synchronous by design: callers bring their own threads, and per open port
/// one concurrent read, one write, and one event wait proceed independently.
/// Dropping the engine closes every session that is still open.
pub struct PortEngine {
    registry: PortRegistry,
    services: HostServices,
    last_error: Arc<ErrorSlot>,
    refreshed_once: AtomicBool,
    /// Serializes discovery passes; lookups read consistent snapshots.
    refresh_lock: Mutex<()>,
}

impl PortEngine {
    /// Build an engine over an explicit capability bundle.
    pub fn new(services: HostServices) -> Self {
        Self {
            registry: PortRegistry::new(),
            services,
            last_error: Arc::new(ErrorSlot::new()),
            refreshed_once: AtomicBool::new(false),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Build an engine over this host's serial devices.
    pub fn native() -> Self {
        Self::new(HostServices::native())
    }

    /// Run one discovery pass now.
    ///
    /// On failure the registry is untouched and the failure is recorded in
    /// the engine's error slot.
    pub fn refresh(&self) -> Result<(), PortError> {
        let _pass = self.refresh_lock.lock();
        let result = discovery::refresh(
            &self.registry,
            self.services.enumerator.as_ref(),
            self.services.vendor.as_deref(),
            &self.last_error,
        );
        if result.is_ok() {
            self.refreshed_once.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Refresh, then snapshot every registered port in first-seen order.
    pub fn ports(&self) -> Result<Vec<PortInfo>, PortError> {
        self.refresh()?;
        Ok(self
            .registry
            .snapshot()
            .iter()
            .map(|r| PortInfo::from_record(r))
            .collect())
    }

    /// Describe one port by path.
    ///
    /// Runs a discovery pass only if none has ever completed; after that,
    /// lookups are answered from the registry as-is so a stale view is only
    /// ever refreshed deliberately.
    pub fn describe(&self, path: &str) -> Result<PortInfo, PortError> {
        if !self.refreshed_once.load(Ordering::SeqCst) {
            self.refresh()?;
        }
        self.registry
            .find(path)
            .map(|r| PortInfo::from_record(&r))
            .ok_or_else(|| PortError::not_found(path))
    }

    /// The most recent failure recorded at engine scope.
    pub fn last_error(&self) -> Option<LastError> {
        self.last_error.get()
    }

    /// Open a session on `path` and return a handle to it.
    ///
    /// The path does not need to have been discovered: an unknown path gets a
    /// fresh record with placeholder descriptions that a later refresh fills
    /// in. With `auto_configure` set (the default), the settings are applied
    /// before the handle is returned, and a configuration failure tears the
    /// session back down.
    pub fn open(&self, path: &str, settings: &PortSettings) -> Result<PortHandle, PortError> {
        let record = self
            .registry
            .find_or_insert_with(path, || PortMeta::user_specified(path));
        let handle = PortHandle::new(Arc::clone(&record), Arc::clone(&self.last_error));

        if record.is_open() {
            return Err(handle.fail_both(Stage::Open, PortError::AlreadyOpen));
        }

        debug!(path, "opening port");
        let streams = match self.open_streams(path) {
            Ok(streams) => streams,
            Err(e) => return Err(handle.fail_both(Stage::Open, PortError::Open(e))),
        };
        if !record.install_streams(streams) {
            return Err(handle.fail_both(Stage::Open, PortError::AlreadyOpen));
        }

        if settings.auto_configure {
            if let Err(e) = handle.configure(settings) {
                // The failed session must not linger half-configured, and the
                // teardown must not overwrite the recorded configure failure.
                handle.abandon();
                return Err(e);
            }
            if settings.auto_flush {
                // Failure is recorded in the port slot; the session stays up.
                let _ = handle.flush();
            }
        }
        Ok(handle)
    }

    /// Open the host transport and fan it out into the per-concern clones.
    fn open_streams(&self, path: &str) -> std::io::Result<OpenStreams> {
        let control = self.services.opener.open(path)?;
        let reader = control.try_clone()?;
        let writer = control.try_clone()?;
        let monitor = control.try_clone()?;
        Ok(OpenStreams {
            control: Mutex::new(control),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            monitor: Mutex::new(monitor),
        })
    }
}

impl Drop for PortEngine {
    /// Close every session that is still open, recording each close outcome
    /// as usual.
    fn drop(&mut self) {
        for record in self.registry.snapshot() {
            if record.is_open() {
                PortHandle::new(record, Arc::clone(&self.last_error)).close();
            }
        }
    }
}

impl std::fmt::Debug for PortEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortEngine")
            .field("ports", &self.registry.snapshot().len())
            .field("refreshed_once", &self.refreshed_once.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockHost;
    use crate::host::HostDeviceInfo;

    fn device(port_name: &str) -> HostDeviceInfo {
        HostDeviceInfo {
            port_name: port_name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ports_refreshes_every_call() {
        let host = MockHost::new();
        host.add_device(device("COM1"));
        let engine = PortEngine::new(host.services());

        assert_eq!(engine.ports().unwrap().len(), 1);

        host.add_device(device("COM2"));
        let listed = engine.ports().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].path, "COM2");
    }

    #[test]
    fn test_describe_refreshes_only_once_ever() {
        let host = MockHost::new();
        host.add_device(device("COM1"));
        let engine = PortEngine::new(host.services());

        // First describe has no pass behind it and must run one.
        assert!(engine.describe("COM1").is_ok());

        // The device vanishes, but describe answers from the existing view.
        host.remove_device("COM1");
        assert!(
            engine.describe("COM1").is_ok(),
            "describe must not rescan after the first pass"
        );

        // An explicit listing picks up the removal.
        assert!(engine.ports().unwrap().is_empty());
        assert!(matches!(
            engine.describe("COM1"),
            Err(PortError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_unknown_path_uses_placeholder_meta() {
        let host = MockHost::new();
        let engine = PortEngine::new(host.services());

        let handle = engine.open("MOCK7", &PortSettings::default()).unwrap();
        assert!(handle.is_open());

        // describe runs the first pass; the open session survives its sweep.
        let info = engine.describe("MOCK7").unwrap();
        assert_eq!(info.friendly_name, "MOCK7");
        assert_eq!(info.description, "MOCK7");
        assert_eq!(info.location, "0-0");
    }

    #[test]
    fn test_drop_closes_open_sessions() {
        let host = MockHost::new();
        let engine = PortEngine::new(host.services());
        let handle = engine.open("MOCK0", &PortSettings::default()).unwrap();
        assert!(handle.is_open());

        drop(engine);
        assert!(!handle.is_open(), "engine drop must close live sessions");
        assert_eq!(host.live_clones("MOCK0"), 0);
    }

    #[test]
    fn test_engine_slot_records_scan_failure() {
        let host = MockHost::new();
        host.fail_next_scan(13);
        let engine = PortEngine::new(host.services());

        let err = engine.ports().unwrap_err();
        assert!(matches!(err, PortError::Enumerate(_)));
        let last = engine.last_error().unwrap();
        assert_eq!(last.stage, Stage::Enumerate);
        assert_eq!(last.code, 13);
    }
}

//! Per-port record and open-session stream set.
//!
//! A [`PortRecord`] is the unit of identity in the registry: one per distinct
//! endpoint path, shared as `Arc<PortRecord>` between the registry and every
//! handle referring to that path. Descriptive properties live behind their own
//! lock so discovery can update them while a session is open; the open-session
//! transports live behind a separate lock whose `None` state is the closed
//! sentinel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ErrorSlot;
use crate::host::{HostTransport, WaitGate};

/// Descriptive properties for one endpoint. Mutated by discovery only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PortMeta {
    pub friendly_name: String,
    pub description: String,
    pub location: String,
    pub serial_number: Option<String>,
}

impl PortMeta {
    /// Placeholder properties for a path the caller named directly, before
    /// any scan has described it.
    pub fn user_specified(path: &str) -> Self {
        Self {
            friendly_name: path.to_string(),
            description: path.to_string(),
            location: "0-0".to_string(),
            serial_number: None,
        }
    }
}

/// The transport clones backing one open session.
///
/// Each clone sits behind its own lock so a blocked read never holds a lock
/// the writer, the event monitor, or a control operation needs. All four share
/// the underlying handle; cancellation and timeout changes on one are visible
/// to the rest.
#[derive(Debug)]
pub(crate) struct OpenStreams {
    pub control: Mutex<Box<dyn HostTransport>>,
    pub reader: Mutex<Box<dyn HostTransport>>,
    pub writer: Mutex<Box<dyn HostTransport>>,
    pub monitor: Mutex<Box<dyn HostTransport>>,
}

/// One registry entry per distinct endpoint path.
///
/// Records are never replaced on refresh, only updated in place, so a handle
/// held across scans keeps observing the same record (and an open session
/// survives its device disappearing from a scan).
#[derive(Debug)]
pub(crate) struct PortRecord {
    pub path: String,
    pub meta: Mutex<PortMeta>,
    /// `None` is the closed sentinel.
    streams: Mutex<Option<Arc<OpenStreams>>>,
    /// Read staging buffer. Length only ever grows, so its capacity is
    /// monotonic and survives close/reopen.
    pub staging: Mutex<Vec<u8>>,
    /// Listener gate for event waits; cleared to cancel them.
    pub gate: WaitGate,
    pub last_error: ErrorSlot,
    /// Discovery mark, meaningful only within one refresh pass.
    pub enumerated: AtomicBool,
}

impl PortRecord {
    pub fn new(path: impl Into<String>, meta: PortMeta) -> Self {
        Self {
            path: path.into(),
            meta: Mutex::new(meta),
            streams: Mutex::new(None),
            staging: Mutex::new(Vec::new()),
            gate: WaitGate::new(),
            last_error: ErrorSlot::new(),
            enumerated: AtomicBool::new(false),
        }
    }

    pub fn is_open(&self) -> bool {
        self.streams.lock().is_some()
    }

    pub fn mark(&self, seen: bool) {
        self.enumerated.store(seen, Ordering::SeqCst);
    }

    pub fn is_marked(&self) -> bool {
        self.enumerated.load(Ordering::SeqCst)
    }

    /// Install the streams for a newly opened session.
    ///
    /// Returns `false` without installing when a session is already live.
    pub fn install_streams(&self, streams: OpenStreams) -> bool {
        let mut slot = self.streams.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::new(streams));
        true
    }

    /// Detach the streams for teardown, resetting the record to closed. The
    /// caller finishes teardown on its local `Arc` without holding the lock.
    pub fn take_streams(&self) -> Option<Arc<OpenStreams>> {
        self.streams.lock().take()
    }

    /// The live session's streams, if the port is open.
    pub fn streams(&self) -> Option<Arc<OpenStreams>> {
        self.streams.lock().clone()
    }
}

//! Mock host implementation for testing.
//!
//! Provides a [`MockHost`] that simulates device enumeration, vendor lookup,
//! and per-port transport behavior without requiring actual hardware. The
//! device list can be edited between scans, ports can be scripted to fail at
//! any step, and blocked reads honor the applied timeout plan against a
//! condition variable so timeout and cancellation behavior is exercised for
//! real.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{
    DeviceEnumerator, HostDeviceInfo, HostEvents, HostTransport, LineControl, LineErrors,
    LineProfile, ModemLines, PortOpener, ReadPlan, TimeoutPlan, VendorDevice, VendorLookup,
    WaitGate, WaitOutcome,
};

/// Re-check interval while a mock wait holds a lock; bounds how quickly a
/// cleared gate is noticed.
const EVENT_STEP: Duration = Duration::from_millis(20);

/// Per-path transport state, shared by every clone of one handle.
#[derive(Debug)]
struct MockPortState {
    inner: Mutex<PortInner>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct PortInner {
    rx: VecDeque<u8>,
    /// Everything ever written through the port.
    tx_log: Vec<u8>,
    /// Bytes sitting in the output queue, not yet drained by the device.
    tx_queue: usize,
    /// Output queue bound; `None` accepts everything.
    tx_capacity: Option<usize>,
    plan: TimeoutPlan,
    events_mask: HostEvents,
    pending_events: HostEvents,
    latched_errors: LineErrors,
    modem: ModemLines,
    profile: Option<LineProfile>,
    escapes: Vec<LineControl>,
    canceled: bool,
    fail_configure: Option<i32>,
    /// Sticky I/O failure, as if the device vanished.
    fail_io: Option<i32>,
    purge_count: u32,
    cancel_count: u32,
    flush_count: u32,
    live_clones: u32,
}

impl MockPortState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(PortInner {
                events_mask: HostEvents::ERR,
                ..Default::default()
            }),
            cond: Condvar::new(),
        }
    }
}

struct MockHostInner {
    devices: Vec<HostDeviceInfo>,
    vendor_devices: Vec<VendorDevice>,
    scan_error: Option<i32>,
    open_errors: HashMap<String, i32>,
    ports: HashMap<String, Arc<MockPortState>>,
}

/// Scriptable host backend.
///
/// Implements all three host capabilities over shared state, so one instance
/// can be handed to an engine as its enumerator, opener, and vendor lookup
/// while the test keeps a clone to script devices and inject faults.
///
/// # Example
/// ```
/// use portside::host::{HostTransport, PortOpener};
/// use portside::MockHost;
///
/// let host = MockHost::new();
/// let mut port = host.open("MOCK0").unwrap();
/// host.enqueue_rx("MOCK0", b"ping");
///
/// let mut buf = [0u8; 8];
/// let n = port.read(&mut buf).unwrap();
/// assert_eq!(&buf[..n], b"ping");
/// ```
#[derive(Clone)]
pub struct MockHost {
    inner: Arc<Mutex<MockHostInner>>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockHostInner {
                devices: Vec::new(),
                vendor_devices: Vec::new(),
                scan_error: None,
                open_errors: HashMap::new(),
                ports: HashMap::new(),
            })),
        }
    }

    /// Package this host as the capability bundle an engine consumes. The
    /// original handle keeps working for scripting.
    pub fn services(&self) -> super::HostServices {
        super::HostServices {
            enumerator: Box::new(self.clone()),
            opener: Box::new(self.clone()),
            vendor: Some(Box::new(self.clone())),
        }
    }

    /// Append a device to the enumeration list.
    pub fn add_device(&self, device: HostDeviceInfo) {
        self.inner.lock().devices.push(device);
    }

    /// Replace the entire enumeration list.
    pub fn set_devices(&self, devices: Vec<HostDeviceInfo>) {
        self.inner.lock().devices = devices;
    }

    /// Remove a device from the enumeration list by port name.
    pub fn remove_device(&self, port_name: &str) {
        self.inner
            .lock()
            .devices
            .retain(|d| d.port_name != port_name);
    }

    /// Edit one enumerated device in place, e.g. to relocate it.
    pub fn update_device(&self, port_name: &str, edit: impl FnOnce(&mut HostDeviceInfo)) {
        let mut inner = self.inner.lock();
        if let Some(device) = inner.devices.iter_mut().find(|d| d.port_name == port_name) {
            edit(device);
        }
    }

    /// Make the next scan fail with the given OS code.
    pub fn fail_next_scan(&self, code: i32) {
        self.inner.lock().scan_error = Some(code);
    }

    /// Replace the vendor lookup table.
    pub fn set_vendor_devices(&self, devices: Vec<VendorDevice>) {
        self.inner.lock().vendor_devices = devices;
    }

    /// Make the next open of `port_name` fail with the given OS code.
    pub fn fail_next_open(&self, port_name: &str, code: i32) {
        self.inner
            .lock()
            .open_errors
            .insert(port_name.to_string(), code);
    }

    /// Make the next settings application on `port_name` fail.
    pub fn fail_next_configure(&self, port_name: &str, code: i32) {
        self.port_state(port_name).inner.lock().fail_configure = Some(code);
    }

    /// Fail all subsequent I/O on `port_name`, as if the device vanished.
    pub fn fail_io(&self, port_name: &str, code: i32) {
        let state = self.port_state(port_name);
        state.inner.lock().fail_io = Some(code);
        state.cond.notify_all();
    }

    /// Queue bytes on the receive side, waking any blocked reader.
    pub fn enqueue_rx(&self, port_name: &str, data: &[u8]) {
        let state = self.port_state(port_name);
        let mut inner = state.inner.lock();
        inner.rx.extend(data);
        inner.pending_events |= HostEvents::RX_CHAR;
        state.cond.notify_all();
    }

    /// Bound the output queue so writes can come up short.
    pub fn set_tx_capacity(&self, port_name: &str, capacity: Option<usize>) {
        self.port_state(port_name).inner.lock().tx_capacity = capacity;
    }

    /// Drain the output queue, as if the device consumed it.
    pub fn drain_tx(&self, port_name: &str) {
        let state = self.port_state(port_name);
        let mut inner = state.inner.lock();
        if inner.tx_queue > 0 {
            inner.tx_queue = 0;
            inner.pending_events |= HostEvents::TX_EMPTY;
        }
        state.cond.notify_all();
    }

    /// Everything written through the port so far.
    pub fn written(&self, port_name: &str) -> Vec<u8> {
        self.port_state(port_name).inner.lock().tx_log.clone()
    }

    /// Signal a received break condition.
    pub fn inject_break(&self, port_name: &str) {
        let state = self.port_state(port_name);
        let mut inner = state.inner.lock();
        inner.pending_events |= HostEvents::BREAK;
        inner.latched_errors |= LineErrors::BREAK;
        state.cond.notify_all();
    }

    /// Latch line errors and signal the error condition.
    pub fn inject_line_errors(&self, port_name: &str, errors: LineErrors) {
        let state = self.port_state(port_name);
        let mut inner = state.inner.lock();
        inner.latched_errors |= errors;
        inner.pending_events |= HostEvents::ERR;
        state.cond.notify_all();
    }

    /// Drive the modem input lines, signaling a change event for each line
    /// that differs from the previous level.
    pub fn set_modem_lines(&self, port_name: &str, lines: ModemLines) {
        let state = self.port_state(port_name);
        let mut inner = state.inner.lock();
        let changed = inner.modem.symmetric_difference(lines);
        inner.modem = lines;
        if changed.contains(ModemLines::CTS) {
            inner.pending_events |= HostEvents::CTS;
        }
        if changed.contains(ModemLines::DSR) {
            inner.pending_events |= HostEvents::DSR;
        }
        if changed.contains(ModemLines::RING) {
            inner.pending_events |= HostEvents::RING;
        }
        if changed.contains(ModemLines::RLSD) {
            inner.pending_events |= HostEvents::RLSD;
        }
        state.cond.notify_all();
    }

    /// The line profile most recently applied, if any.
    pub fn applied_profile(&self, port_name: &str) -> Option<LineProfile> {
        self.port_state(port_name).inner.lock().profile.clone()
    }

    /// The timeout plan currently applied.
    pub fn applied_plan(&self, port_name: &str) -> TimeoutPlan {
        self.port_state(port_name).inner.lock().plan
    }

    /// The event mask currently applied.
    pub fn applied_events(&self, port_name: &str) -> HostEvents {
        self.port_state(port_name).inner.lock().events_mask
    }

    /// Control-line escapes issued so far, in order.
    pub fn escapes(&self, port_name: &str) -> Vec<LineControl> {
        self.port_state(port_name).inner.lock().escapes.clone()
    }

    pub fn purge_count(&self, port_name: &str) -> u32 {
        self.port_state(port_name).inner.lock().purge_count
    }

    pub fn cancel_count(&self, port_name: &str) -> u32 {
        self.port_state(port_name).inner.lock().cancel_count
    }

    pub fn flush_count(&self, port_name: &str) -> u32 {
        self.port_state(port_name).inner.lock().flush_count
    }

    /// Transport clones currently alive for this path; zero once an engine
    /// has fully released the handle.
    pub fn live_clones(&self, port_name: &str) -> u32 {
        self.port_state(port_name).inner.lock().live_clones
    }

    fn port_state(&self, port_name: &str) -> Arc<MockPortState> {
        let mut inner = self.inner.lock();
        Arc::clone(
            inner
                .ports
                .entry(port_name.to_string())
                .or_insert_with(|| Arc::new(MockPortState::new())),
        )
    }
}

impl DeviceEnumerator for MockHost {
    fn scan(&self) -> io::Result<Vec<HostDeviceInfo>> {
        let mut inner = self.inner.lock();
        if let Some(code) = inner.scan_error.take() {
            return Err(io::Error::from_raw_os_error(code));
        }
        Ok(inner.devices.clone())
    }
}

impl PortOpener for MockHost {
    fn open(&self, path: &str) -> io::Result<Box<dyn HostTransport>> {
        if let Some(code) = self.inner.lock().open_errors.remove(path) {
            return Err(io::Error::from_raw_os_error(code));
        }
        let state = self.port_state(path);
        {
            // Fresh session: queues, cancellation, and policy reset; scripted
            // faults and modem levels persist.
            let mut inner = state.inner.lock();
            inner.rx.clear();
            inner.tx_queue = 0;
            inner.canceled = false;
            inner.plan = TimeoutPlan::non_blocking();
            inner.events_mask = HostEvents::ERR;
            inner.pending_events = HostEvents::empty();
            inner.live_clones += 1;
        }
        Ok(Box::new(MockTransport {
            path: path.to_string(),
            state,
        }))
    }
}

impl VendorLookup for MockHost {
    fn devices(&self) -> Vec<VendorDevice> {
        self.inner.lock().vendor_devices.clone()
    }
}

/// One handle clone over a [`MockHost`] port.
pub struct MockTransport {
    path: String,
    state: Arc<MockPortState>,
}

fn canceled_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "pending I/O canceled")
}

fn pop_queued(inner: &mut PortInner, buf: &mut [u8]) -> usize {
    let n = inner.rx.len().min(buf.len());
    for slot in buf.iter_mut().take(n) {
        *slot = inner.rx.pop_front().unwrap_or_default();
    }
    n
}

impl MockTransport {
    fn check_session(inner: &PortInner) -> io::Result<()> {
        if let Some(code) = inner.fail_io {
            return Err(io::Error::from_raw_os_error(code));
        }
        if inner.canceled {
            return Err(canceled_error());
        }
        Ok(())
    }
}

impl HostTransport for MockTransport {
    fn apply_settings(&mut self, profile: &LineProfile) -> io::Result<()> {
        let mut inner = self.state.inner.lock();
        if let Some(code) = inner.fail_configure.take() {
            return Err(io::Error::from_raw_os_error(code));
        }
        inner.profile = Some(profile.clone());
        Ok(())
    }

    fn apply_timeouts(&mut self, plan: &TimeoutPlan, events: HostEvents) -> io::Result<()> {
        let mut inner = self.state.inner.lock();
        inner.plan = *plan;
        inner.events_mask = events;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.state.inner.lock();
        let plan = inner.plan.read;
        match plan {
            ReadPlan::Immediate => {
                Self::check_session(&inner)?;
                Ok(pop_queued(&mut inner, buf))
            }
            ReadPlan::FirstByte { total } => {
                let deadline = Instant::now() + total;
                loop {
                    Self::check_session(&inner)?;
                    if !inner.rx.is_empty() {
                        return Ok(pop_queued(&mut inner, buf));
                    }
                    if Instant::now() >= deadline {
                        return Ok(0);
                    }
                    self.state.cond.wait_until(&mut inner, deadline);
                }
            }
            ReadPlan::Fixed { total } => {
                let deadline = Instant::now() + total;
                let mut filled = 0;
                loop {
                    Self::check_session(&inner)?;
                    filled += pop_queued(&mut inner, &mut buf[filled..]);
                    if filled == buf.len() || Instant::now() >= deadline {
                        return Ok(filled);
                    }
                    self.state.cond.wait_until(&mut inner, deadline);
                }
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.state.inner.lock();
        Self::check_session(&inner)?;
        let room = inner
            .tx_capacity
            .map_or(buf.len(), |cap| cap.saturating_sub(inner.tx_queue));
        let accepted = room.min(buf.len());
        inner.tx_log.extend_from_slice(&buf[..accepted]);
        inner.tx_queue += accepted;
        Ok(accepted)
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        let inner = self.state.inner.lock();
        Self::check_session(&inner)?;
        Ok(inner.rx.len())
    }

    fn bytes_to_write(&mut self) -> io::Result<usize> {
        let inner = self.state.inner.lock();
        Self::check_session(&inner)?;
        Ok(inner.tx_queue)
    }

    fn purge(&mut self) -> io::Result<()> {
        let mut inner = self.state.inner.lock();
        inner.rx.clear();
        inner.tx_queue = 0;
        inner.purge_count += 1;
        Ok(())
    }

    fn cancel_pending(&mut self) -> io::Result<()> {
        let mut inner = self.state.inner.lock();
        inner.canceled = true;
        inner.cancel_count += 1;
        self.state.cond.notify_all();
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.inner.lock().flush_count += 1;
        Ok(())
    }

    fn wait_event(&mut self, slice: Duration, gate: &WaitGate) -> io::Result<WaitOutcome> {
        let deadline = Instant::now() + slice;
        let mut inner = self.state.inner.lock();
        loop {
            Self::check_session(&inner)?;
            let ready = inner.pending_events & inner.events_mask;
            if !ready.is_empty() {
                inner.pending_events -= ready;
                return Ok(WaitOutcome::Signaled(ready));
            }
            let now = Instant::now();
            if now >= deadline || !gate.is_set() {
                return Ok(WaitOutcome::TimedOut);
            }
            let step = now + EVENT_STEP.min(deadline - now);
            self.state.cond.wait_until(&mut inner, step);
        }
    }

    fn drain_errors(&mut self) -> io::Result<(LineErrors, usize)> {
        let mut inner = self.state.inner.lock();
        Self::check_session(&inner)?;
        let errors = inner.latched_errors;
        inner.latched_errors = LineErrors::empty();
        Ok((errors, inner.rx.len()))
    }

    fn modem_status(&mut self) -> io::Result<ModemLines> {
        let inner = self.state.inner.lock();
        Self::check_session(&inner)?;
        Ok(inner.modem)
    }

    fn escape(&mut self, control: LineControl) -> io::Result<()> {
        let mut inner = self.state.inner.lock();
        Self::check_session(&inner)?;
        inner.escapes.push(control);
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn HostTransport>> {
        self.state.inner.lock().live_clones += 1;
        Ok(Box::new(Self {
            path: self.path.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        let mut inner = self.state.inner.lock();
        inner.live_clones = inner.live_clones.saturating_sub(1);
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.state.inner.lock();
        f.debug_struct("MockTransport")
            .field("path", &self.path)
            .field("queued", &inner.rx.len())
            .field("canceled", &inner.canceled)
            .finish()
    }
}

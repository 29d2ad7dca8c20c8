//! Host abstraction layer for device enumeration and transport I/O.
//!
//! Defines the traits the engine consumes from the host: a device-class
//! enumerator, a per-path opener, an optional vendor description lookup, and
//! the per-handle [`HostTransport`] contract. Real hosts and scriptable mocks
//! implement the same traits, so the engine above this layer is testable
//! without hardware.

pub mod mock;
pub mod native;

use std::io;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

/// Parity checking modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// How the host should drive the RTS line.
///
/// `Toggle` is the RS-485 transmit-toggle mode: the host raises RTS around
/// each transmission instead of holding it static.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtsMode {
    Toggle,
    Handshake,
    Enable,
    Disable,
}

/// How the host should drive the DTR line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtrMode {
    Handshake,
    Enable,
    Disable,
}

/// Fully derived line configuration, applied to the transport in one call.
///
/// Produced by [`PortSettings::line_profile`](crate::PortSettings::line_profile);
/// all flow-control coupling and line-mode priority rules are already resolved
/// by the time a profile reaches a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineProfile {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    /// Output flow driven by CTS.
    pub cts_out_flow: bool,
    /// Output flow driven by DSR.
    pub dsr_out_flow: bool,
    /// Receive sensitivity to the DSR line.
    pub dsr_sensitivity: bool,
    pub dtr_mode: DtrMode,
    pub rts_mode: RtsMode,
    /// Software flow control on the receive side.
    pub xon_xoff_in: bool,
    /// Software flow control on the transmit side.
    pub xon_xoff_out: bool,
    pub xon_char: u8,
    pub xoff_char: u8,
    pub send_queue_size: usize,
    pub receive_queue_size: usize,
}

/// Read total cap standing in for "block forever" on hosts that require a
/// finite timeout value.
pub const EFFECTIVELY_FOREVER: Duration = Duration::from_millis(0x0FFF_FFFF);

/// Read completion policy, as the transport executes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPlan {
    /// Return immediately with whatever is already queued.
    Immediate,
    /// Return queued bytes immediately if any; otherwise wait up to `total`
    /// for the first byte to arrive, then return without filling the buffer.
    FirstByte { total: Duration },
    /// Wait until the buffer is full or `total` elapses, then return what
    /// accumulated.
    Fixed { total: Duration },
}

/// Timeout policy for one open handle, reapplied independently of line
/// parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPlan {
    pub read: ReadPlan,
    pub write: Duration,
}

impl TimeoutPlan {
    /// The plan forced during teardown: reads return immediately so a blocked
    /// reader on another thread can drain out.
    pub fn non_blocking() -> Self {
        Self {
            read: ReadPlan::Immediate,
            write: Duration::ZERO,
        }
    }
}

impl Default for TimeoutPlan {
    fn default() -> Self {
        Self::non_blocking()
    }
}

bitflags! {
    /// Conditions the host can signal through [`HostTransport::wait_event`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HostEvents: u32 {
        /// A character arrived in the receive queue.
        const RX_CHAR = 1 << 0;
        /// The transmit queue drained to empty.
        const TX_EMPTY = 1 << 1;
        /// A break condition was detected on the line.
        const BREAK = 1 << 2;
        /// The CTS line changed state.
        const CTS = 1 << 3;
        /// The DSR line changed state.
        const DSR = 1 << 4;
        /// The ring indicator changed state.
        const RING = 1 << 5;
        /// The carrier-detect (RLSD) line changed state.
        const RLSD = 1 << 6;
        /// A line error occurred; details via [`HostTransport::drain_errors`].
        const ERR = 1 << 7;
    }
}

bitflags! {
    /// Latched line error conditions, read-and-cleared by
    /// [`HostTransport::drain_errors`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LineErrors: u32 {
        const BREAK = 1 << 0;
        const FRAME = 1 << 1;
        /// Character-level overrun in the device or driver.
        const OVERRUN = 1 << 2;
        /// Receive buffer overflow in the host.
        const RX_OVERFLOW = 1 << 3;
        const PARITY = 1 << 4;
    }
}

bitflags! {
    /// Instantaneous modem line levels.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModemLines: u32 {
        const CTS = 1 << 0;
        const DSR = 1 << 1;
        const RING = 1 << 2;
        const RLSD = 1 << 3;
    }
}

/// Control-line and break escapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineControl {
    SetRts,
    ClearRts,
    SetDtr,
    ClearDtr,
    SetBreak,
    ClearBreak,
}

/// Result of one bounded [`HostTransport::wait_event`] slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// One or more masked conditions fired.
    Signaled(HostEvents),
    /// The slice elapsed, or the gate was cleared mid-slice.
    TimedOut,
}

/// Condvar-backed listener gate.
///
/// Replaces a polled running flag: `nap` sleeps for at most the given limit
/// but wakes immediately when the gate is cleared, so cancellation latency is
/// bounded by one slice without busy-polling. The gate starts cleared; the
/// caller raises it before entering an event-wait loop and teardown clears it.
#[derive(Debug, Default)]
pub struct WaitGate {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl WaitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise or clear the gate. Clearing wakes every `nap` in progress.
    pub fn set(&self, listening: bool) {
        let mut flag = self.flag.lock();
        *flag = listening;
        if !listening {
            self.cond.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Sleep for at most `limit`, waking early if the gate is cleared.
    ///
    /// Returns `true` when the gate was cleared before the limit elapsed.
    pub fn nap(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut flag = self.flag.lock();
        while *flag {
            if self.cond.wait_until(&mut flag, deadline).timed_out() {
                return !*flag;
            }
        }
        true
    }
}

/// Raw per-device properties reported by a [`DeviceEnumerator`].
///
/// Everything except the port name is best-effort; discovery applies the
/// fallback chains and location derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostDeviceInfo {
    /// The host's registered port name for the device, e.g. `COM3` or
    /// `/dev/ttyUSB0`.
    pub port_name: String,
    pub friendly_name: Option<String>,
    pub bus_description: Option<String>,
    pub bus_number: Option<u32>,
    /// Port number on the bus, when the host reports one directly.
    pub address: Option<u32>,
    /// Free-text location descriptor, e.g. `Port_#0002.Hub_#0003`.
    pub location_info: Option<String>,
    pub serial_number: Option<String>,
}

/// One device reported by a vendor-specific identification library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorDevice {
    pub serial_number: String,
    pub description: String,
    /// The vendor driver reports the device as currently held open.
    pub in_use: bool,
    /// Host-visible port name, when the vendor driver can resolve it.
    pub port_name: Option<String>,
}

/// Lists currently present serial-capable devices across the host's device
/// classes.
pub trait DeviceEnumerator: Send + Sync {
    fn scan(&self) -> io::Result<Vec<HostDeviceInfo>>;
}

/// Opens a host transport for a device path.
pub trait PortOpener: Send + Sync {
    fn open(&self, path: &str) -> io::Result<Box<dyn HostTransport>>;
}

/// Optional vendor-specific supplementary description source, keyed by serial
/// number. Present or absent for the lifetime of the engine.
pub trait VendorLookup: Send + Sync {
    fn devices(&self) -> Vec<VendorDevice>;
}

/// Per-handle transport contract.
///
/// One open session holds several clones of the same underlying handle (via
/// [`try_clone`](Self::try_clone)) so a blocked read, a write, and an event
/// wait can proceed on independent locks. `cancel_pending` and the timeout
/// plan are shared across clones: cancelling on one clone unblocks reads on
/// the others.
pub trait HostTransport: Send + std::fmt::Debug {
    /// Apply a complete line configuration atomically. Failure leaves the
    /// previous configuration in effect.
    fn apply_settings(&mut self, profile: &LineProfile) -> io::Result<()>;

    /// Apply the timeout plan and the event mask for subsequent reads,
    /// writes, and event waits on every clone of this handle.
    fn apply_timeouts(&mut self, plan: &TimeoutPlan, events: HostEvents) -> io::Result<()>;

    /// Read into `buf` under the applied [`ReadPlan`]. A zero return under
    /// `Immediate` or `FirstByte` means no data arrived in time, not an
    /// error.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf` under the applied write timeout. May return a short
    /// count when the output queue is full.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Bytes queued for reading, without blocking.
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Bytes not yet drained from the output queue, without blocking.
    fn bytes_to_write(&mut self) -> io::Result<usize>;

    /// Discard both queues and abandon any in-flight transfer data.
    fn purge(&mut self) -> io::Result<()>;

    /// Cancel pending I/O on every clone of this handle. A reader blocked on
    /// another clone returns promptly.
    fn cancel_pending(&mut self) -> io::Result<()>;

    /// Block until the output queue has drained to the device.
    fn flush(&mut self) -> io::Result<()>;

    /// Wait up to `slice` for a masked condition, waking early when `gate`
    /// is cleared.
    fn wait_event(&mut self, slice: Duration, gate: &WaitGate) -> io::Result<WaitOutcome>;

    /// Read and clear latched line errors; also reports the input queue depth
    /// observed at the same instant.
    fn drain_errors(&mut self) -> io::Result<(LineErrors, usize)>;

    /// Current modem line levels.
    fn modem_status(&mut self) -> io::Result<ModemLines>;

    /// Drive a control line or break condition.
    fn escape(&mut self, control: LineControl) -> io::Result<()>;

    /// Duplicate the handle. Clones share queues, the timeout plan, and the
    /// cancellation state.
    fn try_clone(&self) -> io::Result<Box<dyn HostTransport>>;
}

/// The injected host capability bundle an engine is built from.
pub struct HostServices {
    pub enumerator: Box<dyn DeviceEnumerator>,
    pub opener: Box<dyn PortOpener>,
    /// Vendor description lookup, when the host has one available.
    pub vendor: Option<Box<dyn VendorLookup>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_gate_starts_cleared() {
        let gate = WaitGate::new();
        assert!(!gate.is_set());
        assert!(gate.nap(Duration::from_millis(200)), "cleared gate naps return at once");
    }

    #[test]
    fn test_nap_times_out_while_set() {
        let gate = WaitGate::new();
        gate.set(true);
        let start = Instant::now();
        let cleared = gate.nap(Duration::from_millis(50));
        assert!(!cleared, "gate stayed set, nap should time out");
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_clear_wakes_napper() {
        let gate = Arc::new(WaitGate::new());
        gate.set(true);

        let napper = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let cleared = napper.nap(Duration::from_secs(5));
            (cleared, start.elapsed())
        });

        std::thread::sleep(Duration::from_millis(30));
        gate.set(false);

        let (cleared, elapsed) = handle.join().unwrap();
        assert!(cleared, "clearing the gate should wake the napper");
        assert!(elapsed < Duration::from_secs(1), "woke in {elapsed:?}, not at the limit");
    }

    #[test]
    fn test_event_mask_combination() {
        let mask = HostEvents::RX_CHAR | HostEvents::BREAK | HostEvents::ERR;
        assert!(mask.contains(HostEvents::BREAK));
        assert!(!mask.contains(HostEvents::TX_EMPTY));
    }
}

//! Native host backend over the `serialport` crate.
//!
//! [`NativeTransport`] realizes the [`HostTransport`] contract on top of
//! `serialport`'s per-struct blocking I/O. Reads and writes run as bounded
//! sub-polls against the device queues so that `cancel_pending` on one clone
//! unblocks a transfer parked on another clone within one poll step, matching
//! the teardown contract. [`NativeEnumerator`] and [`NativeOpener`] wrap
//! `serialport::available_ports` and the builder API.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::{
    DataBits, DeviceEnumerator, DtrMode, HostDeviceInfo, HostEvents, HostServices, HostTransport,
    LineControl, LineErrors, LineProfile, ModemLines, Parity, PortOpener, ReadPlan, RtsMode,
    StopBits, TimeoutPlan, WaitGate, WaitOutcome, EFFECTIVELY_FOREVER,
};

/// Upper bound on one blocking sub-poll; also the worst-case latency for a
/// cancelled transfer to notice.
const POLL_STEP: Duration = Duration::from_millis(100);

/// Poll step inside `wait_event`; line and queue state is sampled this often.
const EVENT_POLL_STEP: Duration = Duration::from_millis(20);

/// State shared by every clone of one opened handle.
#[derive(Debug)]
struct SharedHandle {
    /// Set by `cancel_pending`; sub-poll loops on all clones observe it.
    canceled: AtomicBool,
    plan: Mutex<TimeoutPlan>,
    events: Mutex<HostEvents>,
}

/// [`HostTransport`] over a `serialport` handle.
pub struct NativeTransport {
    port: Box<dyn serialport::SerialPort>,
    path: String,
    shared: Arc<SharedHandle>,
    /// Output-queue depth at the previous `wait_event` sample, for the
    /// drained-to-empty transition.
    last_tx_depth: Option<usize>,
    /// Modem lines at the previous `wait_event` sample, for change detection.
    last_modem: Option<ModemLines>,
}

impl NativeTransport {
    fn new(port: Box<dyn serialport::SerialPort>, path: String) -> Self {
        Self {
            port,
            path,
            shared: Arc::new(SharedHandle {
                canceled: AtomicBool::new(false),
                plan: Mutex::new(TimeoutPlan::non_blocking()),
                events: Mutex::new(HostEvents::ERR),
            }),
            last_tx_depth: None,
            last_modem: None,
        }
    }

    fn check_canceled(&self) -> io::Result<()> {
        if self.shared.canceled.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "pending I/O canceled",
            ));
        }
        Ok(())
    }

    fn set_struct_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        if self.port.timeout() != timeout {
            self.port.set_timeout(timeout).map_err(io::Error::from)?;
        }
        Ok(())
    }

    /// Read only bytes already reported queued, so the call cannot block.
    /// A race with a concurrent purge surfaces as a timeout and counts as
    /// zero bytes.
    fn drain_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
        if available == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = available.min(buf.len());
        self.set_struct_timeout(POLL_STEP)?;
        match self.port.read(&mut buf[..want]) {
            Ok(n) => Ok(n),
            Err(e) if retryable(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn apply_line_params(&mut self, profile: &LineProfile) -> io::Result<()> {
        self.port
            .set_baud_rate(profile.baud_rate)
            .map_err(io::Error::from)?;
        self.port
            .set_data_bits(convert_data_bits(profile.data_bits))
            .map_err(io::Error::from)?;
        self.port
            .set_stop_bits(convert_stop_bits(profile.stop_bits)?)
            .map_err(io::Error::from)?;
        self.port
            .set_parity(convert_parity(profile.parity)?)
            .map_err(io::Error::from)?;
        self.port
            .set_flow_control(select_flow_control(profile)?)
            .map_err(io::Error::from)?;
        Ok(())
    }
}

fn retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

impl HostTransport for NativeTransport {
    /// Applies the profile through `serialport`'s individual setters,
    /// restoring the previously read values on failure so a rejected profile
    /// does not leave the line half-configured.
    fn apply_settings(&mut self, profile: &LineProfile) -> io::Result<()> {
        let prior = (
            self.port.baud_rate().map_err(io::Error::from)?,
            self.port.data_bits().map_err(io::Error::from)?,
            self.port.stop_bits().map_err(io::Error::from)?,
            self.port.parity().map_err(io::Error::from)?,
            self.port.flow_control().map_err(io::Error::from)?,
        );

        if let Err(e) = self.apply_line_params(profile) {
            let _ = self.port.set_baud_rate(prior.0);
            let _ = self.port.set_data_bits(prior.1);
            let _ = self.port.set_stop_bits(prior.2);
            let _ = self.port.set_parity(prior.3);
            let _ = self.port.set_flow_control(prior.4);
            return Err(e);
        }

        match profile.dtr_mode {
            DtrMode::Enable => self
                .port
                .write_data_terminal_ready(true)
                .map_err(io::Error::from)?,
            DtrMode::Disable => self
                .port
                .write_data_terminal_ready(false)
                .map_err(io::Error::from)?,
            DtrMode::Handshake => {}
        }
        match profile.rts_mode {
            RtsMode::Enable => self
                .port
                .write_request_to_send(true)
                .map_err(io::Error::from)?,
            RtsMode::Disable => self
                .port
                .write_request_to_send(false)
                .map_err(io::Error::from)?,
            RtsMode::Handshake => {}
            // Rejected in select_flow_control before reaching here.
            RtsMode::Toggle => {}
        }

        if profile.xon_char != 0x11 || profile.xoff_char != 0x13 {
            debug!(
                path = %self.path,
                "custom XON/XOFF characters are not applied by this backend"
            );
        }
        if profile.send_queue_size != 4096 || profile.receive_queue_size != 4096 {
            debug!(
                path = %self.path,
                send = profile.send_queue_size,
                receive = profile.receive_queue_size,
                "device queue sizes are not applied by this backend"
            );
        }

        Ok(())
    }

    fn apply_timeouts(&mut self, plan: &TimeoutPlan, events: HostEvents) -> io::Result<()> {
        *self.shared.plan.lock() = *plan;
        *self.shared.events.lock() = events;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let plan = self.shared.plan.lock().read;
        match plan {
            ReadPlan::Immediate => {
                self.check_canceled()?;
                self.drain_available(buf)
            }
            ReadPlan::FirstByte { total } => {
                let deadline = Instant::now() + total;
                loop {
                    self.check_canceled()?;
                    let n = self.drain_available(buf)?;
                    if n > 0 {
                        return Ok(n);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(0);
                    }
                    std::thread::sleep(POLL_STEP.min(deadline - now));
                }
            }
            ReadPlan::Fixed { total } => {
                let deadline = Instant::now() + total;
                let mut filled = 0;
                loop {
                    self.check_canceled()?;
                    filled += self.drain_available(&mut buf[filled..])?;
                    if filled == buf.len() {
                        return Ok(filled);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(filled);
                    }
                    std::thread::sleep(POLL_STEP.min(deadline - now));
                }
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let limit = self.shared.plan.lock().write;
        let total = if limit.is_zero() {
            EFFECTIVELY_FOREVER
        } else {
            limit
        };
        let deadline = Instant::now() + total;
        self.set_struct_timeout(POLL_STEP)?;

        let mut written = 0;
        loop {
            self.check_canceled()?;
            match self.port.write(&buf[written..]) {
                Ok(0) => std::thread::sleep(EVENT_POLL_STEP),
                Ok(n) => {
                    written += n;
                    if written == buf.len() {
                        return Ok(written);
                    }
                }
                Err(e) if retryable(&e) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Ok(written);
            }
        }
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }

    fn bytes_to_write(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_write()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }

    fn purge(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(io::Error::from)
    }

    fn cancel_pending(&mut self) -> io::Result<()> {
        self.shared.canceled.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn wait_event(&mut self, slice: Duration, gate: &WaitGate) -> io::Result<WaitOutcome> {
        let mask = *self.shared.events.lock();
        let deadline = Instant::now() + slice;
        loop {
            self.check_canceled()?;

            let mut fired = HostEvents::empty();
            if mask.contains(HostEvents::RX_CHAR)
                && self.port.bytes_to_read().map_err(io::Error::from)? > 0
            {
                fired |= HostEvents::RX_CHAR;
            }
            if mask.contains(HostEvents::TX_EMPTY) {
                let depth = self.port.bytes_to_write().map_err(io::Error::from)? as usize;
                if depth == 0 && self.last_tx_depth.is_some_and(|prev| prev > 0) {
                    fired |= HostEvents::TX_EMPTY;
                }
                self.last_tx_depth = Some(depth);
            }
            if mask.intersects(
                HostEvents::CTS | HostEvents::DSR | HostEvents::RING | HostEvents::RLSD,
            ) {
                let lines = self.sample_modem()?;
                if let Some(prev) = self.last_modem {
                    let changed = prev.symmetric_difference(lines);
                    if changed.contains(ModemLines::CTS) && mask.contains(HostEvents::CTS) {
                        fired |= HostEvents::CTS;
                    }
                    if changed.contains(ModemLines::DSR) && mask.contains(HostEvents::DSR) {
                        fired |= HostEvents::DSR;
                    }
                    if changed.contains(ModemLines::RING) && mask.contains(HostEvents::RING) {
                        fired |= HostEvents::RING;
                    }
                    if changed.contains(ModemLines::RLSD) && mask.contains(HostEvents::RLSD) {
                        fired |= HostEvents::RLSD;
                    }
                }
                self.last_modem = Some(lines);
            }

            if !fired.is_empty() {
                return Ok(WaitOutcome::Signaled(fired));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            if gate.nap(EVENT_POLL_STEP.min(deadline - now)) {
                return Ok(WaitOutcome::TimedOut);
            }
        }
    }

    /// `serialport` exposes no latched error counters, so only the queue
    /// depth is reported; line faults surface through failed transfers
    /// instead.
    fn drain_errors(&mut self) -> io::Result<(LineErrors, usize)> {
        let depth = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
        Ok((LineErrors::empty(), depth))
    }

    fn modem_status(&mut self) -> io::Result<ModemLines> {
        self.sample_modem()
    }

    fn escape(&mut self, control: LineControl) -> io::Result<()> {
        match control {
            LineControl::SetRts => self.port.write_request_to_send(true),
            LineControl::ClearRts => self.port.write_request_to_send(false),
            LineControl::SetDtr => self.port.write_data_terminal_ready(true),
            LineControl::ClearDtr => self.port.write_data_terminal_ready(false),
            LineControl::SetBreak => self.port.set_break(),
            LineControl::ClearBreak => self.port.clear_break(),
        }
        .map_err(io::Error::from)
    }

    fn try_clone(&self) -> io::Result<Box<dyn HostTransport>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(Self {
            port,
            path: self.path.clone(),
            shared: Arc::clone(&self.shared),
            last_tx_depth: None,
            last_modem: None,
        }))
    }
}

impl NativeTransport {
    fn sample_modem(&mut self) -> io::Result<ModemLines> {
        let mut lines = ModemLines::empty();
        if self.port.read_clear_to_send().map_err(io::Error::from)? {
            lines |= ModemLines::CTS;
        }
        if self.port.read_data_set_ready().map_err(io::Error::from)? {
            lines |= ModemLines::DSR;
        }
        if self.port.read_ring_indicator().map_err(io::Error::from)? {
            lines |= ModemLines::RING;
        }
        if self.port.read_carrier_detect().map_err(io::Error::from)? {
            lines |= ModemLines::RLSD;
        }
        Ok(lines)
    }
}

impl std::fmt::Debug for NativeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeTransport")
            .field("path", &self.path)
            .field("canceled", &self.shared.canceled.load(Ordering::Relaxed))
            .finish()
    }
}

fn convert_data_bits(bits: DataBits) -> serialport::DataBits {
    match bits {
        DataBits::Five => serialport::DataBits::Five,
        DataBits::Six => serialport::DataBits::Six,
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    }
}

fn convert_stop_bits(bits: StopBits) -> io::Result<serialport::StopBits> {
    match bits {
        StopBits::One => Ok(serialport::StopBits::One),
        StopBits::Two => Ok(serialport::StopBits::Two),
        StopBits::OnePointFive => Err(unsupported("1.5 stop bits")),
    }
}

fn convert_parity(parity: Parity) -> io::Result<serialport::Parity> {
    match parity {
        Parity::None => Ok(serialport::Parity::None),
        Parity::Odd => Ok(serialport::Parity::Odd),
        Parity::Even => Ok(serialport::Parity::Even),
        Parity::Mark => Err(unsupported("mark parity")),
        Parity::Space => Err(unsupported("space parity")),
    }
}

/// `serialport` models flow control as one tri-state; hardware handshake
/// wins over software when both are derived, mirroring the precedence the
/// profile already encodes in its line modes.
fn select_flow_control(profile: &LineProfile) -> io::Result<serialport::FlowControl> {
    if profile.rts_mode == RtsMode::Toggle {
        return Err(unsupported("RS-485 transmit toggle"));
    }
    if profile.cts_out_flow
        || profile.dsr_out_flow
        || profile.rts_mode == RtsMode::Handshake
        || profile.dtr_mode == DtrMode::Handshake
    {
        Ok(serialport::FlowControl::Hardware)
    } else if profile.xon_xoff_in || profile.xon_xoff_out {
        Ok(serialport::FlowControl::Software)
    } else {
        Ok(serialport::FlowControl::None)
    }
}

fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{what} is not supported by this backend"),
    )
}

/// Device listing via `serialport::available_ports`.
#[derive(Debug, Default)]
pub struct NativeEnumerator;

impl DeviceEnumerator for NativeEnumerator {
    fn scan(&self) -> io::Result<Vec<HostDeviceInfo>> {
        let ports = serialport::available_ports().map_err(io::Error::from)?;
        debug!(count = ports.len(), "host enumeration pass");
        Ok(ports.into_iter().map(device_info_from).collect())
    }
}

/// Map one enumerated port into the raw property set discovery consumes.
fn device_info_from(info: serialport::SerialPortInfo) -> HostDeviceInfo {
    let mut device = HostDeviceInfo {
        port_name: info.port_name,
        ..Default::default()
    };
    if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
        device.friendly_name = usb.product.clone();
        device.bus_description = usb.product;
        device.serial_number = usb.serial_number;
        if device.friendly_name.is_none() {
            device.friendly_name = usb.manufacturer;
        }
    }
    device
}

/// Opens handles through the `serialport` builder.
///
/// The line is left at the builder's initial parameters; configuration is a
/// separate step after open.
#[derive(Debug, Default)]
pub struct NativeOpener;

impl PortOpener for NativeOpener {
    fn open(&self, path: &str) -> io::Result<Box<dyn HostTransport>> {
        let port = serialport::new(path, 9600)
            .timeout(POLL_STEP)
            .open()
            .map_err(io::Error::from)?;
        Ok(Box::new(NativeTransport::new(port, path.to_string())))
    }
}

impl HostServices {
    /// Capability bundle backed by the `serialport` crate.
    ///
    /// No vendor description lookup ships with this backend; embedders with
    /// a vendor library inject their own.
    pub fn native() -> Self {
        Self {
            enumerator: Box::new(NativeEnumerator),
            opener: Box::new(NativeOpener),
            vendor: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    #[test]
    fn test_open_nonexistent_port_fails() {
        let result = NativeOpener.open("/dev/nonexistent_port_12345");
        assert!(result.is_err());
    }

    #[test]
    fn test_data_bits_conversion() {
        assert_eq!(
            convert_data_bits(DataBits::Eight),
            serialport::DataBits::Eight
        );
        assert_eq!(convert_data_bits(DataBits::Five), serialport::DataBits::Five);
    }

    #[test]
    fn test_unsupported_line_modes_are_rejected() {
        assert!(convert_stop_bits(StopBits::OnePointFive).is_err());
        assert!(convert_parity(Parity::Mark).is_err());
        assert!(convert_parity(Parity::Space).is_err());
        assert_eq!(
            convert_stop_bits(StopBits::Two).unwrap(),
            serialport::StopBits::Two
        );
    }

    #[test]
    fn test_flow_control_selection() {
        let mut profile = base_profile();
        assert_eq!(
            select_flow_control(&profile).unwrap(),
            serialport::FlowControl::None
        );

        profile.cts_out_flow = true;
        profile.rts_mode = RtsMode::Handshake;
        assert_eq!(
            select_flow_control(&profile).unwrap(),
            serialport::FlowControl::Hardware
        );

        profile.cts_out_flow = false;
        profile.rts_mode = RtsMode::Enable;
        profile.xon_xoff_in = true;
        assert_eq!(
            select_flow_control(&profile).unwrap(),
            serialport::FlowControl::Software
        );

        profile.rts_mode = RtsMode::Toggle;
        assert!(select_flow_control(&profile).is_err());
    }

    #[test]
    fn test_usb_device_mapping() {
        let info = serialport::SerialPortInfo {
            port_name: "/dev/ttyUSB0".to_string(),
            port_type: serialport::SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x0403,
                pid: 0x6001,
                serial_number: Some("A5012345".to_string()),
                manufacturer: Some("FTDI".to_string()),
                product: Some("FT232R USB UART".to_string()),
            }),
        };

        let device = device_info_from(info);
        assert_eq!(device.port_name, "/dev/ttyUSB0");
        assert_eq!(device.friendly_name.as_deref(), Some("FT232R USB UART"));
        assert_eq!(device.bus_description.as_deref(), Some("FT232R USB UART"));
        assert_eq!(device.serial_number.as_deref(), Some("A5012345"));
        assert_eq!(device.bus_number, None);
    }

    #[test]
    fn test_unknown_device_mapping_is_bare() {
        let info = serialport::SerialPortInfo {
            port_name: "COM1".to_string(),
            port_type: serialport::SerialPortType::Unknown,
        };

        let device = device_info_from(info);
        assert_eq!(device.port_name, "COM1");
        assert_eq!(device.friendly_name, None);
        assert_eq!(device.bus_description, None);
    }

    fn base_profile() -> LineProfile {
        LineProfile {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            cts_out_flow: false,
            dsr_out_flow: false,
            dsr_sensitivity: false,
            dtr_mode: DtrMode::Enable,
            rts_mode: RtsMode::Enable,
            xon_xoff_in: false,
            xon_xoff_out: false,
            xon_char: 0x11,
            xoff_char: 0x13,
            send_queue_size: 4096,
            receive_queue_size: 4096,
        }
    }
}

//! Caller-facing port configuration and its derivation into host terms.
//!
//! [`PortSettings`] is the complete configurable surface of an open port:
//! line parameters, flow control, explicit line presets, timeout policy, and
//! the monitored event set. The derivation methods resolve it into the
//! [`LineProfile`], [`TimeoutPlan`], and [`HostEvents`] mask a transport
//! consumes, applying the line-mode priority rules along the way.

use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::host::{
    DataBits, DtrMode, HostEvents, LineProfile, Parity, ReadPlan, RtsMode, StopBits, TimeoutPlan,
    EFFECTIVELY_FOREVER,
};

bitflags! {
    /// Flow control selections. Hardware pairs couple: requesting RTS also
    /// enables CTS output flow, and requesting DTR also enables DSR output
    /// flow and sensitivity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct FlowControl: u32 {
        const CTS = 1 << 0;
        const RTS = 1 << 1;
        const DSR = 1 << 2;
        const DTR = 1 << 3;
        const XON_XOFF_IN = 1 << 4;
        const XON_XOFF_OUT = 1 << 5;
    }
}

bitflags! {
    /// Events a caller can monitor, and the result bits `wait_for_event`
    /// reports. An empty result means the wait timed out.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct PortEvent: u32 {
        /// Bytes are queued for reading.
        const DATA_AVAILABLE = 1 << 0;
        /// Bytes arrived; reads are switched to a short-silence policy so a
        /// listener can deliver data promptly.
        const DATA_RECEIVED = 1 << 1;
        /// The transmit queue drained to empty.
        const DATA_WRITTEN = 1 << 2;
        const BREAK_INTERRUPT = 1 << 3;
        const CTS = 1 << 4;
        const DSR = 1 << 5;
        const RING_INDICATOR = 1 << 6;
        const CARRIER_DETECT = 1 << 7;
        const FRAMING_ERROR = 1 << 8;
        /// Character overrun in the device or driver.
        const FIRMWARE_OVERRUN = 1 << 9;
        /// Receive buffer overflow in the host.
        const SOFTWARE_OVERRUN = 1 << 10;
        const PARITY_ERROR = 1 << 11;
        /// The device vanished or the wait failed at the host level.
        const DISCONNECTED = 1 << 12;
    }
}

/// Read completion policy selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutMode {
    /// Reads return immediately with whatever is queued.
    #[default]
    NonBlocking,
    /// Reads wait for the first byte up to the read timeout, then return.
    SemiBlocking,
    /// Reads wait for the full request up to the read timeout.
    Blocking,
    /// Reads wait for the first byte indefinitely.
    Scanner,
}

/// Read/write timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default)]
    pub mode: TimeoutMode,
    /// Read timeout; zero means "no limit" in the modes that wait.
    #[serde(default, with = "duration_millis")]
    pub read: Duration,
    /// Write timeout; zero means writes are not time-limited.
    #[serde(default, with = "duration_millis")]
    pub write: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            mode: TimeoutMode::NonBlocking,
            read: Duration::ZERO,
            write: Duration::ZERO,
        }
    }
}

/// Durations cross the serde boundary as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Complete configuration for one open port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSettings {
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: DataBits,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: StopBits,
    #[serde(default = "default_parity")]
    pub parity: Parity,
    #[serde(default)]
    pub flow_control: FlowControl,
    /// DTR preset applied when DTR is not part of the flow-control set.
    #[serde(default = "default_line_preset")]
    pub dtr: bool,
    /// RTS preset applied when neither RS-485 nor RTS flow control claims
    /// the line.
    #[serde(default = "default_line_preset")]
    pub rts: bool,
    /// RS-485 transmit-toggle mode. Takes the RTS line over unconditionally.
    #[serde(default)]
    pub rs485_mode: bool,
    #[serde(default = "default_xon_char")]
    pub xon_char: u8,
    #[serde(default = "default_xoff_char")]
    pub xoff_char: u8,
    #[serde(default = "default_queue_size")]
    pub send_queue_size: usize,
    #[serde(default = "default_queue_size")]
    pub receive_queue_size: usize,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Events to include in the host mask for `wait_for_event`.
    #[serde(default)]
    pub monitored: PortEvent,
    /// Apply the full configuration inside `open`. When disabled, `open`
    /// only acquires the handle and the caller configures explicitly.
    #[serde(default = "default_auto_configure")]
    pub auto_configure: bool,
    /// Purge both queues after a successful auto-configuration.
    #[serde(default)]
    pub auto_flush: bool,
}

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_QUEUE_SIZE: usize = 4096;

/// Default baud rate (9600 bps).
pub fn default_baud() -> u32 {
    DEFAULT_BAUD_RATE
}

/// Default data bits (8).
pub fn default_data_bits() -> DataBits {
    DataBits::Eight
}

/// Default stop bits (1).
pub fn default_stop_bits() -> StopBits {
    StopBits::One
}

/// Default parity (none).
pub fn default_parity() -> Parity {
    Parity::None
}

/// DTR and RTS are asserted on open unless configured otherwise.
pub fn default_line_preset() -> bool {
    true
}

/// Default XON character (DC1).
pub fn default_xon_char() -> u8 {
    0x11
}

/// Default XOFF character (DC3).
pub fn default_xoff_char() -> u8 {
    0x13
}

/// Default device queue size (4096 bytes each direction).
pub fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

/// Auto-configuration inside `open` is on by default.
pub fn default_auto_configure() -> bool {
    true
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud_rate: default_baud(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: default_parity(),
            flow_control: FlowControl::empty(),
            dtr: default_line_preset(),
            rts: default_line_preset(),
            rs485_mode: false,
            xon_char: default_xon_char(),
            xoff_char: default_xoff_char(),
            send_queue_size: default_queue_size(),
            receive_queue_size: default_queue_size(),
            timeouts: TimeoutSettings::default(),
            monitored: PortEvent::empty(),
            auto_configure: default_auto_configure(),
            auto_flush: false,
        }
    }
}

impl PortSettings {
    /// Resolve the line configuration a transport applies in one call.
    ///
    /// Line-mode priority: RS-485 toggle wins the RTS line over handshake,
    /// which wins over the explicit preset; the DTR line resolves handshake
    /// over preset. Requesting CTS or RTS flow enables CTS output flow, and
    /// requesting DSR or DTR flow enables DSR output flow plus sensitivity.
    pub fn line_profile(&self) -> LineProfile {
        let cts_out_flow = self
            .flow_control
            .intersects(FlowControl::CTS | FlowControl::RTS);
        let dsr_coupled = self
            .flow_control
            .intersects(FlowControl::DSR | FlowControl::DTR);

        let rts_mode = if self.rs485_mode {
            RtsMode::Toggle
        } else if self.flow_control.contains(FlowControl::RTS) {
            RtsMode::Handshake
        } else if self.rts {
            RtsMode::Enable
        } else {
            RtsMode::Disable
        };

        let dtr_mode = if self.flow_control.contains(FlowControl::DTR) {
            DtrMode::Handshake
        } else if self.dtr {
            DtrMode::Enable
        } else {
            DtrMode::Disable
        };

        LineProfile {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
            cts_out_flow,
            dsr_out_flow: dsr_coupled,
            dsr_sensitivity: dsr_coupled,
            dtr_mode,
            rts_mode,
            xon_xoff_in: self.flow_control.contains(FlowControl::XON_XOFF_IN),
            xon_xoff_out: self.flow_control.contains(FlowControl::XON_XOFF_OUT),
            xon_char: self.xon_char,
            xoff_char: self.xoff_char,
            send_queue_size: self.send_queue_size,
            receive_queue_size: self.receive_queue_size,
        }
    }

    /// Resolve the timeout plan for the configured mode.
    ///
    /// Monitoring `DATA_RECEIVED` overrides the mode: reads switch to a
    /// first-byte policy capped at one second of silence and writes become
    /// fire-and-forget, so an event listener always regains control quickly.
    pub fn timeout_plan(&self) -> TimeoutPlan {
        if self.monitored.contains(PortEvent::DATA_RECEIVED) {
            return TimeoutPlan {
                read: ReadPlan::FirstByte {
                    total: Duration::from_millis(1000),
                },
                write: Duration::ZERO,
            };
        }

        let read = match self.timeouts.mode {
            TimeoutMode::Scanner => ReadPlan::FirstByte {
                total: EFFECTIVELY_FOREVER,
            },
            TimeoutMode::SemiBlocking => ReadPlan::FirstByte {
                total: if self.timeouts.read.is_zero() {
                    EFFECTIVELY_FOREVER
                } else {
                    self.timeouts.read
                },
            },
            TimeoutMode::Blocking => ReadPlan::Fixed {
                total: self.timeouts.read,
            },
            TimeoutMode::NonBlocking => ReadPlan::Immediate,
        };

        TimeoutPlan {
            read,
            write: self.timeouts.write,
        }
    }

    /// Resolve the host event mask from the monitored set.
    ///
    /// The error condition is always included so line faults reach the
    /// monitor even when nothing else is requested.
    pub fn host_events(&self) -> HostEvents {
        let mut events = HostEvents::ERR;
        if self
            .monitored
            .intersects(PortEvent::DATA_AVAILABLE | PortEvent::DATA_RECEIVED)
        {
            events |= HostEvents::RX_CHAR;
        }
        if self.monitored.contains(PortEvent::DATA_WRITTEN) {
            events |= HostEvents::TX_EMPTY;
        }
        if self.monitored.contains(PortEvent::BREAK_INTERRUPT) {
            events |= HostEvents::BREAK;
        }
        if self.monitored.contains(PortEvent::CTS) {
            events |= HostEvents::CTS;
        }
        if self.monitored.contains(PortEvent::DSR) {
            events |= HostEvents::DSR;
        }
        if self.monitored.contains(PortEvent::RING_INDICATOR) {
            events |= HostEvents::RING;
        }
        if self.monitored.contains(PortEvent::CARRIER_DETECT) {
            events |= HostEvents::RLSD;
        }
        events
    }
}

//! Error types and last-error capture.
//!
//! Every fallible engine operation returns a [`PortError`] describing what
//! failed. In addition, the failing step and its OS error code are recorded in
//! an [`ErrorSlot`] (one per port, one on the engine) so callers that poll
//! status after the fact can retrieve the most recent failure without holding
//! on to the `Result`.

use parking_lot::Mutex;
use thiserror::Error;

/// Errors that can occur during registry and port operations.
#[derive(Debug, Error)]
pub enum PortError {
    /// The specified serial port is not known to the registry.
    #[error("Serial port not found: {0}")]
    NotFound(String),

    /// Attempted to open a port that's already open.
    #[error("Port is already open")]
    AlreadyOpen,

    /// Attempted to use a port that's not open.
    #[error("Port is not open")]
    NotOpen,

    /// Device enumeration failed; the registry was left unchanged.
    #[error("Device enumeration failed: {0}")]
    Enumerate(#[source] std::io::Error),

    /// The host refused to open the device.
    #[error("Failed to open port: {0}")]
    Open(#[source] std::io::Error),

    /// Applying line parameters failed; the previous configuration remains
    /// in effect.
    #[error("Failed to configure port: {0}")]
    Config(#[source] std::io::Error),

    /// Applying the timeout plan or event mask failed.
    #[error("Failed to configure timeouts: {0}")]
    Timeouts(#[source] std::io::Error),

    /// Purging pending I/O failed.
    #[error("Failed to flush port: {0}")]
    Flush(#[source] std::io::Error),

    /// A read transfer failed at the host level.
    #[error("Read failed: {0}")]
    Read(#[source] std::io::Error),

    /// A write transfer failed at the host level.
    #[error("Write failed: {0}")]
    Write(#[source] std::io::Error),

    /// Waiting for a line event failed at the host level.
    #[error("Event wait failed: {0}")]
    Wait(#[source] std::io::Error),

    /// Querying queue depth failed.
    #[error("Queue query failed: {0}")]
    Queue(#[source] std::io::Error),

    /// Driving a control line or break condition failed.
    #[error("Line control failed: {0}")]
    LineControl(#[source] std::io::Error),

    /// The device vanished while an operation was in flight.
    #[error("Device disconnected")]
    Disconnected,
}

impl PortError {
    /// Create a NotFound error from a port path.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// The numeric code recorded for this error.
    ///
    /// OS-originated errors report the raw OS code; pre-OS failures use the
    /// engine's internal codes ([`NO_SUCH_PORT`], [`PORT_ALREADY_OPEN`]).
    pub fn code(&self) -> i32 {
        match self {
            Self::NotFound(_) | Self::NotOpen => NO_SUCH_PORT,
            Self::AlreadyOpen => PORT_ALREADY_OPEN,
            Self::Disconnected => DISCONNECTED,
            Self::Enumerate(e)
            | Self::Open(e)
            | Self::Config(e)
            | Self::Timeouts(e)
            | Self::Flush(e)
            | Self::Read(e)
            | Self::Write(e)
            | Self::Wait(e)
            | Self::Queue(e)
            | Self::LineControl(e) => os_code(e),
        }
    }
}

/// Internal code: the requested path has no record, or the port is not open.
pub const NO_SUCH_PORT: i32 = 1;
/// Internal code: the record's handle is already live.
pub const PORT_ALREADY_OPEN: i32 = 2;
/// Internal code: the device vanished mid-operation.
pub const DISCONNECTED: i32 = 3;

/// Extract the raw OS error code, or -1 when the error carries none.
pub(crate) fn os_code(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(-1)
}

/// The engine step a recorded failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Enumerate,
    Open,
    Configure,
    ConfigureTimeouts,
    Flush,
    Read,
    Write,
    Wait,
    Queue,
    LineControl,
    Close,
}

/// The most recent recorded outcome: which step, and the host's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastError {
    pub stage: Stage,
    pub code: i32,
}

/// Overwrite-on-record storage for the most recent [`LastError`].
///
/// Lifecycle operations record into both the port's slot and the engine's;
/// per-port I/O records into the port's slot only. `close()` records its
/// outcome unconditionally, with code 0 on success.
#[derive(Debug, Default)]
pub struct ErrorSlot(Mutex<Option<LastError>>);

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a (stage, code) pair, replacing any previous entry.
    pub fn record(&self, stage: Stage, code: i32) {
        *self.0.lock() = Some(LastError { stage, code });
    }

    /// The most recent recorded entry, if any failure (or close) has occurred.
    pub fn get(&self) -> Option<LastError> {
        *self.0.lock()
    }
}

//! Serial Port Registry and Transport Engine
//!
//! This library discovers the serial devices attached to a host, keeps a
//! stable identity for each across repeated discovery passes, and manages the
//! open/configure/transfer/monitor lifecycle of port sessions with pluggable
//! timeout policies. The host itself sits behind an injected capability
//! bundle, so the same engine runs over real hardware or over the scriptable
//! mock backend.
//!
//! # Modules
//!
//! - `engine`: registry refresh, port snapshots, and session opening
//! - `handle`: operations on one open port (configure, transfer, events)
//! - `settings`: caller-facing configuration and the policies derived from it
//! - `host`: host abstraction with the native `serialport` backend and a mock
//! - `error`: error types and last-error capture

pub mod engine;
pub mod error;
pub mod handle;
pub mod host;
pub mod settings;

mod discovery;
mod record;
mod registry;

// Re-export the primary surface for convenience
pub use engine::{PortEngine, PortInfo};
pub use error::{LastError, PortError, Stage};
pub use handle::PortHandle;
pub use settings::{FlowControl, PortEvent, PortSettings, TimeoutMode, TimeoutSettings};

// Line-level types shared between settings and the host contract
pub use host::{DataBits, HostServices, ModemLines, Parity, StopBits};

// Mock backend, compiled unconditionally so embedders can test against it
pub use host::mock::MockHost;

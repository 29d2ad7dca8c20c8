//! Caller-facing handle over one port record.
//!
//! A [`PortHandle`] is a cheap clone of an `Arc` pair; any number of handles
//! to the same path observe the same session, buffer, and error slot. All
//! operations are synchronous: reads, writes, and event waits block the
//! calling thread under the configured timeout policy, each against its own
//! transport clone so they never serialize on one lock.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{os_code, ErrorSlot, LastError, PortError, Stage};
use crate::host::{
    HostEvents, LineControl, LineErrors, ModemLines, TimeoutPlan, WaitOutcome,
};
use crate::record::{OpenStreams, PortRecord};
use crate::settings::{PortEvent, PortSettings};

/// Upper bound on one event-wait pass; the cancellation latency of
/// [`PortHandle::wait_for_event`].
const EVENT_SLICE: Duration = Duration::from_millis(500);

/// A failure caused by the session being canceled out from under the call is
/// a disconnect; anything else keeps its own error and OS code.
fn classify_io(e: io::Error, wrap: fn(io::Error) -> PortError) -> PortError {
    if e.kind() == io::ErrorKind::ConnectionAborted {
        PortError::Disconnected
    } else {
        wrap(e)
    }
}

/// Handle to one registered port.
///
/// Obtained from [`PortEngine::open`](crate::PortEngine::open). Clones refer
/// to the same underlying record; closing through any of them closes the
/// session for all.
#[derive(Debug, Clone)]
pub struct PortHandle {
    record: Arc<PortRecord>,
    engine_errors: Arc<ErrorSlot>,
}

impl PortHandle {
    pub(crate) fn new(record: Arc<PortRecord>, engine_errors: Arc<ErrorSlot>) -> Self {
        Self {
            record,
            engine_errors,
        }
    }

    /// The endpoint path this handle refers to.
    pub fn path(&self) -> &str {
        &self.record.path
    }

    /// Whether a session is currently live on the record.
    pub fn is_open(&self) -> bool {
        self.record.is_open()
    }

    /// The most recent failure (or close outcome) recorded against this port.
    pub fn last_error(&self) -> Option<LastError> {
        self.record.last_error.get()
    }

    /// Record a failure against the port slot only.
    fn fail_port(&self, stage: Stage, err: PortError) -> PortError {
        self.record.last_error.record(stage, err.code());
        err
    }

    /// Record a failure against both the port slot and the engine slot;
    /// lifecycle operations are visible at either scope.
    pub(crate) fn fail_both(&self, stage: Stage, err: PortError) -> PortError {
        let code = err.code();
        self.record.last_error.record(stage, code);
        self.engine_errors.record(stage, code);
        err
    }

    fn streams_for_io(&self, stage: Stage) -> Result<Arc<OpenStreams>, PortError> {
        self.record
            .streams()
            .ok_or_else(|| self.fail_port(stage, PortError::NotOpen))
    }

    fn streams_for_lifecycle(&self, stage: Stage) -> Result<Arc<OpenStreams>, PortError> {
        self.record
            .streams()
            .ok_or_else(|| self.fail_both(stage, PortError::NotOpen))
    }

    /// Apply the full line configuration, then the timeout plan and event
    /// mask derived from the same settings.
    ///
    /// Line parameters are applied as one unit: on failure the previous
    /// configuration remains in effect and the session stays usable.
    pub fn configure(&self, settings: &PortSettings) -> Result<(), PortError> {
        let streams = self.streams_for_lifecycle(Stage::Configure)?;
        let profile = settings.line_profile();
        trace!(path = %self.record.path, baud = profile.baud_rate, "configuring line");
        if let Err(e) = streams.control.lock().apply_settings(&profile) {
            return Err(self.fail_both(Stage::Configure, PortError::Config(e)));
        }
        self.configure_timeouts(settings)
    }

    /// Apply only the timeout plan and monitored-event mask.
    ///
    /// Independent of [`configure`](Self::configure) so completion policy can
    /// be switched without renegotiating line parameters.
    pub fn configure_timeouts(&self, settings: &PortSettings) -> Result<(), PortError> {
        let streams = self.streams_for_lifecycle(Stage::ConfigureTimeouts)?;
        let plan = settings.timeout_plan();
        let events = settings.host_events();
        if let Err(e) = streams.control.lock().apply_timeouts(&plan, events) {
            return Err(self.fail_both(Stage::ConfigureTimeouts, PortError::Timeouts(e)));
        }
        Ok(())
    }

    /// Read up to `max_bytes`, governed by the configured timeout mode.
    ///
    /// A timeout completes with whatever arrived, possibly an empty buffer;
    /// only genuine host failures return an error, and a session canceled out
    /// from under the call reports [`PortError::Disconnected`]. The staging
    /// buffer behind the returned bytes grows to the largest request ever
    /// made on this record and is reused across calls.
    pub fn read(&self, max_bytes: usize) -> Result<Vec<u8>, PortError> {
        let streams = self.streams_for_io(Stage::Read)?;
        let mut staging = self.record.staging.lock();
        if staging.len() < max_bytes {
            staging.resize(max_bytes, 0);
        }
        let result = streams.reader.lock().read(&mut staging[..max_bytes]);
        match result {
            Ok(n) => Ok(staging[..n].to_vec()),
            Err(e) => Err(self.fail_port(Stage::Read, classify_io(e, PortError::Read))),
        }
    }

    /// Write `data`, governed by the configured write timeout.
    ///
    /// Returns the number of bytes the host accepted; a short count under a
    /// full output queue is a valid outcome, not an error.
    pub fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        let streams = self.streams_for_io(Stage::Write)?;
        let result = streams.writer.lock().write(data);
        result.map_err(|e| self.fail_port(Stage::Write, classify_io(e, PortError::Write)))
    }

    /// Bytes queued on the receive side, without blocking.
    pub fn bytes_available(&self) -> Result<usize, PortError> {
        let streams = self.streams_for_io(Stage::Queue)?;
        let result = streams.control.lock().bytes_to_read();
        result.map_err(|e| self.fail_port(Stage::Queue, PortError::Queue(e)))
    }

    /// Bytes not yet drained from the transmit side, without blocking.
    pub fn bytes_awaiting_write(&self) -> Result<usize, PortError> {
        let streams = self.streams_for_io(Stage::Queue)?;
        let result = streams.control.lock().bytes_to_write();
        result.map_err(|e| self.fail_port(Stage::Queue, PortError::Queue(e)))
    }

    /// Discard both queues and abandon in-flight transfers.
    pub fn flush(&self) -> Result<(), PortError> {
        let streams = self.streams_for_io(Stage::Flush)?;
        let result = streams.control.lock().purge();
        result.map_err(|e| self.fail_port(Stage::Flush, PortError::Flush(e)))
    }

    /// Raise or clear the listener gate consumed by
    /// [`wait_for_event`](Self::wait_for_event).
    pub fn set_listening(&self, listening: bool) {
        debug!(path = %self.record.path, listening, "listener gate");
        self.record.gate.set(listening);
    }

    /// Block until a monitored condition fires, the gate is cleared, or the
    /// host reports a failure.
    ///
    /// Never returns an error: a wait failure is recorded in the port's error
    /// slot and reported as [`PortEvent::DISCONNECTED`], and a cleared gate
    /// yields the empty set after at most one wait slice. Each signaled
    /// condition is qualified against live state before being reported, so a
    /// data signal with an empty input queue or a line signal whose level
    /// already dropped back produces nothing.
    pub fn wait_for_event(&self) -> PortEvent {
        let Some(streams) = self.record.streams() else {
            return PortEvent::empty();
        };
        loop {
            let outcome = streams.monitor.lock().wait_event(EVENT_SLICE, &self.record.gate);
            match outcome {
                Ok(WaitOutcome::Signaled(signaled)) => {
                    return self.qualify_events(&streams, signaled);
                }
                Ok(WaitOutcome::TimedOut) => {
                    if !self.record.gate.is_set() {
                        return PortEvent::empty();
                    }
                }
                Err(e) => {
                    let err = classify_io(e, PortError::Wait);
                    self.record.last_error.record(Stage::Wait, err.code());
                    return PortEvent::DISCONNECTED;
                }
            }
        }
    }

    /// Translate raw signaled conditions into the caller-facing event set.
    fn qualify_events(&self, streams: &OpenStreams, signaled: HostEvents) -> PortEvent {
        let mut events = PortEvent::empty();
        let mut monitor = streams.monitor.lock();

        // Latched error flags ride along with every signal; draining them
        // also reports the input queue depth used to qualify data signals.
        let (errors, queued) = monitor.drain_errors().unwrap_or((LineErrors::empty(), 0));
        if errors.contains(LineErrors::BREAK) {
            events |= PortEvent::BREAK_INTERRUPT;
        }
        if errors.contains(LineErrors::FRAME) {
            events |= PortEvent::FRAMING_ERROR;
        }
        if errors.contains(LineErrors::OVERRUN) {
            events |= PortEvent::FIRMWARE_OVERRUN;
        }
        if errors.contains(LineErrors::RX_OVERFLOW) {
            events |= PortEvent::SOFTWARE_OVERRUN;
        }
        if errors.contains(LineErrors::PARITY) {
            events |= PortEvent::PARITY_ERROR;
        }

        if signaled.contains(HostEvents::BREAK) {
            events |= PortEvent::BREAK_INTERRUPT;
        }
        if signaled.contains(HostEvents::TX_EMPTY) {
            events |= PortEvent::DATA_WRITTEN;
        }
        if signaled.contains(HostEvents::RX_CHAR) && queued > 0 {
            events |= PortEvent::DATA_AVAILABLE;
        }

        let line_signals =
            HostEvents::CTS | HostEvents::DSR | HostEvents::RING | HostEvents::RLSD;
        if signaled.intersects(line_signals) {
            // A change signal only counts while the line still reads high.
            let lines = monitor.modem_status().unwrap_or(ModemLines::empty());
            if signaled.contains(HostEvents::CTS) && lines.contains(ModemLines::CTS) {
                events |= PortEvent::CTS;
            }
            if signaled.contains(HostEvents::DSR) && lines.contains(ModemLines::DSR) {
                events |= PortEvent::DSR;
            }
            if signaled.contains(HostEvents::RING) && lines.contains(ModemLines::RING) {
                events |= PortEvent::RING_INDICATOR;
            }
            if signaled.contains(HostEvents::RLSD) && lines.contains(ModemLines::RLSD) {
                events |= PortEvent::CARRIER_DETECT;
            }
        }

        trace!(path = %self.record.path, ?events, "event qualified");
        events
    }

    pub fn set_rts(&self) -> Result<(), PortError> {
        self.escape(LineControl::SetRts)
    }

    pub fn clear_rts(&self) -> Result<(), PortError> {
        self.escape(LineControl::ClearRts)
    }

    pub fn set_dtr(&self) -> Result<(), PortError> {
        self.escape(LineControl::SetDtr)
    }

    pub fn clear_dtr(&self) -> Result<(), PortError> {
        self.escape(LineControl::ClearDtr)
    }

    /// Hold the transmit line in the break condition until cleared.
    pub fn set_break(&self) -> Result<(), PortError> {
        self.escape(LineControl::SetBreak)
    }

    pub fn clear_break(&self) -> Result<(), PortError> {
        self.escape(LineControl::ClearBreak)
    }

    fn escape(&self, control: LineControl) -> Result<(), PortError> {
        let streams = self.streams_for_io(Stage::LineControl)?;
        let result = streams.control.lock().escape(control);
        result.map_err(|e| self.fail_port(Stage::LineControl, PortError::LineControl(e)))
    }

    /// Instantaneous levels of the modem input lines.
    pub fn line_status(&self) -> Result<ModemLines, PortError> {
        let streams = self.streams_for_io(Stage::LineControl)?;
        let result = streams.control.lock().modem_status();
        result.map_err(|e| self.fail_port(Stage::LineControl, PortError::LineControl(e)))
    }

    /// Close the session. Never fails observably: teardown problems are
    /// recorded, not returned, and a port that is already closed is left
    /// alone.
    ///
    /// Teardown order matters: the non-blocking timeout plan and empty event
    /// mask go in first so an in-progress read completes, then pending I/O is
    /// purged and canceled, then the gate is cleared to stop event waits. The
    /// host handle itself is released when the last in-flight operation drops
    /// its stream clone.
    pub fn close(&self) {
        let Some(streams) = self.record.take_streams() else {
            return;
        };
        debug!(path = %self.record.path, "closing port");
        let code = self.teardown(streams);
        self.record.last_error.record(Stage::Close, code);
        self.engine_errors.record(Stage::Close, code);
    }

    /// Tear the session down without recording an outcome, so the failure
    /// that forced the teardown stays retrievable in both slots.
    pub(crate) fn abandon(&self) {
        let Some(streams) = self.record.take_streams() else {
            return;
        };
        debug!(path = %self.record.path, "abandoning half-configured session");
        self.teardown(streams);
    }

    /// Unblock, drain, and release the session streams. Returns the code of
    /// the last failing step, or 0 when every step succeeded.
    fn teardown(&self, streams: Arc<OpenStreams>) -> i32 {
        let mut code = 0;
        {
            let mut control = streams.control.lock();
            if let Err(e) = control.apply_timeouts(&TimeoutPlan::non_blocking(), HostEvents::empty())
            {
                code = os_code(&e);
            }
            if let Err(e) = control.purge() {
                code = os_code(&e);
            }
            if let Err(e) = control.cancel_pending() {
                code = os_code(&e);
            }
            if let Err(e) = control.flush() {
                code = os_code(&e);
            }
        }
        self.record.gate.set(false);
        drop(streams);
        code
    }
}

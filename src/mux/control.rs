//! Runtime parameters readable and writable through
//! [`Multiplexer::control_get`](super::Multiplexer::control_get) and
//! [`Multiplexer::control_set`](super::Multiplexer::control_set).

use log::info;

use super::multiplexer::MuxInner;
use super::queue::StreamHandle;
use super::MuxState;
use crate::config::StopMode;
use crate::error::{MuxError, Result};
use crate::format::ts::types::PID_MAX;

/// A named parameter. Stream-level controls carry the stream they apply to.
///
/// Values are plain integers; booleans are 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    PcrPeriod,
    Bitrate,
    FixedBitrate,
    MaxBuffers,
    /// 0 for [`StopMode::Complete`], 1 for [`StopMode::Forced`].
    StopMode,
    TableGeneration,
    TablePeriod,
    TransportStreamId,
    ProgramNumber,
    PmtPid,
    PcrPid,
    DtsIntegrityThreshold(StreamHandle),
    MultiplexAheadLimit(StreamHandle),
    DontWaitLimit(StreamHandle),
    DecoderBufferBits(StreamHandle),
    IgnoreAutoPause(StreamHandle),
    IgnoreFirstDtsCheck(StreamHandle),
    IncludeRap(StreamHandle),
    StreamPid(StreamHandle),
}

impl Control {
    /// Session-wide parameters frozen while the session runs.
    fn is_session_setup(&self) -> bool {
        !matches!(
            self,
            Control::StopMode
                | Control::DtsIntegrityThreshold(_)
                | Control::MultiplexAheadLimit(_)
                | Control::DontWaitLimit(_)
                | Control::DecoderBufferBits(_)
                | Control::IgnoreAutoPause(_)
                | Control::IgnoreFirstDtsCheck(_)
                | Control::IncludeRap(_)
                | Control::StreamPid(_)
        )
    }
}

fn narrow<T: TryFrom<u64>>(control: Control, value: u64) -> Result<T> {
    T::try_from(value)
        .map_err(|_| MuxError::Config(format!("{:?}: value {} out of range", control, value)))
}

fn flag(control: Control, value: u64) -> Result<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(MuxError::Config(format!("{:?}: expected 0 or 1, got {}", control, value))),
    }
}

impl MuxInner {
    pub(crate) fn control_get(&self, control: Control) -> Result<u64> {
        let c = &self.config;
        let value = match control {
            Control::PcrPeriod => c.pcr_period,
            Control::Bitrate => c.bitrate,
            Control::FixedBitrate => c.fixed_bitrate as u64,
            Control::MaxBuffers => c.max_buffers as u64,
            Control::StopMode => c.stop_mode.value(),
            Control::TableGeneration => c.table_generation as u64,
            Control::TablePeriod => c.table_period,
            Control::TransportStreamId => c.transport_stream_id as u64,
            Control::ProgramNumber => c.program_number as u64,
            Control::PmtPid => c.pmt_pid as u64,
            Control::PcrPid => c.pcr_pid as u64,
            Control::DtsIntegrityThreshold(h) => self.queue(h)?.config.dts_integrity_threshold,
            Control::MultiplexAheadLimit(h) => self.queue(h)?.config.multiplex_ahead_limit,
            Control::DontWaitLimit(h) => self.queue(h)?.config.dont_wait_limit,
            Control::DecoderBufferBits(h) => self.queue(h)?.config.decoder_buffer_bits,
            Control::IgnoreAutoPause(h) => self.queue(h)?.config.ignore_auto_pause as u64,
            Control::IgnoreFirstDtsCheck(h) => self.queue(h)?.config.ignore_first_dts_check as u64,
            Control::IncludeRap(h) => self.queue(h)?.config.include_rap as u64,
            Control::StreamPid(h) => self.queue(h)?.pid as u64,
        };
        Ok(value)
    }

    pub(crate) fn control_set(&mut self, control: Control, value: u64) -> Result<()> {
        if control.is_session_setup() && !matches!(self.state, MuxState::New | MuxState::Stopped) {
            return Err(MuxError::InvalidState(format!(
                "{:?} cannot change while {}",
                control, self.state
            )));
        }

        let previous = self.config.clone();
        match control {
            Control::PcrPeriod => self.config.pcr_period = value,
            Control::Bitrate => self.config.bitrate = value,
            Control::FixedBitrate => self.config.fixed_bitrate = flag(control, value)?,
            Control::MaxBuffers => self.config.max_buffers = narrow(control, value)?,
            Control::StopMode => self.config.stop_mode = StopMode::from_value(value)?,
            Control::TableGeneration => self.config.table_generation = narrow(control, value)?,
            Control::TablePeriod => self.config.table_period = value,
            Control::TransportStreamId => self.config.transport_stream_id = narrow(control, value)?,
            Control::ProgramNumber => self.config.program_number = narrow(control, value)?,
            Control::PmtPid => self.config.pmt_pid = narrow(control, value)?,
            Control::PcrPid => self.config.pcr_pid = narrow(control, value)?,
            Control::DtsIntegrityThreshold(h) => {
                self.queue_mut(h)?.config.dts_integrity_threshold = value
            }
            Control::MultiplexAheadLimit(h) => self.queue_mut(h)?.config.multiplex_ahead_limit = value,
            Control::DontWaitLimit(h) => self.queue_mut(h)?.config.dont_wait_limit = value,
            Control::DecoderBufferBits(h) => self.queue_mut(h)?.config.decoder_buffer_bits = value,
            Control::IgnoreAutoPause(h) => {
                self.queue_mut(h)?.config.ignore_auto_pause = flag(control, value)?
            }
            Control::IgnoreFirstDtsCheck(h) => {
                self.queue_mut(h)?.config.ignore_first_dts_check = flag(control, value)?
            }
            Control::IncludeRap(h) => self.queue_mut(h)?.config.include_rap = flag(control, value)?,
            Control::StreamPid(h) => return self.set_stream_pid(h, value),
        }

        if let Err(e) = self.config.validate() {
            self.config = previous;
            return Err(e);
        }
        info!("{:?} set to {}", control, value);
        Ok(())
    }

    fn set_stream_pid(&mut self, h: StreamHandle, value: u64) -> Result<()> {
        let pid: u16 = narrow(Control::StreamPid(h), value)?;
        if pid > PID_MAX {
            return Err(MuxError::Config(format!("PID {:#x} out of range", pid)));
        }
        if self.queue(h)?.is_active() {
            return Err(MuxError::Busy(format!("{} is registered with the engine", h)));
        }
        if self.queues.iter().flatten().any(|q| q.handle != h && q.pid == pid) {
            return Err(MuxError::Config(format!("PID {:#x} already in use", pid)));
        }
        self.queue_mut(h)?.pid = pid;
        Ok(())
    }
}

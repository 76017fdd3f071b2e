//! Section streams: one stored PSI/SI table, emitted at the next clock slot.

use bytes::Bytes;
use log::{debug, info};

use super::frame::Frame;
use super::multiplexer::MuxInner;
use super::queue::{SectionState, StreamHandle};
use crate::error::{MuxError, Result};
use crate::format::ts::clock::ring_add;
use crate::format::ts::clock::ms_to_ticks;

impl MuxInner {
    fn section_state(&mut self, h: StreamHandle) -> Result<&mut SectionState> {
        self.queue_mut(h)?
            .section
            .as_mut()
            .ok_or_else(|| MuxError::InvalidState(format!("{} is not a section stream", h)))
    }

    pub(crate) fn submit_section(
        &mut self,
        h: StreamHandle,
        table: Bytes,
        repeat_interval_ms: u32,
    ) -> Result<()> {
        if table.is_empty() {
            return Err(MuxError::InvalidData("empty section".into()));
        }
        let state = self.section_state(h)?;
        state.table = Some(table);
        state.repeat_interval_ms = repeat_interval_ms;
        debug!("{} stored a new table, repeat {}ms", h, repeat_interval_ms);

        if self.queue(h)?.is_active() {
            self.schedule_section(h)?;
        }
        Ok(())
    }

    pub(crate) fn cancel_section(&mut self, h: StreamHandle) -> Result<()> {
        self.section_state(h)?.table = None;
        if !self.queue(h)?.is_active() {
            return Ok(());
        }
        self.discard_pending_section(h)?;
        let id = self.next_frame_id();
        let dts = self.next_slot();
        self.enqueue(h, Frame::new(id, dts, Vec::new()))?;
        info!("{} cancelled", h);
        self.request_wake();
        Ok(())
    }

    /// Replaces any unsent section frame with the stored table.
    pub(crate) fn schedule_section(&mut self, h: StreamHandle) -> Result<()> {
        let (table, repeat_ms) = match self.section_state(h)? {
            SectionState {
                table: Some(table),
                repeat_interval_ms,
            } => (table.clone(), *repeat_interval_ms),
            _ => return Ok(()),
        };
        self.discard_pending_section(h)?;

        let id = self.next_frame_id();
        let dts = self.next_slot();
        let mut frame = Frame::new(id, dts, vec![table]);
        frame.repeat_interval = ms_to_ticks(repeat_ms as u64);
        self.enqueue(h, frame)?;
        self.queue_mut(h)?.last_dts = Some(dts);
        self.request_wake();
        Ok(())
    }

    fn discard_pending_section(&mut self, h: StreamHandle) -> Result<()> {
        let (frames, bytes) = self.queue_mut(h)?.remove_pending(|_| true);
        self.total_buffers -= frames;
        self.memory_used -= bytes;
        Ok(())
    }

    fn next_slot(&self) -> u64 {
        self.last_pcr
            .map_or(0, |pcr| ring_add(pcr, self.config.pcr_period))
    }
}

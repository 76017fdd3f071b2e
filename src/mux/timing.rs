//! Per-frame timestamp discipline and the initial clock.

use log::{debug, info, warn};

use super::multiplexer::MuxInner;
use super::queue::{QueueState, StreamHandle};
use super::{MuxState, DISCONTINUITY_BUDGET};
use crate::error::Result;
use crate::format::ts::clock::{
    in_time_period, pcr_limit, ring_add, ring_sub, time_is_before, Timestamp, MAX_DTS,
};
use crate::format::ts::types::PTS_HZ;

impl MuxInner {
    /// Cross-checks a stream's first timestamp against its siblings.
    ///
    /// Two first timestamps agree when they lie within the larger of the two
    /// integrity thresholds of each other. A stream that disagrees with a
    /// sibling still passes when it starts within its own threshold of the
    /// clock, which is where a late joiner lands.
    pub(crate) fn first_dts_checks(&self, h: StreamHandle) -> Result<bool> {
        let queue = self.queue(h)?;
        if queue.is_section() || queue.config.ignore_first_dts_check {
            return Ok(true);
        }
        let Some(dts) = queue.first_dts else {
            return Ok(true);
        };
        let own_thr = queue.config.dts_integrity_threshold;

        let mismatch = self.queues.iter().flatten().find(|other| {
            if other.handle == h || other.is_section() || other.is_scattered() {
                return false;
            }
            let Some(other_first) = other.first_dts else {
                return false;
            };
            let thr = own_thr.max(other.config.dts_integrity_threshold);
            thr > 0 && !in_time_period(dts, ring_sub(other_first, thr), ring_add(other_first, thr))
        });
        let Some(other) = mismatch else {
            return Ok(true);
        };
        warn!(
            "{} first dts {} too far from {} first dts {:?}",
            h, dts, other.handle, other.first_dts
        );

        match self.last_pcr {
            Some(pcr) if !in_time_period(dts, ring_sub(pcr, own_thr), ring_add(pcr, own_thr)) => {
                warn!("{} first dts {} also too far from clock {}", h, dts, pcr);
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    /// Seeds the clock from the earliest first timestamp seen while starting.
    pub(crate) fn update_initial_pcr(&mut self, h: StreamHandle) -> Result<()> {
        if self.state != MuxState::Started {
            return Ok(());
        }
        let queue = self.queue(h)?;
        if queue.is_section()
            || !matches!(queue.state, QueueState::Running | QueueState::Flushing)
        {
            return Ok(());
        }
        let Some(first) = queue.first_dts else {
            return Ok(());
        };
        if !self.min_dts.update(first) {
            return Ok(());
        }
        let Some(min) = self.min_dts.value else {
            return Ok(());
        };

        let fill = self.time_to_fill();
        let pcr = pcr_limit(ring_sub(min, fill));
        self.shift_pcr = if min < fill || self.min_dts.prewrapped {
            MAX_DTS - pcr + 1
        } else {
            0
        };
        self.last_pcr = Some(pcr);
        info!(
            "initial clock {} from {} (fill {}, prewrapped {})",
            pcr, h, fill, self.min_dts.prewrapped
        );
        Ok(())
    }

    /// Ticks the decoders need to fill their buffers, at least one period.
    fn time_to_fill(&self) -> u64 {
        let bits: u64 = self
            .queues
            .iter()
            .flatten()
            .map(|q| q.config.decoder_buffer_bits)
            .sum();
        let fill = (bits as u128 * PTS_HZ as u128 / self.config.bitrate.max(1) as u128) as u64;
        fill.max(self.config.pcr_period)
    }

    /// Integrity and clock checks of one frame. Returns false to drop it.
    pub(crate) fn check_dts(&mut self, h: StreamHandle, dts: Timestamp, is_eos: bool) -> Result<bool> {
        let last_pcr = self.last_pcr;
        let queue = self.queue_mut(h)?;
        let thr = queue.config.dts_integrity_threshold;
        if thr == 0 || is_eos {
            return Ok(true);
        }
        let dont_wait = queue.config.dont_wait_limit;

        if queue.state != QueueState::Paused {
            let last = queue.last_dts.unwrap_or(dts);
            if !in_time_period(dts, last, ring_add(last, thr)) {
                queue.discontinuity_budget = queue.discontinuity_budget.saturating_sub(1);
                warn!(
                    "{} dts {} outside [{}, +{}), budget {}",
                    h, dts, last, thr, queue.discontinuity_budget
                );
                if queue.discontinuity_budget == 0 {
                    warn!("{} is fully discontinuous", h);
                    queue.full_discontinuity = true;
                    queue.discontinuity_budget = DISCONTINUITY_BUDGET;
                }
                return Ok(false);
            }
        }
        if !queue.full_discontinuity
            && queue.discontinuity_budget < DISCONTINUITY_BUDGET
            && queue.state != QueueState::Paused
        {
            queue.discontinuity_budget += 1;
        }

        let Some(pcr) = last_pcr else {
            return Ok(true);
        };
        if time_is_before(dts, pcr) {
            debug!("{} dts {} behind clock {}", h, dts, pcr);
            self.set_dont_pause_other(h, true)?;
            return Ok(false);
        }
        if time_is_before(ring_add(pcr, dont_wait), dts) {
            self.set_dont_pause_other(h, false)?;
        }
        Ok(true)
    }

    /// Shields (or unshields) the other running A/V streams of a different type.
    pub(crate) fn set_dont_pause_other(&mut self, h: StreamHandle, value: bool) -> Result<()> {
        let queue = self.queue(h)?;
        if !queue.is_av() {
            return Ok(());
        }
        let stream_type = queue.config.stream_type;
        for other in self.queues.iter_mut().flatten() {
            if other.handle == h
                || !other.is_av()
                || other.state != QueueState::Running
                || other.config.stream_type == stream_type
            {
                continue;
            }
            if !value && other.config.ignore_auto_pause {
                continue;
            }
            other.dont_pause_other = value;
        }
        Ok(())
    }
}

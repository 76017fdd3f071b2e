//! Readiness evaluation and the auto-pause policy.

use log::{debug, error, info, warn};

use super::frame::Frame;
use super::multiplexer::MuxInner;
use super::queue::{QueueState, StreamHandle};
use super::{MuxEvent, MuxState, MEMORY_PAUSE_PERCENT};
use crate::error::Result;
use crate::format::ts::clock::{in_time_period, ring_add};

impl MuxInner {
    /// True when a transform may run now.
    pub(crate) fn ready(&mut self) -> bool {
        if matches!(
            self.state,
            MuxState::Flushing | MuxState::Flushed | MuxState::Stopped
        ) {
            return true;
        }
        let Some(pcr) = self.last_pcr else {
            return false;
        };

        let mut candidates = self
            .queues
            .iter()
            .flatten()
            .filter(|q| q.is_active() && !q.is_section() && !q.is_scattered())
            .peekable();
        if candidates.peek().is_some() && candidates.all(|q| q.state == QueueState::Paused) {
            error!("every stream is paused, nothing to multiplex");
            return false;
        }

        let mut auto = false;
        if self.check_auto_pause() {
            self.run_auto_pause();
            auto = true;
        } else {
            self.pause_idle_scattered();
        }

        for h in self.handles() {
            if self.queue(h).is_ok_and(|q| q.manual_pause) {
                let _ = self.pause_queue(h);
                auto = true;
            }
        }

        let period = self.config.pcr_period;
        let ready = self
            .queues
            .iter()
            .flatten()
            .filter(|q| !q.is_section() && !q.is_scattered())
            .all(|q| match q.state {
                QueueState::Flushing | QueueState::Stopped => true,
                QueueState::Paused => auto || q.enough_data(Some(pcr), period),
                QueueState::Running => q.enough_data(Some(pcr), period),
                QueueState::Connected | QueueState::Started => false,
            });

        if ready && self.state == MuxState::Started {
            self.state = MuxState::Running;
            info!("multiplexer running at clock {}", pcr);
        }
        ready
    }

    /// True when some stream runs so far ahead, or memory is so tight, that
    /// waiting for the laggards would stall the output.
    pub(crate) fn check_auto_pause(&mut self) -> bool {
        let max_memory = self.max_memory();
        if max_memory > 0 && self.memory_used * 100 >= max_memory * MEMORY_PAUSE_PERCENT {
            warn!(
                "memory use {} of {} bytes, auto-pausing",
                self.memory_used, max_memory
            );
            return true;
        }

        // nothing submitted anywhere for the stream wait
        let stale = self.last_submit_at.elapsed() >= self.config.stream_wait_time;
        let started = self.state == MuxState::Started;
        let last_pcr = self.last_pcr;
        let mut fire = false;

        for queue in self.queues.iter_mut().flatten() {
            if stale && queue.dont_pause_other {
                debug!("{} went quiet, dropping its shield", queue.handle);
                queue.dont_pause_other = false;
            }
            if fire
                || queue.state != QueueState::Running
                || queue.is_section()
                || !queue.is_av()
                || queue.num_buffers == 0
                || queue.lags(last_pcr)
                || queue.dont_pause_other
            {
                continue;
            }
            let Some(last) = queue.last_dts else { continue };
            let dont_wait = queue.config.dont_wait_limit;

            if started {
                let Some(first) = queue.first_dts else { continue };
                if !in_time_period(last, first, ring_add(first, dont_wait)) || stale {
                    warn!("{} ran {} ahead of its start, auto-pausing", queue.handle, last);
                    fire = true;
                }
            } else if let Some(pcr) = last_pcr {
                if !in_time_period(last, pcr, ring_add(pcr, dont_wait)) {
                    warn!("{} ran ahead to {} at clock {}, auto-pausing", queue.handle, last, pcr);
                    fire = true;
                }
            }
        }
        fire
    }

    /// Pauses every stream holding up the output.
    pub(crate) fn run_auto_pause(&mut self) {
        for h in self.handles() {
            let pause = self.queue(h).is_ok_and(|q| {
                matches!(q.state, QueueState::Started | QueueState::Running) && self.do_pause(h)
            });
            if pause {
                let _ = self.pause_queue(h);
            }
        }
    }

    fn do_pause(&self, h: StreamHandle) -> bool {
        let Ok(queue) = self.queue(h) else {
            return false;
        };
        if queue.is_section() || queue.config.ignore_auto_pause {
            return false;
        }
        queue.first_dts.is_none()
            || queue.lags(self.last_pcr)
            || !queue.enough_data(self.last_pcr, self.config.pcr_period)
    }

    /// Pauses sparse streams that are not keeping up.
    fn pause_idle_scattered(&mut self) {
        let last_pcr = self.last_pcr;
        let idle: Vec<StreamHandle> = self
            .queues
            .iter()
            .flatten()
            .filter(|q| {
                q.is_scattered()
                    && matches!(q.state, QueueState::Started | QueueState::Running)
                    && !q.config.ignore_auto_pause
                    && (q.first_dts.is_none() || q.lags(last_pcr) || q.num_buffers == 0)
            })
            .map(|q| q.handle)
            .collect();
        for h in idle {
            let _ = self.pause_queue(h);
        }
    }

    /// Moves a stream to Paused and tells the engine through a pause marker.
    pub(crate) fn pause_queue(&mut self, h: StreamHandle) -> Result<()> {
        let queue = self.queue(h)?;
        if !matches!(queue.state, QueueState::Started | QueueState::Running) {
            return Ok(());
        }
        let needs_marker = !queue.is_full();
        if needs_marker {
            let id = self.next_frame_id();
            self.enqueue(h, Frame::pause_marker(id))?;
        }
        let queue = self.queue_mut(h)?;
        queue.state = QueueState::Paused;
        queue.pauses += 1;
        debug!("{} paused (marker {})", h, needs_marker);
        self.request_wake();
        self.emit(MuxEvent::StreamPaused(h));
        Ok(())
    }
}

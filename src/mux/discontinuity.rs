//! Full-discontinuity escalation and the session restart.

use log::{error, info, warn};

use super::engine::global_flags;
use super::multiplexer::MuxInner;
use super::queue::{QueueState, StreamHandle};
use super::{MuxEvent, DISCONTINUITY_BUDGET};
use crate::config::StopMode;
use crate::error::Result;
use crate::format::ts::clock::{in_time_period, ring_add, time_is_before, Timestamp};

impl MuxInner {
    /// Decides whether a failing frame should restart the session.
    pub(crate) fn check_restart(
        &mut self,
        h: StreamHandle,
        dts: Timestamp,
        failed: bool,
    ) -> Result<bool> {
        let mut av = self.queues.iter().flatten().filter(|q| q.is_av()).peekable();
        if av.peek().is_some() && av.all(|q| q.full_discontinuity) {
            warn!("every audio/video stream is discontinuous");
            return Ok(true);
        }

        let queue = self.queue_mut(h)?;
        if !queue.full_discontinuity || !failed {
            return Ok(false);
        }
        let thr = queue.config.dts_integrity_threshold;
        let Some(ftd) = queue.ftd_first_dts else {
            // the first frame of the new timeline only anchors it
            info!("{} new timeline starts at {}", h, dts);
            queue.ftd_first_dts = Some(dts);
            return Ok(false);
        };
        if !in_time_period(dts, ftd, ring_add(ftd, thr)) {
            queue.ftd_first_dts = Some(dts);
            return Ok(false);
        }

        if self.others_settled(h) {
            info!("{} discontinuous and the other streams settled", h);
            return Ok(true);
        }
        self.check_ftd_wait(h, dts)
    }

    /// Every other A/V stream is either discontinuous itself or idle with a full budget.
    fn others_settled(&self, h: StreamHandle) -> bool {
        self.queues
            .iter()
            .flatten()
            .filter(|q| q.is_av() && q.handle != h)
            .all(|q| {
                q.full_discontinuity
                    || (matches!(q.state, QueueState::Stopped | QueueState::Paused)
                        && q.discontinuity_budget == DISCONTINUITY_BUDGET)
            })
    }

    /// A lone discontinuous stream restarts the session once its new timeline
    /// has lasted longer than the configured wait.
    fn check_ftd_wait(&mut self, h: StreamHandle, dts: Timestamp) -> Result<bool> {
        let wait = self.config.full_discontinuity_wait;
        let queue = self.queue_mut(h)?;
        let Some(ftd) = queue.ftd_first_dts else {
            return Ok(false);
        };
        if time_is_before(dts, ftd) {
            queue.ftd_first_dts = Some(dts);
            return Ok(false);
        }
        let in_wait = in_time_period(dts, ftd, ring_add(ftd, wait));
        if queue.full_discontinuity && queue.is_av() && !in_wait {
            warn!("{} stayed discontinuous past {} ticks", h, wait);
            return Ok(true);
        }
        Ok(false)
    }

    /// Drops everything and restarts the session with discontinuity signalling.
    ///
    /// Streams that had ended are left stopped. When every A/V stream had
    /// ended the session stays stopped.
    pub(crate) fn restart(&mut self) {
        info!("restarting multiplexer");
        self.restarting = true;
        self.restart_complete = false;

        let ended: Vec<StreamHandle> = self
            .queues
            .iter()
            .flatten()
            .filter(|q| q.is_av() && q.eos_detected)
            .map(|q| q.handle)
            .collect();
        for h in self.handles() {
            let _ = self.drop_frames(h);
            if let Ok(queue) = self.queue_mut(h) {
                queue.reset_timing();
            }
        }

        let mut success = false;
        match self.stop(StopMode::Forced) {
            Err(e) => error!("restart could not stop: {}", e),
            Ok(()) if !ended.is_empty() => {
                info!("{} ended streams, staying stopped", ended.len());
            }
            Ok(()) => {
                self.global_flags = global_flags::PCR_DISCONTINUITY | global_flags::TABLE_DISCONTINUITY;
                let started = self.start();
                self.global_flags = 0;
                match started {
                    Ok(()) => {
                        self.restart_complete = true;
                        success = true;
                    }
                    Err(e) => error!("restart could not start: {}", e),
                }
            }
        }

        for h in ended {
            if let Ok(queue) = self.queue_mut(h) {
                queue.state = QueueState::Stopped;
                queue.eos_detected = false;
            }
        }

        self.restarting = false;
        self.restarts += 1;
        self.request_wake();
        self.emit(MuxEvent::Restarted { success });
    }
}

use bytes::Bytes;
use futures::Stream;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::control::Control;
use super::engine::{
    EngineIndexRecord, StreamBatch, TransformEngine, TransformOutcome, TransformParams,
    TransformRequest,
};
use super::frame::{index_flags, Frame, FrameId, FrameMetadata, PictureType};
use super::index::{IndexRecord, IndexSink};
use super::queue::{QueueState, SinkLink, StreamHandle, StreamKind, StreamQueue, StreamStatus};
use super::{
    MuxEvent, MuxState, MuxStatus, BUFFER_RESERVE, MAX_BUFFERS_PER_STREAM, MAX_SINKS_PER_STREAM,
    MAX_STREAMS,
};
use crate::config::{IndexSinkConfig, MuxConfig, SectionConfig, StopMode, StreamConfig};
use crate::error::{MuxError, Result};
use crate::format::ts::clock::{ring_add, RingMinimum, Timestamp};
use crate::format::ts::pes::{PESHeader, PesTiming};
use crate::format::ts::types::*;

/// Identifies an index sink attached to a multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexSinkHandle(pub(crate) usize);

/// State guarded by the session lock.
pub(crate) struct MuxInner {
    pub config: MuxConfig,
    pub state: MuxState,
    pub engine: Box<dyn TransformEngine>,
    engine_open: bool,
    pub queues: Vec<Option<StreamQueue>>,
    next_sink_id: usize,

    pub last_pcr: Option<Timestamp>,
    pub min_dts: RingMinimum,
    pub shift_pcr: u64,

    pub memory_used: usize,
    pub total_buffers: usize,

    pub restarting: bool,
    pub restart_complete: bool,
    pub global_flags: u32,
    pub disconnected: bool,
    /// Wall time of the last accepted frame on any stream.
    pub last_submit_at: Instant,

    next_frame_id: u64,
    wake_requested: bool,
    events: broadcast::Sender<MuxEvent>,

    pub transforms: u64,
    pub packets: u64,
    pub restarts: u64,
}

impl MuxInner {
    pub fn queue(&self, h: StreamHandle) -> Result<&StreamQueue> {
        self.queues
            .get(h.0)
            .and_then(Option::as_ref)
            .ok_or(MuxError::InvalidHandle)
    }

    pub fn queue_mut(&mut self, h: StreamHandle) -> Result<&mut StreamQueue> {
        self.queues
            .get_mut(h.0)
            .and_then(Option::as_mut)
            .ok_or(MuxError::InvalidHandle)
    }

    pub fn handles(&self) -> Vec<StreamHandle> {
        self.queues.iter().flatten().map(|q| q.handle).collect()
    }

    pub fn next_frame_id(&mut self) -> FrameId {
        self.next_frame_id += 1;
        FrameId(self.next_frame_id)
    }

    pub fn request_wake(&mut self) {
        self.wake_requested = true;
    }

    pub fn emit(&self, event: MuxEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    pub fn max_memory(&self) -> usize {
        self.config.max_memory()
    }

    /// Appends a frame to a queue and charges the session budgets.
    pub fn enqueue(&mut self, h: StreamHandle, frame: Frame) -> Result<()> {
        let is_pause = frame.is_pause;
        let queue = self.queue_mut(h)?;
        let len = queue.push(frame);
        if !is_pause {
            self.total_buffers += 1;
            self.memory_used += len;
        }
        Ok(())
    }

    /// Drops a completed in-flight frame. A second completion of the same id fails.
    pub fn retire(&mut self, id: FrameId) -> Result<()> {
        for queue in self.queues.iter_mut().flatten() {
            if let Some(frame) = queue.retire(id) {
                if !frame.is_pause {
                    self.total_buffers -= 1;
                    self.memory_used -= frame.length();
                }
                return Ok(());
            }
        }
        Err(MuxError::CompletionRejected(id))
    }

    /// Drops every frame of one queue and releases its budget.
    pub fn drop_frames(&mut self, h: StreamHandle) -> Result<()> {
        let (frames, bytes) = self.queue_mut(h)?.clear();
        self.total_buffers -= frames;
        self.memory_used -= bytes;
        Ok(())
    }

    fn drop_all_frames(&mut self) {
        for h in self.handles() {
            let _ = self.drop_frames(h);
        }
    }

    fn output_size(&self) -> usize {
        TransformParams::from_config(&self.config, 0).output_size()
    }

    fn attach(&mut self, mut queue: StreamQueue) -> Result<StreamHandle> {
        if !matches!(self.state, MuxState::New | MuxState::Stopped) {
            return Err(MuxError::InvalidState(format!(
                "cannot attach streams while {}",
                self.state
            )));
        }
        if self.queues.iter().flatten().count() >= MAX_STREAMS {
            return Err(MuxError::ResourceExhausted(format!(
                "at most {} streams per multiplexer",
                MAX_STREAMS
            )));
        }
        if self.queues.iter().flatten().any(|q| q.pid == queue.pid) {
            return Err(MuxError::Config(format!("PID {:#x} already in use", queue.pid)));
        }
        let h = StreamHandle(self.queues.len());
        queue.handle = h;
        info!("attached {} ({:?}, pid {:#x})", h, queue.kind, queue.pid);
        self.queues.push(Some(queue));
        Ok(h)
    }

    fn default_stream_id(&self, kind: StreamKind) -> u8 {
        let siblings = self.queues.iter().flatten().filter(|q| q.kind == kind).count() as u8;
        match kind {
            StreamKind::Video => STREAM_ID_VIDEO.wrapping_add(siblings & 0x0f),
            StreamKind::Audio => STREAM_ID_AUDIO.wrapping_add(siblings & 0x1f),
            StreamKind::Scattered => STREAM_ID_PRIVATE_1,
            _ => STREAM_ID_METADATA,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if !matches!(self.state, MuxState::New | MuxState::Stopped) {
            return Err(MuxError::InvalidState(format!(
                "cannot start while {}",
                self.state
            )));
        }

        let params = TransformParams::from_config(&self.config, self.global_flags);
        self.engine.open(&params)?;

        let handles = self.handles();
        let mut added = Vec::with_capacity(handles.len());
        for &h in &handles {
            let queue = self.queue(h)?;
            if !matches!(queue.state, QueueState::Connected | QueueState::Stopped) {
                continue;
            }
            let descriptor = queue.descriptor();
            if let Err(e) = self.engine.add_stream(&descriptor) {
                error!("failed to add {} to the engine: {}", h, e);
                for &(added_h, prev) in &added {
                    let _ = self.engine.remove_stream(added_h);
                    if let Ok(q) = self.queue_mut(added_h) {
                        q.state = prev;
                    }
                }
                self.engine.close();
                return Err(e.into());
            }
            let queue = self.queue_mut(h)?;
            added.push((h, queue.state));
            queue.state = if queue.is_section() {
                QueueState::Running
            } else {
                QueueState::Started
            };
        }

        self.engine_open = true;
        self.state = MuxState::Started;
        info!(
            "multiplexer started with {} streams (flags {:#x})",
            added.len(),
            self.global_flags
        );

        for h in handles {
            if self.queue(h)?.is_section() {
                if let Err(e) = self.schedule_section(h) {
                    warn!("could not schedule section on {}: {}", h, e);
                }
            }
        }
        Ok(())
    }

    pub fn stop(&mut self, mode: StopMode) -> Result<()> {
        if self.state == MuxState::Stopped {
            return Ok(());
        }
        if mode == StopMode::Complete && self.state == MuxState::Flushing && !self.restarting {
            return Err(MuxError::Busy("flush in progress".into()));
        }

        for h in self.handles() {
            let was_active = self.queue(h)?.is_active();
            if was_active && self.engine_open {
                if let Err(e) = self.engine.remove_stream(h) {
                    warn!("engine refused to remove {}: {}", h, e);
                }
            }
            let queue = self.queue_mut(h)?;
            queue.state = QueueState::Stopped;
            queue.reset_timing();
            queue.eos_detected = false;
        }
        if self.engine_open {
            self.engine.close();
            self.engine_open = false;
        }
        self.drop_all_frames();

        self.state = MuxState::Stopped;
        self.last_pcr = None;
        self.min_dts.reset();
        self.shift_pcr = 0;
        if !self.restarting {
            self.request_wake();
        }
        info!("multiplexer stopped");
        Ok(())
    }

    /// Accepts one frame on a stream.
    pub fn submit(
        &mut self,
        h: StreamHandle,
        meta: FrameMetadata,
        blocks: Vec<Bytes>,
    ) -> Result<()> {
        let pcr_period = self.config.pcr_period;
        let max_total = self.config.max_buffers - BUFFER_RESERVE;
        let mux_state = self.state;
        let total_buffers = self.total_buffers;
        let last_pcr = self.last_pcr;
        let restart_complete = self.restart_complete;

        let queue = self.queue_mut(h)?;
        if queue.is_section() {
            return Err(MuxError::InvalidState(format!(
                "{} carries a section, use submit_section",
                h
            )));
        }
        if !matches!(
            queue.state,
            QueueState::Started | QueueState::Running | QueueState::Paused
        ) {
            return Err(MuxError::InvalidState(format!(
                "{} cannot accept frames while {:?}",
                h, queue.state
            )));
        }
        if matches!(mux_state, MuxState::Flushing | MuxState::Flushed) {
            return Err(MuxError::InvalidState(format!(
                "multiplexer is {}",
                mux_state
            )));
        }
        if total_buffers >= max_total {
            queue.frames_rejected += 1;
            return Err(MuxError::Backpressure(format!(
                "{} of {} frame slots in use",
                total_buffers, max_total
            )));
        }
        if queue.is_full() {
            queue.frames_rejected += 1;
            return Err(MuxError::Backpressure(format!(
                "{} holds {} frames",
                h, MAX_BUFFERS_PER_STREAM
            )));
        }
        if queue.manual_pause {
            queue.frames_rejected += 1;
            return Err(MuxError::Backpressure(format!("{} is paused", h)));
        }

        let discontinuity =
            restart_complete && (last_pcr.is_none() || queue.first_dts.is_none());
        let is_first = queue.first_dts.is_none();
        let dts = resolve_dts(queue, &meta, &blocks, pcr_period);
        let flags = frame_index_flags(queue, &meta, is_first) & queue.index_mask();

        let mut blocks = blocks;
        if meta.is_eos && queue.is_av() {
            blocks.clear();
            queue.state = QueueState::Flushing;
            queue.eos_detected = true;
            info!("{} reached end of stream", h);
            self.emit(MuxEvent::EndOfStream(h));
            self.check_all_flushing();
        }

        let mut first_dts_paused = false;
        if is_first {
            let queue = self.queue_mut(h)?;
            queue.first_dts = Some(dts);
            queue.last_dts = Some(dts);
            if !self.first_dts_checks(h)? {
                self.pause_queue(h)?;
                first_dts_paused = true;
            }
            let queue = self.queue_mut(h)?;
            if queue.state == QueueState::Started {
                queue.state = QueueState::Running;
            }
            if self.state == MuxState::Started {
                self.update_initial_pcr(h)?;
            }
        }

        let ok = self.check_dts(h, dts, meta.is_eos)?;
        let any_eos = self
            .queues
            .iter()
            .flatten()
            .any(|q| q.is_av() && q.eos_detected);
        let restart = !any_eos && self.check_restart(h, dts, !ok)?;
        if !ok || restart {
            self.queue_mut(h)?.frames_rejected += 1;
            if restart {
                self.restart();
            }
            return Err(MuxError::TimestampIntegrity { restarted: restart });
        }

        let queue = self.queue_mut(h)?;
        if queue.state == QueueState::Paused && !first_dts_paused {
            debug!("{} resumed by new data", h);
            queue.state = QueueState::Running;
        }
        if queue.full_discontinuity && !meta.is_eos {
            queue.frames_rejected += 1;
            return Err(MuxError::TimestampIntegrity { restarted: false });
        }

        let pes_header = if queue.config.stream_is_pes || meta.is_eos {
            None
        } else {
            let payload_len = blocks.iter().map(Bytes::len).sum();
            Some(
                PESHeader::new(queue.stream_id)
                    .with_pts(dts)
                    .with_payload_len(payload_len)
                    .to_bytes()?,
            )
        };

        let id = self.next_frame_id();
        let mut frame = Frame::new(id, dts, blocks);
        frame.native_dts = meta.native_time.unwrap_or(dts);
        frame.is_eos = meta.is_eos;
        frame.discontinuity = discontinuity;
        frame.random_access = meta.random_access;
        frame.index_flags = flags;
        frame.pes_header = pes_header;
        self.enqueue(h, frame)?;

        let queue = self.queue_mut(h)?;
        queue.last_dts = Some(dts);
        queue.frames_accepted += 1;
        let notify = queue.state == QueueState::Flushing
            || meta.is_eos
            || queue.enough_data(last_pcr, pcr_period);
        self.last_submit_at = Instant::now();

        if notify && self.ready() {
            self.emit(MuxEvent::DataAvailable(h));
        }
        self.request_wake();
        Ok(())
    }

    fn check_all_flushing(&mut self) {
        let mut av = self.queues.iter().flatten().filter(|q| q.is_av()).peekable();
        if av.peek().is_none() {
            return;
        }
        if av.all(|q| q.state == QueueState::Flushing) {
            info!("all audio/video streams ended, flushing");
            self.state = MuxState::Flushing;
            self.request_wake();
        }
    }

    /// Runs the engine for one period. The caller has checked readiness.
    pub fn transform(&mut self, out: &mut [&mut [u8]]) -> Result<usize> {
        let flush = self.state == MuxState::Flushing;
        let pcr = self.last_pcr.unwrap_or(0);
        for queue in self.queues.iter_mut().flatten() {
            queue.hand_off();
        }

        let status = {
            let streams = self
                .queues
                .iter()
                .flatten()
                .filter(|q| q.is_active())
                .map(|q| StreamBatch {
                    handle: q.handle,
                    paused: q.state == QueueState::Paused,
                    frames: &q.in_flight,
                })
                .collect();
            let request = TransformRequest {
                pcr,
                flush,
                streams,
            };
            self.engine.run(&request, out)
        };
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                error!("transform failed: {}", e);
                return Err(e.into());
            }
        };

        for id in &status.completed {
            if let Err(e) = self.retire(*id) {
                warn!("engine reported {}", e);
            }
        }

        if matches!(
            status.outcome,
            TransformOutcome::Ok | TransformOutcome::DtsViolation
        ) {
            self.last_pcr = Some(ring_add(status.pcr, self.config.pcr_period));
        }
        self.publish_index(&status.index);
        self.transforms += 1;
        self.packets += status.packets as u64;
        debug!(
            "transform {}: {} bytes, pcr {} -> {:?}, {} completed",
            self.transforms,
            status.bytes,
            status.pcr,
            self.last_pcr,
            status.completed.len()
        );

        if flush && !status.unconsumed {
            info!("flush complete");
            self.state = MuxState::Flushed;
            self.drop_all_frames();
            self.emit(MuxEvent::Flushed);
        }
        self.request_wake();
        Ok(status.bytes)
    }

    /// Expands engine index events into one record per tag and routes them to sinks.
    fn publish_index(&self, events: &[EngineIndexRecord]) {
        for event in events {
            match event.stream {
                Some(h) => {
                    let Ok(queue) = self.queue(h) else {
                        continue;
                    };
                    if queue.sinks.is_empty() {
                        continue;
                    }
                    let records = expand_flags(event.flags & !index_flags::TABLES)
                        .map(|flag| IndexRecord {
                            flag,
                            pid: if flag == index_flags::DIT { PID_DIT } else { queue.pid },
                            pts: if flag == index_flags::PTS { event.pts } else { 0 },
                            native_pts: if flag == index_flags::PTS {
                                event.native_pts
                            } else {
                                0
                            },
                            stream_id: queue.stream_id,
                            stream_type: queue.config.stream_type,
                            packet_offset: event.packet_offset,
                        })
                        .collect::<Vec<_>>();
                    for link in &queue.sinks {
                        link.sink.push(&records);
                    }
                }
                None => {
                    let records = expand_flags(event.flags & index_flags::TABLES)
                        .map(|flag| IndexRecord {
                            flag,
                            pid: match flag {
                                index_flags::PMT => self.config.pmt_pid,
                                index_flags::SDT => PID_SDT,
                                _ => PID_PAT,
                            },
                            packet_offset: event.packet_offset,
                            ..Default::default()
                        })
                        .collect::<Vec<_>>();
                    for link in self.queues.iter().flatten().flat_map(|q| q.sinks.iter()) {
                        link.sink.push(&records);
                    }
                }
            }
        }
    }

    fn status(&self) -> MuxStatus {
        MuxStatus {
            state: self.state,
            last_pcr: self.last_pcr,
            min_dts: self.min_dts.value,
            shift_pcr: self.shift_pcr,
            memory_used: self.memory_used,
            max_memory: self.max_memory(),
            total_buffers: self.total_buffers,
            max_buffers: self.config.max_buffers,
            transforms: self.transforms,
            packets: self.packets,
            restarts: self.restarts,
        }
    }

    fn find_sink(&self, sink: IndexSinkHandle) -> Result<(StreamHandle, Arc<IndexSink>)> {
        self.queues
            .iter()
            .flatten()
            .find_map(|q| {
                q.sinks
                    .iter()
                    .find(|link| link.id == sink.0)
                    .map(|link| (q.handle, Arc::clone(&link.sink)))
            })
            .ok_or(MuxError::InvalidHandle)
    }
}

fn expand_flags(flags: u32) -> impl Iterator<Item = u32> {
    (0..32).map(|bit| 1u32 << bit).filter(move |flag| flags & flag != 0)
}

/// Decode time of a frame about to be accepted.
fn resolve_dts(
    queue: &mut StreamQueue,
    meta: &FrameMetadata,
    blocks: &[Bytes],
    pcr_period: u64,
) -> Timestamp {
    let last = queue.last_dts.unwrap_or(0);
    if meta.is_eos {
        return ring_add(last, pcr_period);
    }
    if queue.config.stream_is_pes {
        let Some(first) = blocks.first().filter(|b| !b.is_empty()) else {
            return last;
        };
        return match PesTiming::parse(first) {
            Ok(timing) => {
                queue.stream_id = timing.stream_id;
                timing.decode_time().unwrap_or(last)
            }
            Err(e) => {
                warn!("{}: {}, reusing last dts", queue.handle, e);
                last
            }
        };
    }
    meta.dts.unwrap_or(last)
}

fn frame_index_flags(queue: &StreamQueue, meta: &FrameMetadata, is_first: bool) -> u32 {
    let mut flags = index_flags::PUSI;
    if !meta.is_eos {
        flags |= index_flags::PTS;
    }
    if is_first {
        flags |= index_flags::STREAM_ID | index_flags::STREAM_TYPE;
    }
    if meta.dit_transition {
        flags |= index_flags::DIT;
    }
    if meta.random_access && queue.config.include_rap {
        flags |= index_flags::RAP;
    }
    flags |= match meta.picture_type {
        Some(PictureType::I) => index_flags::I_FRAME,
        Some(PictureType::P) => index_flags::P_FRAME,
        Some(PictureType::B) => index_flags::B_FRAME,
        None => 0,
    };
    flags
}

/// A multiplexing session.
///
/// All methods take `&self`; the multiplexer is meant to be shared between
/// producer threads and a consumer behind an [`Arc`].
pub struct Multiplexer {
    inner: Mutex<MuxInner>,
    wake: Condvar,
    events: broadcast::Sender<MuxEvent>,
}

impl Multiplexer {
    /// Creates a session in the `New` state.
    pub fn new(config: MuxConfig, engine: Box<dyn TransformEngine>) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(64);
        let inner = MuxInner {
            config,
            state: MuxState::New,
            engine,
            engine_open: false,
            queues: Vec::new(),
            next_sink_id: 0,
            last_pcr: None,
            min_dts: RingMinimum::default(),
            shift_pcr: 0,
            memory_used: 0,
            total_buffers: 0,
            restarting: false,
            restart_complete: false,
            global_flags: 0,
            disconnected: false,
            last_submit_at: Instant::now(),
            next_frame_id: 0,
            wake_requested: false,
            events: events.clone(),
            transforms: 0,
            packets: 0,
            restarts: 0,
        };
        Ok(Self {
            inner: Mutex::new(inner),
            wake: Condvar::new(),
            events,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, MuxInner>> {
        let inner = self.inner.lock();
        if inner.disconnected {
            return Err(MuxError::Disconnected);
        }
        Ok(inner)
    }

    fn flush_wakeups(&self, inner: &mut MuxInner) {
        if std::mem::take(&mut inner.wake_requested) {
            self.wake.notify_all();
        }
    }

    /// Runs `f` under the lock and wakes waiters if it asked for it.
    fn with_inner<T>(&self, f: impl FnOnce(&mut MuxInner) -> Result<T>) -> Result<T> {
        let mut inner = self.lock()?;
        let result = f(&mut inner);
        self.flush_wakeups(&mut inner);
        result
    }

    pub fn state(&self) -> MuxState {
        self.inner.lock().state
    }

    pub fn status(&self) -> MuxStatus {
        self.inner.lock().status()
    }

    pub fn stream_status(&self, h: StreamHandle) -> Result<StreamStatus> {
        Ok(self.lock()?.queue(h)?.status())
    }

    /// Receives session notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MuxEvent> {
        self.events.subscribe()
    }

    /// Bytes one [`pull`](Self::pull) needs room for.
    pub fn output_buffer_size(&self) -> usize {
        self.inner.lock().output_size()
    }

    pub fn pull_timeout(&self) -> Duration {
        self.inner.lock().config.pull_timeout
    }

    /// Attaches an elementary stream. Only valid before start or after stop.
    pub fn attach_stream(&self, config: StreamConfig) -> Result<StreamHandle> {
        self.with_inner(|inner| {
            let kind = if config.scattered {
                StreamKind::Scattered
            } else {
                StreamKind::from_stream_type(config.stream_type)
            };
            let stream_id = config
                .stream_id
                .unwrap_or_else(|| inner.default_stream_id(kind));
            let pid = match config.pid {
                Some(pid) if pid > PID_MAX => {
                    return Err(MuxError::Config(format!("PID {:#x} out of range", pid)))
                }
                Some(pid) => pid,
                None => PID_ES_BASE + inner.queues.len() as u16,
            };
            let queue = StreamQueue::new(StreamHandle(0), config, pid, stream_id);
            inner.attach(queue)
        })
    }

    /// Attaches a section stream carrying one repeating or one-shot table.
    pub fn attach_section_stream(&self, config: SectionConfig) -> Result<StreamHandle> {
        if config.pid > PID_MAX {
            return Err(MuxError::Config(format!("PID {:#x} out of range", config.pid)));
        }
        self.with_inner(|inner| inner.attach(StreamQueue::new_section(StreamHandle(0), &config)))
    }

    /// Removes a stream that is not registered with a running session.
    pub fn detach_stream(&self, h: StreamHandle) -> Result<()> {
        self.with_inner(|inner| {
            let queue = inner.queue(h)?;
            if queue.is_active() {
                return Err(MuxError::Busy(format!("{} is {:?}", h, queue.state)));
            }
            inner.drop_frames(h)?;
            if let Some(queue) = inner.queues[h.0].take() {
                for link in &queue.sinks {
                    link.sink.close();
                }
            }
            info!("detached {}", h);
            inner.request_wake();
            Ok(())
        })
    }

    pub fn start(&self) -> Result<()> {
        self.with_inner(|inner| inner.start())
    }

    /// Stops the session. Stopping a stopped session succeeds without effect.
    pub fn stop(&self) -> Result<()> {
        self.with_inner(|inner| {
            let mode = inner.config.stop_mode;
            inner.stop(mode)
        })
    }

    /// Accepts a frame. Never blocks.
    ///
    /// Section streams are fed through [`submit_section`](Self::submit_section).
    pub fn submit(
        &self,
        h: StreamHandle,
        metadata: FrameMetadata,
        payload: Vec<Bytes>,
    ) -> Result<()> {
        self.with_inner(|inner| {
            let result = inner.submit(h, metadata, payload);
            if let Err(e) = &result {
                debug!("{} rejected frame: {}", h, e);
            }
            result
        })
    }

    /// Replaces the table carried by a section stream.
    pub fn submit_section(
        &self,
        h: StreamHandle,
        table: Bytes,
        repeat_interval_ms: u32,
    ) -> Result<()> {
        self.with_inner(|inner| inner.submit_section(h, table, repeat_interval_ms))
    }

    /// Stops a section stream from emitting its table.
    pub fn cancel_section(&self, h: StreamHandle) -> Result<()> {
        self.with_inner(|inner| inner.cancel_section(h))
    }

    /// Pauses a stream until [`resume_stream`](Self::resume_stream). Overrides auto-pause.
    pub fn pause_stream(&self, h: StreamHandle) -> Result<()> {
        self.with_inner(|inner| {
            let queue = inner.queue_mut(h)?;
            if queue.is_section() {
                return Err(MuxError::InvalidState("sections cannot be paused".into()));
            }
            queue.manual_pause = true;
            if matches!(queue.state, QueueState::Started | QueueState::Running) {
                inner.pause_queue(h)?;
            }
            info!("{} paused by request", h);
            Ok(())
        })
    }

    /// Lifts a manual pause; the stream runs again with its next frame.
    pub fn resume_stream(&self, h: StreamHandle) -> Result<()> {
        self.with_inner(|inner| {
            inner.queue_mut(h)?.manual_pause = false;
            inner.request_wake();
            Ok(())
        })
    }

    /// Waits up to `timeout` for a ready period and transforms it into `out`.
    ///
    /// Returns the bytes written, 0 once the session is flushed.
    /// [`MuxError::Timeout`] means nothing was ready yet and the call can be
    /// retried.
    pub fn pull(&self, out: &mut [&mut [u8]], timeout: Duration) -> Result<usize> {
        let mut inner = self.lock()?;
        match inner.state {
            MuxState::Stopped => return Err(MuxError::Stopped),
            MuxState::New => {
                return Err(MuxError::InvalidState("multiplexer not started".into()))
            }
            MuxState::Flushed => return Ok(0),
            _ => {}
        }

        let needed = inner.output_size();
        let available: usize = out.iter().map(|b| b.len()).sum();
        if available < needed {
            return Err(MuxError::InvalidState(format!(
                "output buffer holds {} bytes, {} needed",
                available, needed
            )));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if inner.disconnected {
                return Err(MuxError::Disconnected);
            }
            let ready = inner.ready();
            self.flush_wakeups(&mut inner);
            if ready {
                break;
            }
            if self.wake.wait_until(&mut inner, deadline).timed_out() {
                if inner.disconnected {
                    return Err(MuxError::Disconnected);
                }
                if !inner.ready() {
                    self.flush_wakeups(&mut inner);
                    return Err(MuxError::Timeout);
                }
                break;
            }
        }

        match inner.state {
            MuxState::Stopped => return Err(MuxError::Stopped),
            MuxState::Flushed => return Ok(0),
            _ => {}
        }
        let result = inner.transform(out);
        self.flush_wakeups(&mut inner);
        result
    }

    /// [`pull`](Self::pull) into a freshly allocated buffer.
    pub fn pull_bytes(&self, timeout: Duration) -> Result<Bytes> {
        let mut buf = vec![0u8; self.output_buffer_size()];
        let n = self.pull(&mut [buf.as_mut_slice()], timeout)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Reports whether a pull would proceed without waiting.
    pub fn test_for_data(&self) -> Result<bool> {
        self.with_inner(|inner| match inner.state {
            MuxState::Stopped => Err(MuxError::Stopped),
            MuxState::New => Err(MuxError::InvalidState("multiplexer not started".into())),
            _ => Ok(inner.ready()),
        })
    }

    /// Retires an in-flight frame completed out of band.
    pub fn complete(&self, id: FrameId) -> Result<()> {
        self.with_inner(|inner| {
            inner.retire(id)?;
            inner.request_wake();
            Ok(())
        })
    }

    pub fn control_get(&self, control: Control) -> Result<u64> {
        self.lock()?.control_get(control)
    }

    pub fn control_set(&self, control: Control, value: u64) -> Result<()> {
        self.with_inner(|inner| inner.control_set(control, value))
    }

    /// Links a new index sink to a stream.
    pub fn attach_index_sink(
        &self,
        h: StreamHandle,
        config: IndexSinkConfig,
    ) -> Result<IndexSinkHandle> {
        let sink = Arc::new(IndexSink::new(&config)?);
        self.with_inner(|inner| {
            let id = inner.next_sink_id;
            let queue = inner.queue_mut(h)?;
            if queue.sinks.len() >= MAX_SINKS_PER_STREAM {
                return Err(MuxError::ResourceExhausted(format!(
                    "{} already feeds {} index sinks",
                    h, MAX_SINKS_PER_STREAM
                )));
            }
            queue.sinks.push(SinkLink { id, sink });
            inner.next_sink_id += 1;
            Ok(IndexSinkHandle(id))
        })
    }

    /// Unlinks a sink and wakes its blocked readers with `Disconnected`.
    pub fn detach_index_sink(&self, sink: IndexSinkHandle) -> Result<()> {
        self.with_inner(|inner| {
            let (h, found) = inner.find_sink(sink)?;
            inner.queue_mut(h)?.sinks.retain(|link| link.id != sink.0);
            found.close();
            Ok(())
        })
    }

    /// Shared handle to a sink, for readers that must not hold the session lock.
    pub fn index_sink(&self, sink: IndexSinkHandle) -> Result<Arc<IndexSink>> {
        Ok(self.lock()?.find_sink(sink)?.1)
    }

    /// Reads whole records into `buf`, returning how many were copied.
    ///
    /// Blocks or not according to the sink's read mode. The session lock is
    /// not held while waiting.
    pub fn index_read(&self, sink: IndexSinkHandle, buf: &mut [u8]) -> Result<usize> {
        let sink = self.index_sink(sink)?;
        Ok(sink.read_bytes(buf)? / super::INDEX_RECORD_SIZE)
    }

    /// Stops the session and fails every current and future call with `Disconnected`.
    pub(crate) fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.disconnected {
            return;
        }
        if let Err(e) = inner.stop(StopMode::Forced) {
            error!("stop during shutdown failed: {}", e);
        }
        for queue in inner.queues.iter().flatten() {
            for link in &queue.sinks {
                link.sink.close();
            }
        }
        inner.disconnected = true;
        inner.request_wake();
        self.flush_wakeups(&mut inner);
    }

    /// Pulls on the blocking pool.
    pub async fn pull_async(self: &Arc<Self>, timeout: Duration) -> Result<Bytes> {
        let mux = Arc::clone(self);
        tokio::task::spawn_blocking(move || mux.pull_bytes(timeout))
            .await
            .map_err(|e| MuxError::InvalidState(format!("pull task failed: {}", e)))?
    }

    /// Output periods as a stream, ending when the session is flushed or stopped.
    ///
    /// Timeouts are retried internally.
    pub fn output_stream(self: Arc<Self>) -> impl Stream<Item = Result<Bytes>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mux = state?;
            loop {
                match mux.pull_async(mux.pull_timeout()).await {
                    Ok(bytes) if bytes.is_empty() => return None,
                    Ok(bytes) => return Some((Ok(bytes), Some(mux))),
                    Err(MuxError::Timeout) => continue,
                    Err(MuxError::Stopped) | Err(MuxError::Disconnected) => return None,
                    Err(e) => return Some((Err(e), None)),
                }
            }
        })
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Multiplexer")
            .field("state", &inner.state)
            .field("last_pcr", &inner.last_pcr)
            .field("streams", &inner.queues.iter().flatten().count())
            .field("total_buffers", &inner.total_buffers)
            .field("memory_used", &inner.memory_used)
            .finish()
    }
}

//! Software transport stream engine.
//!
//! [`SoftwareTsEngine`] turns the frames handed over by the multiplexer into
//! 188-byte MPEG-TS packets (or 192-byte timestamped packets), one PCR period
//! per call. Each period starts with a PCR packet, carries PAT/PMT (and SDT)
//! at the configured table period, any due section, then the due elementary
//! stream frames in decode order. With a fixed bitrate the period is padded
//! with null packets.

use bytes::{BufMut, BytesMut};
use log::{debug, trace};
use std::collections::{BTreeMap, HashMap, VecDeque};

use super::clock::{ring_add, ring_sub, time_is_before, Timestamp};
use super::types::*;
use crate::config::{table_generation, OutputType};
use crate::mux::engine::{
    global_flags, EngineError, EngineIndexRecord, StreamDescriptor, TransformEngine,
    TransformOutcome, TransformParams, TransformRequest, TransformStatus,
};
use crate::mux::frame::{index_flags, Frame, FrameId};
use crate::mux::queue::StreamHandle;
use crate::utils::crc::Crc32Mpeg2;

#[derive(Debug)]
struct EngineStream {
    descriptor: StreamDescriptor,
    /// Bytes already written of partially emitted frames.
    progress: HashMap<FrameId, usize>,
    /// Repeating section frame and the clock it is next due at.
    repeating: Option<(FrameId, Timestamp)>,
}

/// A [`TransformEngine`] that writes MPEG-TS in software.
#[derive(Debug, Default)]
pub struct SoftwareTsEngine {
    params: Option<TransformParams>,
    streams: BTreeMap<StreamHandle, EngineStream>,
    continuity: HashMap<u16, u8>,
    crc: Crc32Mpeg2,
    table_version: u8,
    next_tables_at: Option<Timestamp>,
    pcr_discontinuity: bool,
    table_discontinuity: bool,
}

/// Packets of one period under construction.
struct Period {
    packets: BytesMut,
    limit: usize,
}

impl Period {
    fn new(limit: usize) -> Self {
        Self {
            packets: BytesMut::with_capacity(limit * TS_PACKET_SIZE),
            limit,
        }
    }

    fn count(&self) -> usize {
        self.packets.len() / TS_PACKET_SIZE
    }

    fn room(&self) -> usize {
        self.limit.saturating_sub(self.count())
    }
}

fn encode(result: crate::Result<()>) -> Result<(), EngineError> {
    result.map_err(|e| EngineError::Failed(e.to_string()))
}

/// Signed distance of `dts` from `pcr` on the ring, for ordering.
fn ring_offset(dts: Timestamp, pcr: Timestamp) -> i64 {
    if time_is_before(dts, pcr) {
        -(ring_sub(pcr, dts) as i64)
    } else {
        ring_sub(dts, pcr) as i64
    }
}

impl SoftwareTsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version the next emitted PAT/PMT will carry.
    pub fn table_version(&self) -> u8 {
        self.table_version
    }

    fn params(&self) -> Result<&TransformParams, EngineError> {
        self.params.as_ref().ok_or(EngineError::NotOpen)
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0x0f);
        *cc = (*cc + 1) & 0x0f;
        *cc
    }

    fn write_pcr_packet(
        &mut self,
        period: &mut Period,
        pid: u16,
        pcr: Timestamp,
    ) -> Result<(), EngineError> {
        let header = TSHeader {
            pid,
            adaptation_field_exists: true,
            contains_payload: false,
            continuity_counter: self.continuity.get(&pid).copied().unwrap_or(0),
            ..Default::default()
        };
        let mut af = AdaptationField {
            discontinuity: std::mem::take(&mut self.pcr_discontinuity),
            pcr: Some(pcr),
            ..Default::default()
        };
        af.pad_to(TS_PAYLOAD_SIZE);
        encode(header.write_to(&mut period.packets))?;
        encode(af.write_to(&mut period.packets))
    }

    /// Writes one PSI section, all or nothing. Returns false when it did not fit.
    fn write_section(
        &mut self,
        period: &mut Period,
        pid: u16,
        section: &[u8],
        discontinuity: bool,
    ) -> Result<bool, EngineError> {
        let flagged = if discontinuity { 2 } else { 0 };
        let needed = (section.len() + 1 + flagged).div_ceil(TS_PAYLOAD_SIZE);
        if needed > period.room() {
            return Ok(false);
        }

        // pointer_field followed by the section
        let mut payload = BytesMut::with_capacity(section.len() + 1);
        payload.put_u8(0);
        payload.extend_from_slice(section);

        let mut offset = 0;
        while offset < payload.len() {
            let first = offset == 0;
            let af = AdaptationField {
                discontinuity: first && discontinuity,
                ..Default::default()
            };
            let af_len = if af.is_empty() { 0 } else { af.len() };
            let room = TS_PAYLOAD_SIZE - af_len;
            let n = room.min(payload.len() - offset);

            let header = TSHeader {
                pid,
                payload_unit_start: first,
                adaptation_field_exists: af_len > 0,
                continuity_counter: self.next_cc(pid),
                ..Default::default()
            };
            encode(header.write_to(&mut period.packets))?;
            if af_len > 0 {
                encode(af.write_to(&mut period.packets))?;
            }
            period.packets.extend_from_slice(&payload[offset..offset + n]);
            period.packets.put_bytes(0xff, room - n);
            offset += n;
        }
        Ok(true)
    }

    fn write_tables(
        &mut self,
        period: &mut Period,
        index: &mut Vec<EngineIndexRecord>,
    ) -> Result<(), EngineError> {
        let params = self.params()?.clone();
        let discontinuity = std::mem::take(&mut self.table_discontinuity);
        let offset = period.count() as u32;
        let mut flags = 0;

        if params.table_generation & table_generation::PAT_PMT != 0 {
            let mut pat = PAT::new(params.transport_stream_id);
            pat.version = self.table_version;
            pat.entries.push(PATEntry {
                program_number: params.program_number,
                program_map_pid: params.pmt_pid,
            });
            let section = encode_table(pat.to_section(&self.crc))?;
            if self.write_section(period, PID_PAT, &section, discontinuity)? {
                flags |= index_flags::PAT;
            }

            let mut pmt = PMT::new(params.program_number, params.pcr_pid);
            pmt.version = self.table_version;
            for stream in self.streams.values() {
                let d = &stream.descriptor;
                if d.is_section {
                    continue;
                }
                pmt.elementary_stream_infos.push(ElementaryStreamInfo {
                    stream_type: d.stream_type,
                    elementary_pid: d.pid,
                    descriptors: Vec::new(),
                });
            }
            pmt.elementary_stream_infos.sort_by_key(|info| info.elementary_pid);
            let section = encode_table(pmt.to_section(&self.crc))?;
            if self.write_section(period, params.pmt_pid, &section, discontinuity)? {
                flags |= index_flags::PMT;
            }
        }

        if params.table_generation & table_generation::SDT != 0 {
            let sdt = SDT {
                transport_stream_id: params.transport_stream_id,
                original_network_id: params.transport_stream_id,
                service_id: params.program_number,
                provider_name: params.provider_name.clone(),
                service_name: params.service_name.clone(),
            };
            let section = encode_table(sdt.to_section(&self.crc))?;
            if self.write_section(period, PID_SDT, &section, discontinuity)? {
                flags |= index_flags::SDT;
            }
        }

        if flags != 0 {
            index.push(EngineIndexRecord {
                stream: None,
                flags,
                pts: 0,
                native_pts: 0,
                packet_offset: offset,
            });
        }
        Ok(())
    }

    /// Emits section frames of one stream, completing replaced and one-shot ones.
    fn run_sections(
        &mut self,
        period: &mut Period,
        handle: StreamHandle,
        frames: &VecDeque<Frame>,
        pcr: Timestamp,
        completed: &mut Vec<FrameId>,
    ) -> Result<(), EngineError> {
        let Some(latest) = frames.back() else {
            return Ok(());
        };
        completed.extend(frames.iter().rev().skip(1).map(|f| f.id));

        let stream = self
            .streams
            .get_mut(&handle)
            .ok_or(EngineError::UnknownStream(handle))?;
        let pid = stream.descriptor.pid;
        if latest.payload_len() == 0 {
            stream.repeating = None;
            completed.push(latest.id);
            return Ok(());
        }

        let due = match stream.repeating {
            Some((id, next_at)) if id == latest.id => !time_is_before(pcr, next_at),
            _ => true,
        };
        if !due {
            return Ok(());
        }

        let mut section = BytesMut::new();
        for chunk in latest.chunks() {
            section.extend_from_slice(chunk);
        }
        if !self.write_section(period, pid, &section, latest.discontinuity)? {
            return Ok(());
        }
        trace!("section on pid {:#x} at {}", pid, pcr);

        let stream = self
            .streams
            .get_mut(&handle)
            .ok_or(EngineError::UnknownStream(handle))?;
        if latest.repeat_interval == 0 {
            stream.repeating = None;
            completed.push(latest.id);
        } else {
            stream.repeating = Some((latest.id, ring_add(pcr, latest.repeat_interval)));
        }
        Ok(())
    }

    /// Writes as much of `data` as fits, starting at `offset`. Returns the new offset.
    fn write_pes(
        &mut self,
        period: &mut Period,
        pid: u16,
        frame: &Frame,
        data: &[u8],
        mut offset: usize,
    ) -> Result<usize, EngineError> {
        while offset < data.len() && period.room() > 0 {
            let first = offset == 0;
            let mut af = AdaptationField {
                discontinuity: first && frame.discontinuity,
                random_access: first && frame.random_access,
                ..Default::default()
            };
            let mut af_len = if af.is_empty() { 0 } else { af.len() };
            let room = TS_PAYLOAD_SIZE - af_len;
            let n = room.min(data.len() - offset);
            if n < room {
                af_len = TS_PAYLOAD_SIZE - n;
                af.pad_to(af_len);
            }

            let header = TSHeader {
                pid,
                payload_unit_start: first,
                adaptation_field_exists: af_len > 0,
                continuity_counter: self.next_cc(pid),
                ..Default::default()
            };
            encode(header.write_to(&mut period.packets))?;
            if af_len > 0 {
                encode(af.write_to(&mut period.packets))?;
            }
            period.packets.extend_from_slice(&data[offset..offset + n]);
            offset += n;
        }
        Ok(offset)
    }
}

fn encode_table(result: crate::Result<bytes::Bytes>) -> Result<bytes::Bytes, EngineError> {
    result.map_err(|e| EngineError::Failed(e.to_string()))
}

/// Copies `data` across the scatter list.
fn scatter(output: &mut [&mut [u8]], mut data: &[u8]) -> Result<(), EngineError> {
    let available = output.iter().map(|b| b.len()).sum();
    let needed = data.len();
    for buf in output.iter_mut() {
        if data.is_empty() {
            break;
        }
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        data = &data[n..];
    }
    if !data.is_empty() {
        return Err(EngineError::OutputTooSmall { needed, available });
    }
    Ok(())
}

impl TransformEngine for SoftwareTsEngine {
    fn open(&mut self, params: &TransformParams) -> Result<(), EngineError> {
        self.continuity.clear();
        self.streams.clear();
        self.next_tables_at = None;
        self.pcr_discontinuity = params.global_flags & global_flags::PCR_DISCONTINUITY != 0;
        self.table_discontinuity = params.global_flags & global_flags::TABLE_DISCONTINUITY != 0;
        if self.table_discontinuity {
            self.table_version = (self.table_version + 1) & 0x1f;
        }
        debug!(
            "engine open: {} bit/s, {} packets per period, flags {:#x}",
            params.bitrate,
            params.packets_per_period(),
            params.global_flags
        );
        self.params = Some(params.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.params = None;
        self.streams.clear();
    }

    fn add_stream(&mut self, stream: &StreamDescriptor) -> Result<(), EngineError> {
        self.params()?;
        if self.streams.contains_key(&stream.handle) {
            return Err(EngineError::DuplicateStream(stream.handle));
        }
        self.streams.insert(
            stream.handle,
            EngineStream {
                descriptor: stream.clone(),
                progress: HashMap::new(),
                repeating: None,
            },
        );
        Ok(())
    }

    fn remove_stream(&mut self, handle: StreamHandle) -> Result<(), EngineError> {
        self.streams
            .remove(&handle)
            .map(|_| ())
            .ok_or(EngineError::UnknownStream(handle))
    }

    fn run(
        &mut self,
        request: &TransformRequest<'_>,
        output: &mut [&mut [u8]],
    ) -> Result<TransformStatus, EngineError> {
        let params = self.params()?.clone();
        let packet_size = params.packet_size();
        let limit = params.packets_per_period();
        let available: usize = output.iter().map(|b| b.len()).sum();
        if available < limit * packet_size {
            return Err(EngineError::OutputTooSmall {
                needed: limit * packet_size,
                available,
            });
        }

        let pcr = request.pcr;
        let period_end = ring_add(pcr, params.pcr_period);
        let mut period = Period::new(limit);
        let mut completed = Vec::new();
        let mut index = Vec::new();
        let mut outcome = TransformOutcome::Ok;

        self.write_pcr_packet(&mut period, params.pcr_pid, pcr)?;

        let tables_due = self
            .next_tables_at
            .map_or(true, |at| !time_is_before(pcr, at));
        if tables_due && params.table_generation != 0 {
            self.write_tables(&mut period, &mut index)?;
            self.next_tables_at = Some(ring_add(pcr, params.table_period));
        }

        // Sections first, then elementary streams in decode order.
        let mut candidates: Vec<(i64, usize, &Frame)> = Vec::new();
        for (order, batch) in request.streams.iter().enumerate() {
            let stream = self
                .streams
                .get(&batch.handle)
                .ok_or(EngineError::UnknownStream(batch.handle))?;
            if stream.descriptor.is_section {
                self.run_sections(&mut period, batch.handle, batch.frames, pcr, &mut completed)?;
                continue;
            }
            for frame in batch.frames.iter() {
                if frame.is_pause || frame.is_eos || frame.payload_len() == 0 {
                    completed.push(frame.id);
                    continue;
                }
                if !request.flush && !time_is_before(frame.dts, period_end) {
                    break;
                }
                candidates.push((ring_offset(frame.dts, pcr), order, frame));
            }
        }
        candidates.sort_by_key(|&(offset, order, _)| (offset, order));

        let mut unconsumed = false;
        for (offset, order, frame) in candidates {
            let handle = request.streams[order].handle;
            if period.room() == 0 {
                unconsumed = true;
                break;
            }
            let (pid, start) = match self.streams.get(&handle) {
                Some(s) => (
                    s.descriptor.pid,
                    s.progress.get(&frame.id).copied().unwrap_or(0),
                ),
                None => return Err(EngineError::UnknownStream(handle)),
            };
            if offset < 0 {
                outcome = TransformOutcome::DtsViolation;
            }
            if start == 0 && frame.index_flags != 0 {
                index.push(EngineIndexRecord {
                    stream: Some(handle),
                    flags: frame.index_flags,
                    pts: frame.dts,
                    native_pts: frame.native_dts,
                    packet_offset: period.count() as u32,
                });
            }

            let mut data = BytesMut::with_capacity(frame.length());
            for chunk in frame.chunks() {
                data.extend_from_slice(chunk);
            }
            let written = self.write_pes(&mut period, pid, frame, &data, start)?;
            let stream = self
                .streams
                .get_mut(&handle)
                .ok_or(EngineError::UnknownStream(handle))?;
            if written >= data.len() {
                stream.progress.remove(&frame.id);
                completed.push(frame.id);
            } else {
                stream.progress.insert(frame.id, written);
                unconsumed = true;
            }
        }

        if !unconsumed {
            unconsumed = request.streams.iter().any(|batch| {
                self.streams
                    .get(&batch.handle)
                    .is_some_and(|s| !s.descriptor.is_section)
                    && batch
                        .frames
                        .iter()
                        .any(|f| !completed.contains(&f.id))
            });
        }

        let mut packets = period.count();
        if params.fixed_bitrate {
            while period.room() > 0 {
                let header = TSHeader {
                    pid: PID_NULL,
                    ..Default::default()
                };
                encode(header.write_to(&mut period.packets))?;
                period.packets.put_bytes(0xff, TS_PAYLOAD_SIZE);
            }
            packets = period.count();
        }

        let bytes = match params.output_type {
            OutputType::Ts => {
                scatter(output, &period.packets)?;
                period.packets.len()
            }
            OutputType::Tts => {
                let mut framed = BytesMut::with_capacity(packets * TTS_PACKET_SIZE);
                let ticks_per_packet =
                    (TS_PACKET_SIZE as u64 * 8 * PCR_HZ) / params.bitrate.max(1);
                for (i, packet) in period.packets.chunks(TS_PACKET_SIZE).enumerate() {
                    let arrival = pcr * 300 + i as u64 * ticks_per_packet;
                    framed.put_u32((arrival & 0x3fff_ffff) as u32);
                    framed.extend_from_slice(packet);
                }
                scatter(output, &framed)?;
                framed.len()
            }
        };

        trace!(
            "period at {}: {} packets, {} completed, unconsumed {}",
            pcr,
            packets,
            completed.len(),
            unconsumed
        );
        Ok(TransformStatus {
            bytes,
            packets: packets as u32,
            pcr,
            outcome,
            completed,
            index,
            unconsumed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MuxConfig;
    use crate::mux::engine::StreamBatch;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    fn open_engine(config: &MuxConfig) -> SoftwareTsEngine {
        let mut engine = SoftwareTsEngine::new();
        engine
            .open(&TransformParams::from_config(config, 0))
            .unwrap();
        engine
    }

    fn video(handle: usize) -> StreamDescriptor {
        StreamDescriptor {
            handle: StreamHandle(handle),
            pid: 0x100 + handle as u16,
            stream_type: STREAM_TYPE_H264,
            stream_id: STREAM_ID_VIDEO,
            is_section: false,
            stream_is_pes: false,
        }
    }

    fn frame(id: u64, dts: u64, len: usize) -> Frame {
        Frame::new(FrameId(id), dts, vec![Bytes::from(vec![0xaa; len])])
    }

    fn run(
        engine: &mut SoftwareTsEngine,
        pcr: u64,
        flush: bool,
        streams: Vec<StreamBatch<'_>>,
    ) -> (TransformStatus, Vec<u8>) {
        let size = engine.params().unwrap().output_size();
        let mut out = vec![0u8; size];
        let request = TransformRequest { pcr, flush, streams };
        let status = engine.run(&request, &mut [out.as_mut_slice()]).unwrap();
        out.truncate(status.bytes);
        (status, out)
    }

    fn pids(out: &[u8]) -> Vec<u16> {
        out.chunks(TS_PACKET_SIZE)
            .filter_map(TSHeader::pid_of)
            .collect()
    }

    #[test]
    fn test_period_layout() {
        let config = MuxConfig::default();
        let mut engine = open_engine(&config);
        engine.add_stream(&video(0)).unwrap();

        let frames: VecDeque<Frame> = vec![frame(1, 1000, 400)].into();
        let (status, out) = run(
            &mut engine,
            0,
            false,
            vec![StreamBatch {
                handle: StreamHandle(0),
                paused: false,
                frames: &frames,
            }],
        );

        assert_eq!(status.packets, 665);
        assert_eq!(status.bytes, 665 * TS_PACKET_SIZE);
        assert_eq!(status.completed, vec![FrameId(1)]);
        assert!(!status.unconsumed);

        let pids = pids(&out);
        assert_eq!(&pids[..3], &[config.pcr_pid, PID_PAT, config.pmt_pid]);
        // 400 bytes span three packets
        assert_eq!(&pids[3..6], &[0x100, 0x100, 0x100]);
        assert_eq!(pids[6], PID_NULL);
        assert_eq!(read_pcr(&out[..TS_PACKET_SIZE]), Some(0));
    }

    #[test]
    fn test_future_frames_wait() {
        let mut engine = open_engine(&MuxConfig::default());
        engine.add_stream(&video(0)).unwrap();
        let frames: VecDeque<Frame> = vec![frame(1, 1000, 10), frame(2, 9000, 10)].into();
        let batch = || StreamBatch {
            handle: StreamHandle(0),
            paused: false,
            frames: &frames,
        };

        let (status, _) = run(&mut engine, 0, false, vec![batch()]);
        assert_eq!(status.completed, vec![FrameId(1)]);
        assert!(status.unconsumed);

        let (status, _) = run(&mut engine, 0, true, vec![batch()]);
        assert!(status.completed.contains(&FrameId(2)));
    }

    #[test]
    fn test_continuity_counters_increment_per_pid() {
        let mut engine = open_engine(&MuxConfig::default());
        engine.add_stream(&video(0)).unwrap();
        let frames: VecDeque<Frame> = vec![frame(1, 0, 1000)].into();
        let (_, out) = run(
            &mut engine,
            0,
            false,
            vec![StreamBatch {
                handle: StreamHandle(0),
                paused: false,
                frames: &frames,
            }],
        );
        let counters: Vec<u8> = out
            .chunks(TS_PACKET_SIZE)
            .filter(|p| TSHeader::pid_of(p) == Some(0x100))
            .map(|p| p[3] & 0x0f)
            .collect();
        assert_eq!(counters, (0..counters.len() as u8).collect::<Vec<_>>());
        // PUSI only on the first packet of the frame
        let starts = out
            .chunks(TS_PACKET_SIZE)
            .filter(|p| TSHeader::pid_of(p) == Some(0x100) && p[1] & 0x40 != 0)
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_partial_frame_resumes_next_period() {
        let config = MuxConfig {
            bitrate: 300_000,
            ..MuxConfig::default()
        };
        let mut engine = open_engine(&config);
        engine.add_stream(&video(0)).unwrap();
        let per_period = engine.params().unwrap().packets_per_period();
        // bigger than one period can carry
        let frames: VecDeque<Frame> = vec![frame(1, 0, per_period * TS_PAYLOAD_SIZE)].into();
        let batch = || StreamBatch {
            handle: StreamHandle(0),
            paused: false,
            frames: &frames,
        };

        let (status, _) = run(&mut engine, 0, false, vec![batch()]);
        assert!(status.completed.is_empty());
        assert!(status.unconsumed);
        assert_eq!(status.index.iter().filter(|r| r.stream.is_some()).count(), 0);

        let (status, _) = run(&mut engine, 4500, false, vec![batch()]);
        assert_eq!(status.completed, vec![FrameId(1)]);
    }

    #[test]
    fn test_markers_complete_without_output() {
        let mut engine = open_engine(&MuxConfig {
            fixed_bitrate: false,
            ..MuxConfig::default()
        });
        engine.add_stream(&video(0)).unwrap();
        let mut eos = frame(2, 0, 0);
        eos.is_eos = true;
        let frames: VecDeque<Frame> = vec![Frame::pause_marker(FrameId(1)), eos].into();
        let (status, out) = run(
            &mut engine,
            0,
            false,
            vec![StreamBatch {
                handle: StreamHandle(0),
                paused: true,
                frames: &frames,
            }],
        );
        assert_eq!(status.completed, vec![FrameId(1), FrameId(2)]);
        assert!(!pids(&out).contains(&0x100));
    }

    #[test]
    fn test_discontinuity_flags_after_restart_open() {
        let config = MuxConfig::default();
        let mut engine = SoftwareTsEngine::new();
        let flags = global_flags::PCR_DISCONTINUITY | global_flags::TABLE_DISCONTINUITY;
        engine
            .open(&TransformParams::from_config(&config, flags))
            .unwrap();
        assert_eq!(engine.table_version(), 1);
        let (_, out) = run(&mut engine, 0, false, Vec::new());

        // adaptation field flags byte of the PCR packet
        assert_ne!(out[5] & 0x80, 0);
        // the PAT is the second packet and carries the indicator too
        let pat = &out[TS_PACKET_SIZE..2 * TS_PACKET_SIZE];
        assert_ne!(pat[3] & 0x20, 0);
        assert_ne!(pat[5] & 0x80, 0);

        let (_, out) = run(&mut engine, 4500, false, Vec::new());
        assert_eq!(out[5] & 0x80, 0);
    }

    #[test]
    fn test_section_repeats_until_replaced() {
        let mut engine = open_engine(&MuxConfig::default());
        let section_pid = 0x30;
        engine
            .add_stream(&StreamDescriptor {
                handle: StreamHandle(0),
                pid: section_pid,
                stream_type: STREAM_TYPE_PRIVATE_PES,
                stream_id: 0,
                is_section: true,
                stream_is_pes: false,
            })
            .unwrap();
        let mut table = frame(1, 0, 20);
        table.repeat_interval = 9000;
        let frames: VecDeque<Frame> = vec![table].into();
        let batch = || StreamBatch {
            handle: StreamHandle(0),
            paused: false,
            frames: &frames,
        };
        let count = |out: &[u8]| pids(out).iter().filter(|&&p| p == section_pid).count();

        let (status, out) = run(&mut engine, 0, false, vec![batch()]);
        assert_eq!(count(&out), 1);
        assert!(status.completed.is_empty());
        let (_, out) = run(&mut engine, 4500, false, vec![batch()]);
        assert_eq!(count(&out), 0);
        let (_, out) = run(&mut engine, 9000, false, vec![batch()]);
        assert_eq!(count(&out), 1);

        let replaced: VecDeque<Frame> = vec![frame(1, 0, 20), frame(2, 0, 0)].into();
        let (status, out) = run(
            &mut engine,
            13500,
            false,
            vec![StreamBatch {
                handle: StreamHandle(0),
                paused: false,
                frames: &replaced,
            }],
        );
        assert_eq!(status.completed, vec![FrameId(1), FrameId(2)]);
        assert_eq!(count(&out), 0);
    }

    #[test]
    fn test_tts_framing() {
        let config = MuxConfig {
            output_type: OutputType::Tts,
            ..MuxConfig::default()
        };
        let mut engine = open_engine(&config);
        let (status, out) = run(&mut engine, 0, false, Vec::new());
        assert_eq!(status.bytes, 665 * TTS_PACKET_SIZE);
        assert_eq!(out[4], TS_SYNC_BYTE);
        assert_eq!(out[4 + TTS_PACKET_SIZE], TS_SYNC_BYTE);
    }

    #[test]
    fn test_rejects_small_output_and_unknown_streams() {
        let mut engine = SoftwareTsEngine::new();
        assert!(matches!(
            engine.add_stream(&video(0)),
            Err(EngineError::NotOpen)
        ));
        let mut engine = open_engine(&MuxConfig::default());
        engine.add_stream(&video(0)).unwrap();
        assert!(matches!(
            engine.add_stream(&video(0)),
            Err(EngineError::DuplicateStream(_))
        ));

        let mut small = vec![0u8; TS_PACKET_SIZE];
        let request = TransformRequest {
            pcr: 0,
            flush: false,
            streams: Vec::new(),
        };
        assert!(matches!(
            engine.run(&request, &mut [small.as_mut_slice()]),
            Err(EngineError::OutputTooSmall { .. })
        ));
        assert!(matches!(
            engine.remove_stream(StreamHandle(5)),
            Err(EngineError::UnknownStream(_))
        ));
    }
}

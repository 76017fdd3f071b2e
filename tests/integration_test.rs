#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use core::future::Future;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};
    use vdkmux::config::{IndexSinkConfig, MuxConfig, OutputType, ReadMode, StreamConfig};
    use vdkmux::error::{MuxError, Result};
    use vdkmux::format::ts::clock::{ring_sub, MAX_DTS};
    use vdkmux::format::ts::types::{read_pcr, PID_NULL, PID_PAT, PID_PMT};
    use vdkmux::format::ts::{
        PesTiming, SoftwareTsEngine, TSHeader, STREAM_TYPE_AAC, STREAM_TYPE_H264, TS_PACKET_SIZE,
        TTS_PACKET_SIZE,
    };
    use vdkmux::mux::{index_flags, FrameMetadata, MuxState, Multiplexer, Registry};

    const TEST_OUTPUT_TIMEOUT: u64 = 10;
    const PULL: std::time::Duration = std::time::Duration::from_millis(200);

    async fn with_timeout<T, F>(secs: u64, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(Duration::from_secs(secs), future).await {
            Ok(result) => result,
            Err(_) => Err(MuxError::Timeout),
        }
    }

    fn frame(dts: u64, len: usize) -> (FrameMetadata, Vec<Bytes>) {
        (
            FrameMetadata::new().with_dts(dts),
            vec![Bytes::from(vec![0xa5; len])],
        )
    }

    fn payload_start(packet: &[u8]) -> usize {
        if packet[3] & 0x20 != 0 {
            5 + packet[4] as usize
        } else {
            4
        }
    }

    fn has_pusi(packet: &[u8]) -> bool {
        packet[1] & 0x40 != 0
    }

    fn has_discontinuity(packet: &[u8]) -> bool {
        packet[3] & 0x20 != 0 && packet[4] > 0 && packet[5] & 0x80 != 0
    }

    /// (stream_type, pid) pairs and the PCR PID of a PMT packet.
    fn parse_pmt(packet: &[u8]) -> (Vec<(u8, u16)>, u16) {
        let start = payload_start(packet);
        let pointer = packet[start] as usize;
        let s = &packet[start + 1 + pointer..];
        assert_eq!(s[0], 0x02);
        let section_length = (((s[1] & 0x0f) as usize) << 8) | s[2] as usize;
        let pcr_pid = (((s[8] & 0x1f) as u16) << 8) | s[9] as u16;
        let program_info_length = (((s[10] & 0x0f) as usize) << 8) | s[11] as usize;

        let end = 3 + section_length - 4;
        let mut pos = 12 + program_info_length;
        let mut streams = Vec::new();
        while pos + 5 <= end {
            let stream_type = s[pos];
            let pid = (((s[pos + 1] & 0x1f) as u16) << 8) | s[pos + 2] as u16;
            let es_info_length = (((s[pos + 3] & 0x0f) as usize) << 8) | s[pos + 4] as usize;
            streams.push((stream_type, pid));
            pos += 5 + es_info_length;
        }
        (streams, pcr_pid)
    }

    fn av_mux(config: MuxConfig) -> Result<(Arc<Multiplexer>, vdkmux::mux::StreamHandle, vdkmux::mux::StreamHandle)> {
        let mux = Arc::new(Multiplexer::new(config, Box::new(SoftwareTsEngine::new()))?);
        let video = mux.attach_stream(StreamConfig::new(STREAM_TYPE_H264))?;
        let audio = mux.attach_stream(StreamConfig::new(STREAM_TYPE_AAC))?;
        Ok((mux, video, audio))
    }

    #[tokio::test]
    async fn test_full_pipeline_produces_valid_transport_stream() -> Result<()> {
        let (mux, video, audio) = av_mux(MuxConfig::default())?;
        let sink = mux.attach_index_sink(
            video,
            IndexSinkConfig {
                mask: index_flags::PUSI,
                mode: ReadMode::NonBlocking,
                ..IndexSinkConfig::default()
            },
        )?;
        mux.start()?;

        println!("Submitting 30 video and 50 audio frames...");
        for i in 0..30u64 {
            let (meta, data) = frame(i * 3600, 3000);
            mux.submit(video, meta, data)?;
        }
        for i in 0..50u64 {
            let (meta, data) = frame(i * 1920, 400);
            mux.submit(audio, meta, data)?;
        }
        mux.submit(video, FrameMetadata::eos(), Vec::new())?;
        mux.submit(audio, FrameMetadata::eos(), Vec::new())?;
        assert_eq!(mux.state(), MuxState::Flushing);

        let periods: Vec<Bytes> = with_timeout(TEST_OUTPUT_TIMEOUT, async {
            let collected: Vec<Result<Bytes>> = Arc::clone(&mux).output_stream().collect().await;
            collected.into_iter().collect()
        })
        .await?;
        println!("Collected {} output periods", periods.len());
        assert!(!periods.is_empty());
        assert_eq!(mux.state(), MuxState::Flushed);

        let mut pcrs = Vec::new();
        let mut pes_starts: HashMap<u16, usize> = HashMap::new();
        let mut pmt = None;
        let mut saw_pat = false;
        let mut first_video_pts = None;

        for period in &periods {
            assert_eq!(period.len() % TS_PACKET_SIZE, 0);
            for packet in period.chunks(TS_PACKET_SIZE) {
                let pid = TSHeader::pid_of(packet).expect("sync byte");
                match pid {
                    0x01ff => pcrs.push(read_pcr(packet).expect("pcr packet")),
                    PID_PAT => saw_pat |= has_pusi(packet),
                    PID_PMT if has_pusi(packet) => pmt = Some(parse_pmt(packet)),
                    PID_NULL => {}
                    pid if has_pusi(packet) => {
                        let payload = &packet[payload_start(packet)..];
                        assert_eq!(&payload[..3], &[0, 0, 1]);
                        *pes_starts.entry(pid).or_default() += 1;
                        if pid == 0x100 && first_video_pts.is_none() {
                            first_video_pts = PesTiming::parse(payload)?.decode_time();
                        }
                    }
                    _ => {}
                }
            }
        }

        assert!(saw_pat);
        let (streams, pcr_pid) = pmt.expect("PMT emitted");
        assert_eq!(streams, vec![(STREAM_TYPE_H264, 0x100), (STREAM_TYPE_AAC, 0x101)]);
        assert_eq!(pcr_pid, 0x01ff);

        assert_eq!(pes_starts.get(&0x100), Some(&30));
        assert_eq!(pes_starts.get(&0x101), Some(&50));
        assert_eq!(first_video_pts, Some(0));

        // one clock reference per period, a period apart, starting below zero
        assert_eq!(pcrs.len(), periods.len());
        assert_eq!(pcrs[0], MAX_DTS + 1 - 4500);
        for pair in pcrs.windows(2) {
            assert_eq!(ring_sub(pair[1], pair[0]), 4500);
        }

        let mut buf = vec![0u8; 64 * vdkmux::mux::INDEX_RECORD_SIZE];
        let records = mux.index_read(sink, &mut buf)?;
        assert_eq!(records, 30);

        mux.stop()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_restart_marks_output_discontinuous() -> Result<()> {
        let mux = Arc::new(Multiplexer::new(
            MuxConfig::default(),
            Box::new(SoftwareTsEngine::new()),
        )?);
        let video = mux.attach_stream(StreamConfig::new(STREAM_TYPE_H264))?;
        mux.start()?;

        for i in 0..10u64 {
            let (meta, data) = frame(i * 3000, 500);
            mux.submit(video, meta, data)?;
        }
        let first = mux.pull_async(PULL).await?;
        assert!(!has_discontinuity(&first[..TS_PACKET_SIZE]));

        println!("Jumping the timeline until the session restarts...");
        let mut restarted = false;
        for _ in 0..3 {
            let (meta, data) = frame(5_000_000, 500);
            match mux.submit(video, meta, data) {
                Err(MuxError::TimestampIntegrity { restarted: r }) => restarted = r,
                other => panic!("expected an integrity failure, got {:?}", other),
            }
        }
        assert!(restarted);
        assert_eq!(mux.status().restarts, 1);
        assert_eq!(mux.state(), MuxState::Started);

        for i in 0..10u64 {
            let (meta, data) = frame(5_000_000 + i * 3000, 500);
            mux.submit(video, meta, data)?;
        }
        let after = mux.pull_async(PULL).await?;
        let pcr_packet = &after[..TS_PACKET_SIZE];
        assert!(has_discontinuity(pcr_packet));
        assert_eq!(read_pcr(pcr_packet), Some(5_000_000 - 4500));

        let next = mux.pull_async(PULL).await?;
        assert!(!has_discontinuity(&next[..TS_PACKET_SIZE]));
        let first_pes = next
            .chunks(TS_PACKET_SIZE)
            .find(|p| TSHeader::pid_of(p) == Some(0x100) && has_pusi(p))
            .expect("video emitted");
        assert!(has_discontinuity(first_pes));

        mux.stop()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_timestamped_output_framing() -> Result<()> {
        let config = MuxConfig {
            output_type: OutputType::Tts,
            ..MuxConfig::default()
        };
        let (mux, video, audio) = av_mux(config)?;
        mux.start()?;
        for i in 0..20u64 {
            let (meta, data) = frame(i * 3600, 1500);
            mux.submit(video, meta, data)?;
            let (meta, data) = frame(i * 1920, 300);
            mux.submit(audio, meta, data)?;
        }

        let out = mux.pull_async(PULL).await?;
        assert_eq!(out.len(), mux.output_buffer_size());
        assert_eq!(out.len() % TTS_PACKET_SIZE, 0);
        let arrivals: Vec<u32> = out
            .chunks(TTS_PACKET_SIZE)
            .map(|p| {
                assert_eq!(p[4], 0x47);
                u32::from_be_bytes([p[0], p[1], p[2], p[3]])
            })
            .collect();
        assert!(arrivals.windows(2).all(|w| w[1] > w[0]));

        mux.stop()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_registry_sessions_run_independently() -> Result<()> {
        let registry = Registry::new(4);
        let first = registry.create("first", MuxConfig::default(), Box::new(SoftwareTsEngine::new()))?;
        let second = registry.create(
            "second",
            MuxConfig {
                bitrate: 5_000_000,
                ..MuxConfig::default()
            },
            Box::new(SoftwareTsEngine::new()),
        )?;

        for mux in [&first, &second] {
            let video = mux.attach_stream(StreamConfig::new(STREAM_TYPE_H264))?;
            mux.start()?;
            for i in 0..12u64 {
                let (meta, data) = frame(i * 3000, 800);
                mux.submit(video, meta, data)?;
            }
        }

        let a = with_timeout(TEST_OUTPUT_TIMEOUT, first.pull_async(PULL)).await?;
        let b = with_timeout(TEST_OUTPUT_TIMEOUT, second.pull_async(PULL)).await?;
        assert_eq!(a.len(), 665 * TS_PACKET_SIZE);
        assert_eq!(b.len(), 167 * TS_PACKET_SIZE);

        registry.remove("first")?;
        assert!(matches!(first.pull_bytes(PULL), Err(MuxError::Disconnected)));
        assert!(second.pull_bytes(PULL).is_ok());

        registry.teardown();
        assert!(matches!(second.start(), Err(MuxError::Disconnected)));
        Ok(())
    }
}

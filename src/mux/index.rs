//! Bounded index record rings.
//!
//! A sink keeps the most recent `capacity` records. Writers never wait: when
//! the ring is full the oldest record is dropped and counted as an overflow.
//! Readers copy whole records and wait only while the ring is empty.

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::{IndexSinkConfig, ReadMode};
use crate::error::{MuxError, Result};
use crate::format::ts::clock::Timestamp;

/// Serialized size of one [`IndexRecord`].
pub const INDEX_RECORD_SIZE: usize = 32;

/// Position marker describing where a tagged event landed in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexRecord {
    /// The single [`index_flags`](super::frame::index_flags) bit this record describes.
    pub flag: u32,
    pub pid: u16,
    pub pts: Timestamp,
    pub native_pts: u64,
    pub stream_id: u8,
    pub stream_type: u8,
    /// Output packet number the event starts in.
    pub packet_offset: u32,
}

impl IndexRecord {
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.flag);
        buf.put_u16(self.pid);
        buf.put_u8(self.stream_id);
        buf.put_u8(self.stream_type);
        buf.put_u64(self.pts);
        buf.put_u64(self.native_pts);
        buf.put_u32(self.packet_offset);
        buf.put_u32(0);
    }

    /// Decodes one record from the start of `data`.
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() < INDEX_RECORD_SIZE {
            return Err(MuxError::InvalidData("short index record".into()));
        }
        let flag = data.get_u32();
        let pid = data.get_u16();
        let stream_id = data.get_u8();
        let stream_type = data.get_u8();
        let pts = data.get_u64();
        let native_pts = data.get_u64();
        let packet_offset = data.get_u32();
        Ok(Self {
            flag,
            pid,
            pts,
            native_pts,
            stream_id,
            stream_type,
            packet_offset,
        })
    }
}

struct Ring {
    records: VecDeque<IndexRecord>,
    overflows: u64,
    closed: bool,
}

/// Fixed-capacity ring of index records with blocking readers.
pub struct IndexSink {
    capacity: usize,
    mask: u32,
    mode: ReadMode,
    ring: Mutex<Ring>,
    available: Condvar,
}

impl IndexSink {
    pub fn new(config: &IndexSinkConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(MuxError::Config("index sink capacity must be non-zero".into()));
        }
        Ok(Self {
            capacity: config.capacity,
            mask: config.mask,
            mode: config.mode,
            ring: Mutex::new(Ring {
                records: VecDeque::with_capacity(config.capacity),
                overflows: 0,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    /// Flags this sink subscribes to.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records dropped because the reader fell behind.
    pub fn overflows(&self) -> u64 {
        self.ring.lock().overflows
    }

    pub fn len(&self) -> usize {
        self.ring.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends the records whose flag matches the mask, dropping the oldest on overflow.
    pub fn push(&self, records: &[IndexRecord]) {
        let mut ring = self.ring.lock();
        if ring.closed {
            return;
        }
        let mut pushed = false;
        for record in records.iter().filter(|r| r.flag & self.mask != 0) {
            if ring.records.len() == self.capacity {
                ring.records.pop_front();
                ring.overflows += 1;
            }
            ring.records.push_back(*record);
            pushed = true;
        }
        if pushed {
            self.available.notify_all();
        }
    }

    /// Copies whole records into `buf`, returning the number of bytes written.
    ///
    /// Honors the sink's read mode: a blocking sink waits for at least one
    /// record, a non-blocking one returns 0 when empty.
    pub fn read_bytes(&self, buf: &mut [u8]) -> Result<usize> {
        let max = buf.len() / INDEX_RECORD_SIZE;
        let records = self.take(max, None)?;
        let mut out = BytesMut::with_capacity(records.len() * INDEX_RECORD_SIZE);
        for record in &records {
            record.write_to(&mut out);
        }
        buf[..out.len()].copy_from_slice(&out);
        Ok(out.len())
    }

    /// Takes up to `max` records using the sink's read mode.
    pub fn read_records(&self, max: usize) -> Result<Vec<IndexRecord>> {
        self.take(max, None)
    }

    /// Like [`read_records`](Self::read_records) but a blocking wait gives up
    /// after `timeout` with [`MuxError::Timeout`].
    pub fn read_records_timeout(&self, max: usize, timeout: Duration) -> Result<Vec<IndexRecord>> {
        self.take(max, Some(Instant::now() + timeout))
    }

    fn take(&self, max: usize, deadline: Option<Instant>) -> Result<Vec<IndexRecord>> {
        let mut ring = self.ring.lock();
        if max == 0 {
            return Ok(Vec::new());
        }

        while ring.records.is_empty() {
            if ring.closed {
                return Err(MuxError::Disconnected);
            }
            if self.mode == ReadMode::NonBlocking {
                return Ok(Vec::new());
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut ring, deadline).timed_out()
                        && ring.records.is_empty()
                    {
                        return Err(MuxError::Timeout);
                    }
                }
                None => self.available.wait(&mut ring),
            }
        }

        let n = max.min(ring.records.len());
        Ok(ring.records.drain(..n).collect())
    }

    /// Wakes blocked readers with [`MuxError::Disconnected`] and refuses further records.
    pub fn close(&self) {
        let mut ring = self.ring.lock();
        ring.closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().closed
    }
}

impl fmt::Debug for IndexSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("IndexSink")
            .field("capacity", &self.capacity)
            .field("mask", &format_args!("{:#x}", self.mask))
            .field("len", &ring.records.len())
            .field("overflows", &ring.overflows)
            .field("closed", &ring.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::frame::index_flags;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::thread;

    fn record(flag: u32, pts: u64) -> IndexRecord {
        IndexRecord {
            flag,
            pid: 0x100,
            pts,
            ..Default::default()
        }
    }

    fn sink(capacity: usize, mode: ReadMode) -> IndexSink {
        IndexSink::new(&IndexSinkConfig {
            capacity,
            mask: index_flags::PUSI | index_flags::PTS,
            mode,
        })
        .unwrap()
    }

    #[test]
    fn test_mask_filters_records() {
        let sink = sink(8, ReadMode::NonBlocking);
        sink.push(&[
            record(index_flags::PUSI, 1),
            record(index_flags::RAP, 2),
            record(index_flags::PTS, 3),
        ]);
        let records = sink.read_records(8).unwrap();
        assert_eq!(
            records.iter().map(|r| r.pts).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let sink = sink(3, ReadMode::NonBlocking);
        for pts in 0..5 {
            sink.push(&[record(index_flags::PUSI, pts)]);
        }
        assert_eq!(sink.overflows(), 2);
        let records = sink.read_records(10).unwrap();
        assert_eq!(
            records.iter().map(|r| r.pts).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn test_read_bytes_copies_whole_records_only() {
        let sink = sink(8, ReadMode::NonBlocking);
        sink.push(&[record(index_flags::PUSI, 7), record(index_flags::PUSI, 8)]);

        let mut buf = [0u8; INDEX_RECORD_SIZE + 10];
        let n = sink.read_bytes(&mut buf).unwrap();
        assert_eq!(n, INDEX_RECORD_SIZE);
        assert_eq!(IndexRecord::parse(&buf).unwrap().pts, 7);
        assert_eq!(sink.len(), 1);

        let mut small = [0u8; 16];
        assert_eq!(sink.read_bytes(&mut small).unwrap(), 0);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_non_blocking_empty_returns_nothing() {
        let sink = sink(4, ReadMode::NonBlocking);
        assert!(sink.read_records(4).unwrap().is_empty());
    }

    #[test]
    fn test_blocking_reader_wakes_on_push() {
        let sink = Arc::new(sink(4, ReadMode::Blocking));
        let reader = {
            let sink = Arc::clone(&sink);
            thread::spawn(move || sink.read_records(4))
        };
        thread::sleep(Duration::from_millis(20));
        sink.push(&[record(index_flags::PTS, 42)]);
        let records = reader.join().unwrap().unwrap();
        assert_eq!(records[0].pts, 42);
    }

    #[test]
    fn test_blocking_timeout_and_close() {
        let sink = Arc::new(sink(4, ReadMode::Blocking));
        assert!(matches!(
            sink.read_records_timeout(1, Duration::from_millis(10)),
            Err(MuxError::Timeout)
        ));

        let reader = {
            let sink = Arc::clone(&sink);
            thread::spawn(move || sink.read_records(1))
        };
        thread::sleep(Duration::from_millis(20));
        sink.close();
        assert!(matches!(
            reader.join().unwrap(),
            Err(MuxError::Disconnected)
        ));
    }

    #[test]
    fn test_record_parse_matches_layout() {
        let original = IndexRecord {
            flag: index_flags::RAP,
            pid: 0x1e,
            pts: 0x1_0000_0001,
            native_pts: 99,
            stream_id: 0xe0,
            stream_type: 0x1b,
            packet_offset: 12,
        };
        let mut buf = BytesMut::new();
        original.write_to(&mut buf);
        assert_eq!(buf.len(), INDEX_RECORD_SIZE);
        assert_eq!(IndexRecord::parse(&buf).unwrap(), original);
    }
}

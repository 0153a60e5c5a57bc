//! Mapped bus — a single-writer, multi-reader ring over a shared mapping.
//!
//! The cache daemon publishes out-of-band notifications here (update in
//! progress, update complete) for cohabiting processes.
//!
//! # Layout
//!
//! ```text
//! Offset  Size  Field
//!    0      8   limit     u64  atomic; next free byte offset
//!    8      8   rollover  u64  reserved
//!   16      N   records
//!
//! record = status u8 ‖ kind u32 ‖ payload (recordSize bytes)
//! entrySize = 5 + recordSize
//! ```
//!
//! Status: 0 unpublished, 1 committed, 0xFF rolled back.
//!
//! # Protocol
//! A writer reserves space with a relaxed fetch-add on `limit` (the
//! status-byte release store, not the reservation, is what publishes the
//! payload), fills kind and payload while the status is still 0, then
//! release-stores status 1. Readers keep independent cursors, spin with a
//! bounded backoff on status 0, and skip rolled-back records. There is no
//! backpressure: once `limit` passes the end of the file the bus is closed
//! until it is recreated.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::CacheError;
use crate::region::MappedRegion;

const LIMIT_OFFSET:   usize = 0;
const RECORDS_OFFSET: usize = 16;
const STATUS_LEN:     usize = 1;
const KIND_LEN:       usize = 4;

pub const STATUS_UNPUBLISHED: u8 = 0;
pub const STATUS_COMMITTED:   u8 = 1;
pub const STATUS_ROLLED_BACK: u8 = 0xFF;

/// A cache rebuild has started; readers should expect misses.
pub const MSG_UPDATE_BEGIN: u32 = 1;
/// A cache rebuild committed; payload carries the new version.
pub const MSG_UPDATE_DONE:  u32 = 2;

/// Payload bytes per record in the daemon's bus.
pub const DEFAULT_RECORD_SIZE: usize = 16;

/// Spins between deadline checks while waiting on an unpublished record.
const POLL_SPINS: u32 = 64;

pub struct MappedBus {
    region:      MappedRegion,
    record_size: usize,
}

impl MappedBus {
    /// Create a fresh bus file, discarding any previous one. `limit` starts
    /// at the records offset and the whole ring reads as unpublished.
    pub fn create<P: AsRef<Path>>(
        path: P,
        size: u64,
        record_size: usize,
    ) -> Result<Self, CacheError> {
        match std::fs::remove_file(path.as_ref()) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let region = MappedRegion::new(path, size)?;
        region.put_u64(LIMIT_OFFSET, RECORDS_OFFSET as u64)?;
        Ok(Self { region, record_size })
    }

    fn entry_size(&self) -> usize {
        STATUS_LEN + KIND_LEN + self.record_size
    }

    /// Reserve the next slot. Fails with `EndOfBus` once the ring is spent.
    pub fn begin(&self, kind: u32) -> Result<PendingRecord<'_>, CacheError> {
        let entry = self.entry_size();
        let pos = self.region.fetch_add_u64(LIMIT_OFFSET, entry as u64)? as usize;
        if pos + entry > self.region.len() {
            return Err(CacheError::EndOfBus);
        }
        self.region.put_u32(pos + STATUS_LEN, kind)?;
        Ok(PendingRecord { bus: self, pos })
    }

    /// Reserve, fill, and commit in one step.
    pub fn publish(&self, kind: u32, payload: &[u8]) -> Result<(), CacheError> {
        let record = self.begin(kind)?;
        record.write_payload(payload)?;
        record.commit()
    }
}

/// A reserved, not-yet-visible record. Readers spin on its status byte until
/// [`PendingRecord::commit`] release-stores it, so they never observe a
/// partial payload.
pub struct PendingRecord<'a> {
    bus: &'a MappedBus,
    pos: usize,
}

impl PendingRecord<'_> {
    pub fn write_payload(&self, payload: &[u8]) -> Result<(), CacheError> {
        if payload.len() > self.bus.record_size {
            return Err(CacheError::OutOfBounds {
                offset: 0,
                len:    payload.len(),
                size:   self.bus.record_size,
            });
        }
        self.bus
            .region
            .put_bytes(self.pos + STATUS_LEN + KIND_LEN, payload)
    }

    pub fn commit(self) -> Result<(), CacheError> {
        self.bus.region.store_u8_release(self.pos, STATUS_COMMITTED)
    }

    pub fn rollback(self) -> Result<(), CacheError> {
        self.bus.region.store_u8_release(self.pos, STATUS_ROLLED_BACK)
    }
}

/// One committed bus record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    pub kind:    u32,
    pub payload: Vec<u8>,
}

/// Subscriber with an independent cursor. Each reader observes every
/// committed record exactly once.
pub struct BusReader {
    region:      MappedRegion,
    record_size: usize,
    cursor:      usize,
}

impl BusReader {
    pub fn attach<P: AsRef<Path>>(
        path: P,
        size: u64,
        record_size: usize,
    ) -> Result<Self, CacheError> {
        let region = MappedRegion::new(path, size)?;
        Ok(Self { region, record_size, cursor: RECORDS_OFFSET })
    }

    fn entry_size(&self) -> usize {
        STATUS_LEN + KIND_LEN + self.record_size
    }

    /// Wait for the record at the cursor to commit. `Ok(None)` on timeout
    /// (`commitTimeout`), `EndOfBus` once the cursor runs off the ring.
    pub fn poll(&mut self, commit_timeout: Duration) -> Result<Option<BusRecord>, CacheError> {
        let deadline = Instant::now() + commit_timeout;
        loop {
            let entry = self.entry_size();
            if self.cursor + entry > self.region.len() {
                return Err(CacheError::EndOfBus);
            }
            match self.region.load_u8_acquire(self.cursor)? {
                STATUS_COMMITTED => {
                    let kind = self.region.get_u32(self.cursor + STATUS_LEN)?;
                    let payload = self
                        .region
                        .get_bytes(self.cursor + STATUS_LEN + KIND_LEN, self.record_size)?
                        .to_vec();
                    self.cursor += entry;
                    return Ok(Some(BusRecord { kind, payload }));
                }
                STATUS_ROLLED_BACK => {
                    self.cursor += entry;
                }
                _ => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    for _ in 0..POLL_SPINS {
                        std::hint::spin_loop();
                    }
                    std::thread::yield_now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[test]
    fn two_readers_each_observe_a_record_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus");
        let bus = MappedBus::create(&path, 4096, 16).unwrap();

        let mut r1 = BusReader::attach(&path, 4096, 16).unwrap();
        let mut r2 = BusReader::attach(&path, 4096, 16).unwrap();

        bus.publish(0xCAFE, b"update:42").unwrap();

        for r in [&mut r1, &mut r2] {
            let rec = r.poll(TIMEOUT).unwrap().unwrap();
            assert_eq!(rec.kind, 0xCAFE);
            assert_eq!(&rec.payload[..9], b"update:42");
            // Nothing further yet.
            assert_eq!(r.poll(TIMEOUT).unwrap(), None);
        }
    }

    #[test]
    fn rolled_back_records_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus");
        let bus = MappedBus::create(&path, 4096, 8).unwrap();
        let mut reader = BusReader::attach(&path, 4096, 8).unwrap();

        let dead = bus.begin(7).unwrap();
        dead.write_payload(b"junk").unwrap();
        dead.rollback().unwrap();
        bus.publish(9, b"live").unwrap();

        let rec = reader.poll(TIMEOUT).unwrap().unwrap();
        assert_eq!(rec.kind, 9);
        assert_eq!(&rec.payload[..4], b"live");
    }

    #[test]
    fn unpublished_record_times_out_then_commits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus");
        let bus = MappedBus::create(&path, 4096, 8).unwrap();
        let mut reader = BusReader::attach(&path, 4096, 8).unwrap();

        let pending = bus.begin(3).unwrap();
        pending.write_payload(b"slow").unwrap();
        assert_eq!(reader.poll(Duration::from_millis(10)).unwrap(), None);

        pending.commit().unwrap();
        let rec = reader.poll(TIMEOUT).unwrap().unwrap();
        assert_eq!(rec.kind, 3);
    }

    #[test]
    fn exhausted_ring_closes_both_ends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus");
        // Room for exactly two 5+3-byte entries after the 16-byte header.
        let bus = MappedBus::create(&path, 32, 3).unwrap();
        bus.publish(1, b"a").unwrap();
        bus.publish(2, b"b").unwrap();
        assert!(matches!(bus.publish(3, b"c"), Err(CacheError::EndOfBus)));

        let mut reader = BusReader::attach(&path, 32, 3).unwrap();
        assert!(reader.poll(TIMEOUT).unwrap().is_some());
        assert!(reader.poll(TIMEOUT).unwrap().is_some());
        assert!(matches!(reader.poll(TIMEOUT), Err(CacheError::EndOfBus)));
    }

    #[test]
    fn payload_must_fit_record_size() {
        let dir = TempDir::new().unwrap();
        let bus = MappedBus::create(dir.path().join("bus"), 4096, 4).unwrap();
        let pending = bus.begin(1).unwrap();
        assert!(matches!(
            pending.write_payload(b"too long"),
            Err(CacheError::OutOfBounds { .. })
        ));
    }
}

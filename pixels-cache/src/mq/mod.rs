//! Memory-mapped single-writer/multi-reader message ring.
//!
//! Layout over a [`MappedRegion`](crate::mem::MappedRegion):
//! `limit u64 [0..8) | rollover u64 [8..16) | records [16..)`.
//! Each record is `status u8 | type u32 | payload` with a fixed payload
//! capacity, so every entry has the same size and reader cursors advance
//! in lock step with the writer's limit counter.
//!
//! The status byte is the commit point: the writer fills type and payload
//! while it stays unpublished, then release-stores the committed value, so
//! a reader that observes the commit also observes the whole record.

mod reader;
mod writer;

pub use reader::{BusMessage, MappedBusReader};
pub use writer::MappedBusWriter;

pub(crate) const BUS_LIMIT_OFFSET: usize = 0;
pub(crate) const BUS_DATA_OFFSET: usize = 16;

/// Status flags and record metadata preceding each payload.
pub(crate) const STATUS_LEN: usize = 1;
pub(crate) const TYPE_LEN: usize = 4;
pub(crate) const RECORD_HEADER_LEN: usize = STATUS_LEN + TYPE_LEN;

pub(crate) const STATUS_UNPUBLISHED: u8 = 0;
pub(crate) const STATUS_COMMITTED: u8 = 1;
pub(crate) const STATUS_ROLLED_BACK: u8 = 0xFF;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mem::MappedRegion;
    use std::time::Duration;
    use tempfile::TempDir;

    fn bus_region(dir: &TempDir, size: usize) -> (MappedRegion, MappedRegion) {
        let path = dir.path().join("bus");
        let path = path.to_str().unwrap();
        (
            MappedRegion::map(path, size).unwrap(),
            MappedRegion::map(path, size).unwrap(),
        )
    }

    #[test]
    fn test_bus_round_trip_two_readers() {
        let dir = TempDir::new().unwrap();
        let (w, r) = bus_region(&dir, 1024);
        let writer = MappedBusWriter::open(w, 32, false).unwrap();
        let mut r1 = MappedBusReader::open(&r, 32, Duration::from_millis(100));
        let mut r2 = MappedBusReader::open(&r, 32, Duration::from_millis(100));
        assert!(r1.recv().unwrap().is_none());
        writer.write(0xCAFE, b"update:42").unwrap();
        for reader in [&mut r1, &mut r2] {
            let msg = reader.recv().unwrap().unwrap();
            assert_eq!(msg.msg_type, 0xCAFE);
            assert_eq!(msg.payload.len(), 32);
            assert_eq!(&msg.payload[..9], b"update:42");
            assert!(msg.payload[9..].iter().all(|&b| b == 0));
            // observed exactly once.
            assert!(reader.recv().unwrap().is_none());
        }
    }

    #[test]
    fn test_bus_end_of_file() {
        let dir = TempDir::new().unwrap();
        // room for exactly two 8-byte-payload records after the header.
        let (w, _r) = bus_region(&dir, 16 + 2 * (5 + 8));
        let writer = MappedBusWriter::open(w, 8, false).unwrap();
        writer.write(1, b"a").unwrap();
        writer.write(2, b"b").unwrap();
        assert!(matches!(writer.write(3, b"c"), Err(Error::EndOfBus)));
    }

    #[test]
    fn test_bus_payload_too_large() {
        let dir = TempDir::new().unwrap();
        let (w, _r) = bus_region(&dir, 1024);
        let writer = MappedBusWriter::open(w, 4, false).unwrap();
        assert!(writer.write(1, b"12345").is_err());
    }

    #[test]
    fn test_bus_reader_times_out_and_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (w, r) = bus_region(&dir, 1024);
        let writer = MappedBusWriter::open(w, 16, false).unwrap();
        // allocate a slot without committing it: simulate a writer that
        // died between allocation and commit.
        writer.allocate_for_test().unwrap();
        writer.write(7, b"late").unwrap();
        let mut reader = MappedBusReader::open(&r, 16, Duration::from_millis(20));
        // the dead slot is rolled back and skipped; the committed record
        // behind it is still delivered.
        let msg = reader.recv().unwrap().unwrap();
        assert_eq!(msg.msg_type, 7);
        assert_eq!(&msg.payload[..4], b"late");
    }

    #[test]
    fn test_bus_append_reopen() {
        let dir = TempDir::new().unwrap();
        let (w, r) = bus_region(&dir, 1024);
        {
            let writer = MappedBusWriter::open(w, 16, false).unwrap();
            writer.write(1, b"one").unwrap();
        }
        let (w2, _) = bus_region(&dir, 1024);
        let writer = MappedBusWriter::open(w2, 16, true).unwrap();
        writer.write(2, b"two").unwrap();
        let mut reader = MappedBusReader::open(&r, 16, Duration::from_millis(100));
        assert_eq!(reader.recv().unwrap().unwrap().msg_type, 1);
        assert_eq!(reader.recv().unwrap().unwrap().msg_type, 2);
        assert!(reader.recv().unwrap().is_none());
    }
}

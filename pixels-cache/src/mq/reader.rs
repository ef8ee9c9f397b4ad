use crate::error::{Error, Result};
use crate::mem::MappedRegion;
use crate::mq::{
    BUS_DATA_OFFSET, BUS_LIMIT_OFFSET, RECORD_HEADER_LEN, STATUS_COMMITTED, STATUS_LEN,
    STATUS_ROLLED_BACK, STATUS_UNPUBLISHED,
};
use std::time::{Duration, Instant};

/// One committed bus record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

/// Subscribing side of the bus. Each reader keeps an independent cursor, so
/// every subscriber observes every committed record exactly once.
pub struct MappedBusReader<'a> {
    region: &'a MappedRegion,
    record_size: usize,
    entry_size: usize,
    cursor: usize,
    commit_timeout: Duration,
}

impl<'a> MappedBusReader<'a> {
    #[inline]
    pub fn open(
        region: &'a MappedRegion,
        record_size: usize,
        commit_timeout: Duration,
    ) -> MappedBusReader<'a> {
        MappedBusReader {
            region,
            record_size,
            entry_size: RECORD_HEADER_LEN + record_size,
            cursor: BUS_DATA_OFFSET,
            commit_timeout,
        }
    }

    /// Poll for the next committed record.
    ///
    /// Returns `Ok(None)` when the writer has not allocated past this
    /// reader's cursor. When a slot is allocated but never commits within
    /// the timeout, the reader rolls it back so no subscriber waits on it
    /// again, and skips it.
    pub fn recv(&mut self) -> Result<Option<BusMessage>> {
        loop {
            if self.cursor + self.entry_size > self.region.size() {
                return Err(Error::EndOfBus);
            }
            let limit = self.region.get_u64_volatile(BUS_LIMIT_OFFSET)? as usize;
            if limit < self.cursor + self.entry_size {
                return Ok(None);
            }
            match self.await_commit()? {
                STATUS_COMMITTED => {
                    let msg_type = self.region.get_u32(self.cursor + STATUS_LEN)?;
                    let payload = self
                        .region
                        .get_bytes(self.cursor + RECORD_HEADER_LEN, self.record_size)?
                        .to_vec();
                    self.cursor += self.entry_size;
                    return Ok(Some(BusMessage { msg_type, payload }));
                }
                _ => {
                    // rolled back, skip the slot.
                    self.cursor += self.entry_size;
                }
            }
        }
    }

    /// Spin on the status byte of the record under the cursor until it
    /// commits, is rolled back, or the commit timeout passes. On timeout
    /// this reader rolls the slot back itself.
    fn await_commit(&self) -> Result<u8> {
        let start = Instant::now();
        loop {
            match self.region.get_u8_volatile(self.cursor)? {
                STATUS_UNPUBLISHED => {
                    if start.elapsed() >= self.commit_timeout {
                        self.region
                            .cas_u8(self.cursor, STATUS_UNPUBLISHED, STATUS_ROLLED_BACK)?;
                        // re-read: the writer may have won the race.
                        continue;
                    }
                    std::hint::spin_loop();
                    std::thread::yield_now();
                }
                status => return Ok(status),
            }
        }
    }
}

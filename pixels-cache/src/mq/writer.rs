use crate::error::{Error, Result};
use crate::mem::MappedRegion;
use crate::mq::{
    BUS_DATA_OFFSET, BUS_LIMIT_OFFSET, RECORD_HEADER_LEN, STATUS_COMMITTED, STATUS_LEN,
};
use tracing::debug;

/// Publishing side of the bus. One writer per bus file.
pub struct MappedBusWriter {
    region: MappedRegion,
    record_size: usize,
    entry_size: usize,
}

impl MappedBusWriter {
    /// Open the writer over a mapped bus file. `record_size` is the fixed
    /// payload capacity of every record. With `append` the existing limit
    /// is kept (the counter is only seeded when the file is fresh);
    /// otherwise the limit is reset and prior records become unreachable.
    pub fn open(region: MappedRegion, record_size: usize, append: bool) -> Result<MappedBusWriter> {
        if record_size == 0 {
            return Err(Error::InvalidArgument("bus record size must be positive"));
        }
        if append {
            let seeded = region.cas_u64(BUS_LIMIT_OFFSET, 0, BUS_DATA_OFFSET as u64)?;
            debug!(seeded, "bus writer opened in append mode");
        } else {
            region.put_u64_volatile(BUS_LIMIT_OFFSET, BUS_DATA_OFFSET as u64)?;
            debug!("bus writer opened with a fresh limit");
        }
        Ok(MappedBusWriter {
            region,
            record_size,
            entry_size: RECORD_HEADER_LEN + record_size,
        })
    }

    /// Publish one record. The payload must fit the record capacity; short
    /// payloads are zero-padded to the fixed slot size.
    pub fn write(&self, msg_type: u32, payload: &[u8]) -> Result<()> {
        if payload.len() > self.record_size {
            return Err(Error::InvalidArgument("bus payload exceeds record size"));
        }
        let pos = self.allocate()?;
        self.region.put_u32(pos + STATUS_LEN, msg_type)?;
        self.region.put_bytes(pos + RECORD_HEADER_LEN, payload)?;
        let pad = self.record_size - payload.len();
        if pad > 0 {
            self.region
                .put_bytes(pos + RECORD_HEADER_LEN + payload.len(), &vec![0u8; pad])?;
        }
        // commit point: readers spin on this byte.
        self.region.put_u8_volatile(pos, STATUS_COMMITTED)
    }

    /// Claim the next slot. Past the end of the file the bus stays closed
    /// until restarted; the limit counter keeps the overshoot.
    #[inline]
    fn allocate(&self) -> Result<usize> {
        let pos = self
            .region
            .fetch_add_u64(BUS_LIMIT_OFFSET, self.entry_size as u64)? as usize;
        if pos + self.entry_size > self.region.size() {
            debug!(
                pos,
                size = self.region.size(),
                "bus file exhausted, refusing record"
            );
            return Err(Error::EndOfBus);
        }
        Ok(pos)
    }

    #[cfg(test)]
    pub(crate) fn allocate_for_test(&self) -> Result<usize> {
        self.allocate()
    }
}

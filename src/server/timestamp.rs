//! Timestamp and timestamp-batch types with their fixed wire format.

use bytes::{Buf, BufMut, BytesMut};

use serde::{Deserialize, Serialize};

use crate::utils::TsoError;

/// One issued timestamp. `tbe` is the end of the uncertainty window in
/// nanoseconds since the TAI epoch; the window starts at `tse()`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Timestamp {
    pub tbe: u64,
    pub ts_delta: u32,
    pub tso_id: u32,
    pub tbe_ns_step: u16,
}

impl Timestamp {
    /// Start of the uncertainty window.
    pub fn tse(&self) -> u64 {
        self.tbe.saturating_sub(self.ts_delta as u64)
    }
}

/// Byte length of a batch record on the wire.
pub const TIMESTAMP_BATCH_WIRE_LEN: usize = 24;

/// A contiguous run of timestamps issued by one worker in a single response.
/// Entry `i` (0-based) has `tbe = tbe_base + i * tbe_ns_step`.
///
/// Wire format (little-endian):
/// ```text
/// u64 tbe_base_ns
/// u32 ts_delta      (ns)
/// u32 tso_id
/// u16 tbe_ns_step
/// u16 count
/// u32 ttl_ns
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct TimestampBatch {
    pub tbe_base: u64,
    pub ts_delta: u32,
    pub tso_id: u32,
    pub tbe_ns_step: u16,
    pub count: u16,
    pub ttl_ns: u32,
}

impl TimestampBatch {
    /// Materializes entry `i` of the batch.
    pub fn entry(&self, i: u16) -> Option<Timestamp> {
        if i >= self.count {
            return None;
        }
        Some(Timestamp {
            tbe: self.tbe_base + (i as u64) * (self.tbe_ns_step as u64),
            ts_delta: self.ts_delta,
            tso_id: self.tso_id,
            tbe_ns_step: self.tbe_ns_step,
        })
    }

    /// Expands the batch into its timestamps.
    pub fn expand(&self) -> Vec<Timestamp> {
        (0..self.count).map(|i| self.entry(i).unwrap()).collect()
    }

    /// `tbe` of the last timestamp in the batch.
    pub fn last_tbe(&self) -> u64 {
        debug_assert!(self.count > 0);
        self.tbe_base
            + (self.count as u64 - 1) * (self.tbe_ns_step as u64)
    }

    /// Appends the wire encoding of this batch to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.tbe_base);
        buf.put_u32_le(self.ts_delta);
        buf.put_u32_le(self.tso_id);
        buf.put_u16_le(self.tbe_ns_step);
        buf.put_u16_le(self.count);
        buf.put_u32_le(self.ttl_ns);
    }

    /// Decodes a batch from its wire encoding.
    pub fn decode(mut bytes: &[u8]) -> Result<TimestampBatch, TsoError> {
        if bytes.len() < TIMESTAMP_BATCH_WIRE_LEN {
            return Err(TsoError::msg(format!(
                "batch record too short: {} bytes",
                bytes.len()
            )));
        }
        Ok(TimestampBatch {
            tbe_base: bytes.get_u64_le(),
            ts_delta: bytes.get_u32_le(),
            tso_id: bytes.get_u32_le(),
            tbe_ns_step: bytes.get_u16_le(),
            count: bytes.get_u16_le(),
            ttl_ns: bytes.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod timestamp_tests {
    use super::*;

    #[test]
    fn batch_expansion() {
        let batch = TimestampBatch {
            tbe_base: 100_000_000_001,
            ts_delta: 8_000_000,
            tso_id: 1,
            tbe_ns_step: 4,
            count: 3,
            ttl_ns: 8_000_000,
        };
        let tss = batch.expand();
        assert_eq!(tss.len(), 3);
        assert_eq!(tss[0].tbe, 100_000_000_001);
        assert_eq!(tss[1].tbe, 100_000_000_005);
        assert_eq!(tss[2].tbe, 100_000_000_009);
        assert_eq!(tss[0].tse(), 100_000_000_001 - 8_000_000);
        assert_eq!(batch.last_tbe(), 100_000_000_009);
        assert_eq!(batch.entry(3), None);
    }

    #[test]
    fn wire_roundtrip() -> Result<(), TsoError> {
        let batch = TimestampBatch {
            tbe_base: u64::MAX - 17,
            ts_delta: 123_456,
            tso_id: 42,
            tbe_ns_step: 8,
            count: 999,
            ttl_ns: 8_000_000,
        };
        let mut buf = BytesMut::new();
        batch.encode(&mut buf);
        assert_eq!(buf.len(), TIMESTAMP_BATCH_WIRE_LEN);
        assert_eq!(TimestampBatch::decode(&buf)?, batch);
        Ok(())
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let batch = TimestampBatch {
            tbe_base: 0x0102030405060708,
            ts_delta: 0x0A0B0C0D,
            tso_id: 0x10203040,
            tbe_ns_step: 0x1122,
            count: 0x3344,
            ttl_ns: 0x55667788,
        };
        let mut buf = BytesMut::new();
        batch.encode(&mut buf);
        assert_eq!(
            &buf[..],
            &[
                0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // tbe_base
                0x0D, 0x0C, 0x0B, 0x0A, // ts_delta
                0x40, 0x30, 0x20, 0x10, // tso_id
                0x22, 0x11, // tbe_ns_step
                0x44, 0x33, // count
                0x88, 0x77, 0x66, 0x55, // ttl_ns
            ]
        );
    }

    #[test]
    fn decode_short_record_fails() {
        assert!(TimestampBatch::decode(&[0u8; 10]).is_err());
    }
}

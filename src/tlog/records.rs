//! Typed TLog records and their frame codec

use serde::{Deserialize, Serialize};

use super::{TLogError, TLogResult};
use crate::types::{ClusterAddress, ClusterLocationAndHash};

/// Record tags on disk
const TAG_LOCATION: u8 = 0;
const TAG_SCO_CRC: u8 = 1;
const TAG_TLOG_CRC: u8 = 2;
const TAG_SYNC: u8 = 3;

/// One typed entry of a transaction log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TLogRecord {
    /// A cluster write: address and where its data now lives
    Location {
        /// Cluster address written
        ca: ClusterAddress,
        /// Location and content hash of the written cluster
        clh: ClusterLocationAndHash,
    },
    /// Running CRC over all Location records since the previous boundary
    ScoCrc(u32),
    /// Final CRC over every byte of the TLog before this record
    TLogCrc(u32),
    /// No-op barrier
    Sync,
}

impl TLogRecord {
    fn tag(&self) -> u8 {
        match self {
            TLogRecord::Location { .. } => TAG_LOCATION,
            TLogRecord::ScoCrc(_) => TAG_SCO_CRC,
            TLogRecord::TLogCrc(_) => TAG_TLOG_CRC,
            TLogRecord::Sync => TAG_SYNC,
        }
    }

    fn payload(&self) -> TLogResult<Vec<u8>> {
        let payload = match self {
            TLogRecord::Location { ca, clh } => bincode::serialize(&(ca, clh)),
            TLogRecord::ScoCrc(crc) | TLogRecord::TLogCrc(crc) => bincode::serialize(crc),
            TLogRecord::Sync => Ok(Vec::new()),
        };
        payload.map_err(|e| TLogError::Decode(e.to_string()))
    }

    /// Encode the record into its on-disk frame
    pub fn encode(&self) -> TLogResult<Vec<u8>> {
        let payload = self.payload()?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[self.tag()]);
        hasher.update(&payload);
        let crc = hasher.finalize();

        let len = (1 + payload.len() + 4) as u32;
        let mut frame = Vec::with_capacity(4 + len as usize);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.push(self.tag());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    /// Decode one frame from `bytes` at `offset`
    ///
    /// Returns the record and the offset of the next frame. `offset` is
    /// only used for error reporting beyond the slice arithmetic.
    pub fn decode(bytes: &[u8], offset: u64) -> TLogResult<(TLogRecord, usize)> {
        if bytes.len() < 4 {
            return Err(TLogError::TruncatedFrame(offset));
        }
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if len < 5 || bytes.len() < 4 + len {
            return Err(TLogError::TruncatedFrame(offset));
        }
        let tag = bytes[4];
        let payload = &bytes[5..4 + len - 4];
        let stored_crc = u32::from_le_bytes([
            bytes[4 + len - 4],
            bytes[4 + len - 3],
            bytes[4 + len - 2],
            bytes[4 + len - 1],
        ]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[tag]);
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Err(TLogError::RecordCrcMismatch(offset));
        }

        let record = match tag {
            TAG_LOCATION => {
                let (ca, clh) = bincode::deserialize(payload)
                    .map_err(|e| TLogError::Decode(e.to_string()))?;
                TLogRecord::Location { ca, clh }
            }
            TAG_SCO_CRC => TLogRecord::ScoCrc(
                bincode::deserialize(payload).map_err(|e| TLogError::Decode(e.to_string()))?,
            ),
            TAG_TLOG_CRC => TLogRecord::TLogCrc(
                bincode::deserialize(payload).map_err(|e| TLogError::Decode(e.to_string()))?,
            ),
            TAG_SYNC => TLogRecord::Sync,
            other => return Err(TLogError::Decode(format!("unknown record tag {other}"))),
        };
        Ok((record, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CloneGeneration, ClusterHash, ClusterLocation, SCOName, SCONumber,
    };

    fn location_record() -> TLogRecord {
        TLogRecord::Location {
            ca: ClusterAddress(99),
            clh: ClusterLocationAndHash::new(
                ClusterLocation::new(SCOName::new(SCONumber(4), CloneGeneration(1)), 17),
                ClusterHash::of(b"payload"),
            ),
        }
    }

    #[test]
    fn frame_roundtrip() {
        for record in [
            location_record(),
            TLogRecord::ScoCrc(0xdeadbeef),
            TLogRecord::TLogCrc(0x1234),
            TLogRecord::Sync,
        ] {
            let frame = record.encode().unwrap();
            let (decoded, consumed) = TLogRecord::decode(&frame, 0).unwrap();
            assert_eq!(decoded, record);
            assert_eq!(consumed, frame.len());
        }
    }

    #[test]
    fn bitflip_is_detected() {
        let mut frame = location_record().encode().unwrap();
        let idx = frame.len() / 2;
        frame[idx] ^= 0x40;
        assert!(matches!(
            TLogRecord::decode(&frame, 0),
            Err(TLogError::RecordCrcMismatch(_))
        ));
    }

    #[test]
    fn short_frame_is_truncated() {
        let frame = location_record().encode().unwrap();
        assert!(matches!(
            TLogRecord::decode(&frame[..frame.len() - 2], 0),
            Err(TLogError::TruncatedFrame(_))
        ));
    }

    proptest::proptest! {
        #[test]
        fn any_location_record_roundtrips(
            ca in proptest::prelude::any::<u64>(),
            sco in 1u32..=u32::MAX,
            generation in proptest::prelude::any::<u8>(),
            offset in 0u32..65536,
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..128),
        ) {
            let record = TLogRecord::Location {
                ca: ClusterAddress(ca),
                clh: ClusterLocationAndHash::new(
                    ClusterLocation::new(
                        SCOName::new(SCONumber(sco), CloneGeneration(generation)),
                        offset,
                    ),
                    ClusterHash::of(&payload),
                ),
            };
            let frame = record.encode().unwrap();
            let (decoded, consumed) = TLogRecord::decode(&frame, 0).unwrap();
            proptest::prop_assert_eq!(decoded, record);
            proptest::prop_assert_eq!(consumed, frame.len());
        }
    }
}

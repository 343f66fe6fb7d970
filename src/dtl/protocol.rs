//! DTL wire protocol
//!
//! Length-prefixed bincode frames over TCP: `[len: u32 LE][bincode body]`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{DtlError, DtlResult};
use crate::types::{ClusterAddress, ClusterLocationAndHash, OwnerTag, SCONumber, VolumeId};

/// Upper bound on a single frame, guards against garbage length prefixes
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// One mirrored write record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtlEntry {
    /// Cluster address written
    pub ca: ClusterAddress,
    /// Location and hash the write was logged with
    pub clh: ClusterLocationAndHash,
    /// The cluster payload itself
    pub data: Vec<u8>,
}

/// Client-to-server messages
#[derive(Debug, Serialize, Deserialize)]
pub enum DtlRequest {
    /// Announce a volume and its owner generation on a fresh connection
    Register {
        /// Volume being mirrored
        volume: VolumeId,
        /// Owner generation of the writer
        owner_tag: OwnerTag,
    },
    /// Mirror a batch of write records
    Append {
        /// Volume being mirrored
        volume: VolumeId,
        /// Owner generation of the writer
        owner_tag: OwnerTag,
        /// SCO the records belong to
        sco: SCONumber,
        /// The records
        entries: Vec<DtlEntry>,
    },
    /// Barrier: everything appended so far must be durable on reply
    Flush {
        /// Volume to flush
        volume: VolumeId,
    },
    /// Drop entries of SCOs at or below the given number
    ClearUpTo {
        /// Volume to trim
        volume: VolumeId,
        /// Highest SCO number now covered by the backend
        sco: SCONumber,
    },
    /// Stream entries back in append order
    Recover {
        /// Volume to recover
        volume: VolumeId,
        /// Only SCOs at or above this number are wanted
        from_sco: SCONumber,
    },
    /// Forget a volume entirely
    Drop {
        /// Volume to forget
        volume: VolumeId,
    },
}

/// Server-to-client messages
#[derive(Debug, Serialize, Deserialize)]
pub enum DtlResponse {
    /// Request applied
    Ok,
    /// Request rejected, the server has seen a newer owner
    Fenced {
        /// Highest owner tag seen
        highest: OwnerTag,
    },
    /// One chunk of a recovery stream
    Chunk {
        /// Entries in append order, tagged with their SCO
        entries: Vec<(SCONumber, DtlEntry)>,
        /// Whether this is the final chunk
        done: bool,
    },
    /// Request failed
    Failed(String),
}

/// Write one frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> DtlResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message).map_err(|e| DtlError::Protocol(e.to_string()))?;
    writer
        .write_all(&(body.len() as u32).to_le_bytes())
        .await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` on clean end of stream
pub async fn read_frame<R, T>(reader: &mut R) -> DtlResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(DtlError::Protocol(format!("oversized frame: {len} bytes")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let message = bincode::deserialize(&body).map_err(|e| DtlError::Protocol(e.to_string()))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CloneGeneration, ClusterHash, ClusterLocation, SCOName};

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let request = DtlRequest::Append {
            volume: VolumeId::new("vol"),
            owner_tag: OwnerTag(3),
            sco: SCONumber(1),
            entries: vec![DtlEntry {
                ca: ClusterAddress(0),
                clh: ClusterLocationAndHash::new(
                    ClusterLocation::new(SCOName::new(SCONumber(1), CloneGeneration::BASE), 0),
                    ClusterHash::of(b"data"),
                ),
                data: b"data".to_vec(),
            }],
        };
        write_frame(&mut a, &request).await.unwrap();
        drop(a);

        let read: DtlRequest = read_frame(&mut b).await.unwrap().unwrap();
        match read {
            DtlRequest::Append { sco, entries, .. } => {
                assert_eq!(sco, SCONumber(1));
                assert_eq!(entries[0].data, b"data");
            }
            other => panic!("unexpected request {other:?}"),
        }
        let eof: Option<DtlRequest> = read_frame(&mut b).await.unwrap();
        assert!(eof.is_none());
    }
}

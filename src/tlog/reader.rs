//! Forward-only TLog readers

use std::path::PathBuf;

use super::records::TLogRecord;
use super::{TLogError, TLogResult};
use crate::backend::BackendHandle;
use crate::types::{ClusterAddress, ClusterLocationAndHash, TLogId};

/// Typed-record callbacks for log iteration
///
/// Only the callbacks a processor cares about need overriding; checksums
/// are already verified by the reader when a callback fires.
pub trait TLogProcessor {
    /// A cluster write record
    fn process_loc(&mut self, ca: ClusterAddress, clh: ClusterLocationAndHash) -> TLogResult<()>;

    /// An SCO boundary record
    fn process_sco_crc(&mut self, _crc: u32) -> TLogResult<()> {
        Ok(())
    }

    /// The final record of a sealed log
    fn process_tlog_crc(&mut self, _crc: u32) -> TLogResult<()> {
        Ok(())
    }

    /// A sync barrier
    fn process_sync(&mut self) -> TLogResult<()> {
        Ok(())
    }
}

/// Reads and verifies a single TLog byte stream
pub struct TLogReader {
    bytes: Vec<u8>,
    pos: usize,
    total_crc: crc32fast::Hasher,
    sco_crc: crc32fast::Hasher,
    open_sco: Option<crate::types::SCOName>,
    saw_final: bool,
}

impl TLogReader {
    /// Wrap a log's bytes for iteration
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            pos: 0,
            total_crc: crc32fast::Hasher::new(),
            sco_crc: crc32fast::Hasher::new(),
            open_sco: None,
            saw_final: false,
        }
    }

    /// Whether the final TLog-CRC record has been read and verified
    pub fn saw_final_crc(&self) -> bool {
        self.saw_final
    }

    /// Byte offset of the next unread frame
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read, verify and return the next record
    ///
    /// Checksums are verified as they stream past: record CRCs on every
    /// frame, SCO-CRCs against the Location records they cover, and the
    /// final TLog-CRC against every preceding byte.
    pub fn next_record(&mut self) -> TLogResult<Option<TLogRecord>> {
        if self.pos == self.bytes.len() {
            return Ok(None);
        }
        let (record, consumed) = TLogRecord::decode(&self.bytes[self.pos..], self.pos as u64)?;
        if self.saw_final {
            return Err(TLogError::RecordAfterFinalCrc);
        }
        let frame = &self.bytes[self.pos..self.pos + consumed];
        match record {
            TLogRecord::Location { clh, .. } => {
                // A writer seals every SCO with its CRC before moving on.
                if let Some(open) = self.open_sco {
                    if open != clh.location.sco {
                        return Err(TLogError::ScoSwitchWithoutScoCrc);
                    }
                }
                self.open_sco = Some(clh.location.sco);
                self.sco_crc.update(frame);
            }
            TLogRecord::ScoCrc(stored) => {
                let computed =
                    std::mem::replace(&mut self.sco_crc, crc32fast::Hasher::new()).finalize();
                if stored != computed {
                    return Err(TLogError::ScoCrcMismatch { stored, computed });
                }
                self.open_sco = None;
            }
            TLogRecord::TLogCrc(stored) => {
                let computed = self.total_crc.clone().finalize();
                if stored != computed {
                    return Err(TLogError::WrongCrc { stored, computed });
                }
                self.saw_final = true;
            }
            TLogRecord::Sync => {}
        }
        self.total_crc.update(frame);
        self.pos += consumed;
        Ok(Some(record))
    }

    /// Drive a processor over the remaining records
    pub fn process<P: TLogProcessor>(&mut self, processor: &mut P) -> TLogResult<()> {
        while let Some(record) = self.next_record()? {
            match record {
                TLogRecord::Location { ca, clh } => processor.process_loc(ca, clh)?,
                TLogRecord::ScoCrc(crc) => processor.process_sco_crc(crc)?,
                TLogRecord::TLogCrc(crc) => processor.process_tlog_crc(crc)?,
                TLogRecord::Sync => processor.process_sync()?,
            }
        }
        Ok(())
    }

    /// Verify a sealed log end to end
    ///
    /// Fails with [`TLogError::WithoutFinalCrc`] if the log has no final
    /// record, or the specific checksum error encountered.
    pub fn verify_sealed(bytes: Vec<u8>) -> TLogResult<()> {
        let mut reader = TLogReader::new(bytes);
        while reader.next_record()?.is_some() {}
        if !reader.saw_final_crc() {
            return Err(TLogError::WithoutFinalCrc);
        }
        Ok(())
    }
}

/// Result of scanning the current (open) TLog after an unclean shutdown
#[derive(Debug, Clone)]
pub struct OpenTLogScan {
    /// Byte length of the valid prefix, ending at the last SCO boundary
    pub boundary_offset: usize,
    /// Location records inside the valid prefix
    pub stable: Vec<(ClusterAddress, ClusterLocationAndHash)>,
    /// Location records past the last boundary; lost unless the DTL has them
    pub tail: Vec<(ClusterAddress, ClusterLocationAndHash)>,
    /// Whether the log turned out to be sealed after all
    pub sealed: bool,
}

/// Scan an open TLog, stopping at the first invalid byte
///
/// The valid prefix ends at the last verified SCO-CRC boundary; everything
/// after it is reported as tail.
pub fn scan_open_tlog(bytes: Vec<u8>) -> OpenTLogScan {
    let mut reader = TLogReader::new(bytes);
    let mut scan = OpenTLogScan {
        boundary_offset: 0,
        stable: Vec::new(),
        tail: Vec::new(),
        sealed: false,
    };
    let mut segment: Vec<(ClusterAddress, ClusterLocationAndHash)> = Vec::new();
    loop {
        match reader.next_record() {
            Ok(Some(TLogRecord::Location { ca, clh })) => segment.push((ca, clh)),
            Ok(Some(TLogRecord::ScoCrc(_))) => {
                scan.stable.append(&mut segment);
                scan.boundary_offset = reader.position();
            }
            Ok(Some(TLogRecord::TLogCrc(_))) => {
                scan.stable.append(&mut segment);
                scan.boundary_offset = reader.position();
                scan.sealed = true;
            }
            Ok(Some(TLogRecord::Sync)) => {}
            Ok(None) => break,
            Err(_) => break,
        }
    }
    scan.tail = segment;
    scan
}

/// Where TLog bytes can be found
#[derive(Clone)]
pub struct TLogSource {
    local_dir: Option<PathBuf>,
    backend: Option<BackendHandle>,
}

impl TLogSource {
    /// Logs available both locally and on the backend
    pub fn new(local_dir: Option<PathBuf>, backend: Option<BackendHandle>) -> Self {
        Self { local_dir, backend }
    }

    /// Backend-only source, used for backend restarts
    pub fn backend_only(backend: BackendHandle) -> Self {
        Self {
            local_dir: None,
            backend: Some(backend),
        }
    }

    /// Fetch a log's bytes, preferring the local copy
    pub async fn fetch(&self, id: TLogId) -> TLogResult<Option<Vec<u8>>> {
        if let Some(dir) = &self.local_dir {
            let path = dir.join(id.object_name());
            if path.is_file() {
                return Ok(Some(std::fs::read(path)?));
            }
        }
        if let Some(backend) = &self.backend {
            match backend.get(&id.object_name()).await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

/// Chains multiple TLogs into one record stream
///
/// Processing stops cleanly before the first log that is missing both
/// locally and on the backend; the processed ids are returned so the
/// caller can tell a complete replay from a truncated one.
pub struct CombinedTLogReader {
    source: TLogSource,
    ids: Vec<TLogId>,
}

impl CombinedTLogReader {
    /// Create a combined reader over an ordered id chain
    pub fn new(source: TLogSource, ids: Vec<TLogId>) -> Self {
        Self { source, ids }
    }

    /// Drive a processor over the chained records
    ///
    /// Every log but the last must be sealed; the last may be open when
    /// `allow_open_tail` is set (local restart of the current log).
    pub async fn process<P: TLogProcessor>(
        &self,
        processor: &mut P,
        allow_open_tail: bool,
    ) -> TLogResult<Vec<TLogId>> {
        let mut processed = Vec::new();
        for (i, id) in self.ids.iter().enumerate() {
            let Some(bytes) = self.source.fetch(*id).await? else {
                break;
            };
            let is_last = i + 1 == self.ids.len();
            let mut reader = TLogReader::new(bytes);
            reader.process(processor)?;
            if !reader.saw_final_crc() && !(is_last && allow_open_tail) {
                return Err(TLogError::WithoutFinalCrc);
            }
            processed.push(*id);
        }
        Ok(processed)
    }
}

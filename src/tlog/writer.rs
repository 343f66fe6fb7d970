//! Buffered TLog writer

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::records::TLogRecord;
use super::TLogResult;
use crate::types::{ClusterAddress, ClusterLocationAndHash, TLogId};

/// Writes one transaction log
///
/// Frames are buffered in memory and pushed to the file on sync barriers,
/// SCO boundaries and seal. Two running CRCs are maintained: one over every
/// Location frame since the last SCO boundary, one over every byte of the
/// log, which becomes the final TLog-CRC on seal.
pub struct TLogWriter {
    id: TLogId,
    path: PathBuf,
    file: File,
    buffer: Vec<u8>,
    total_crc: crc32fast::Hasher,
    sco_crc: crc32fast::Hasher,
    entries: u64,
}

impl TLogWriter {
    /// Create a fresh TLog in `dir` under its deterministic filename
    pub fn create(dir: impl AsRef<Path>, id: TLogId) -> TLogResult<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(id.object_name());
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            id,
            path,
            file,
            buffer: Vec::new(),
            total_crc: crc32fast::Hasher::new(),
            sco_crc: crc32fast::Hasher::new(),
            entries: 0,
        })
    }

    /// Reopen an unsealed log after an unclean shutdown
    ///
    /// The file is truncated to its last valid SCO-CRC boundary and the
    /// running total CRC is rebuilt over the surviving prefix; the SCO CRC
    /// starts fresh, which is exactly the hasher state at a boundary.
    /// Returns the writer and the scan of what survived and what was cut.
    pub fn reopen(
        dir: impl AsRef<Path>,
        id: TLogId,
    ) -> TLogResult<(Self, crate::tlog::reader::OpenTLogScan)> {
        let path = dir.as_ref().join(id.object_name());
        let bytes = std::fs::read(&path)?;
        let scan = crate::tlog::reader::scan_open_tlog(bytes.clone());

        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(scan.boundary_offset as u64)?;
        file.sync_all()?;
        let mut file = file;
        use std::io::Seek;
        file.seek(std::io::SeekFrom::End(0))?;

        let mut total_crc = crc32fast::Hasher::new();
        total_crc.update(&bytes[..scan.boundary_offset]);

        let entries = scan.stable.len() as u64;
        Ok((
            Self {
                id,
                path,
                file,
                buffer: Vec::new(),
                total_crc,
                sco_crc: crc32fast::Hasher::new(),
                entries,
            },
            scan,
        ))
    }

    /// The log's id
    pub fn id(&self) -> TLogId {
        self.id
    }

    /// The log's file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of Location records appended so far
    pub fn entries(&self) -> u64 {
        self.entries
    }

    fn push_frame(&mut self, frame: &[u8]) {
        self.total_crc.update(frame);
        self.buffer.extend_from_slice(frame);
    }

    /// Append a Location record
    pub fn append_location(
        &mut self,
        ca: ClusterAddress,
        clh: ClusterLocationAndHash,
    ) -> TLogResult<()> {
        let frame = TLogRecord::Location { ca, clh }.encode()?;
        self.sco_crc.update(&frame);
        self.push_frame(&frame);
        self.entries += 1;
        Ok(())
    }

    /// Seal the current SCO boundary with its running CRC
    ///
    /// Returns the CRC and flushes the buffer so a crash never loses a
    /// completed SCO boundary.
    pub fn append_sco_crc(&mut self) -> TLogResult<u32> {
        let crc = std::mem::replace(&mut self.sco_crc, crc32fast::Hasher::new()).finalize();
        let frame = TLogRecord::ScoCrc(crc).encode()?;
        self.push_frame(&frame);
        self.flush()?;
        self.file.sync_data()?;
        Ok(crc)
    }

    /// Append a Sync barrier, flush and fdatasync
    pub fn sync(&mut self) -> TLogResult<()> {
        let frame = TLogRecord::Sync.encode()?;
        self.push_frame(&frame);
        self.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Write buffered frames to the file without syncing
    pub fn flush(&mut self) -> TLogResult<()> {
        if !self.buffer.is_empty() {
            self.file.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Seal the log: append the final TLog-CRC, flush and sync
    ///
    /// Consumes the writer; a sealed log is immutable.
    pub fn seal(mut self) -> TLogResult<u32> {
        let crc = self.total_crc.clone().finalize();
        let frame = TLogRecord::TLogCrc(crc).encode()?;
        self.buffer.extend_from_slice(&frame);
        self.flush()?;
        self.file.sync_all()?;
        Ok(crc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlog::reader::TLogReader;
    use crate::types::{
        CloneGeneration, ClusterHash, ClusterLocation, SCOName, SCONumber,
    };
    use uuid::Uuid;

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("berth-tlog-{}", Uuid::new_v4()))
    }

    fn clh(n: u32, offset: u32) -> ClusterLocationAndHash {
        ClusterLocationAndHash::new(
            ClusterLocation::new(SCOName::new(SCONumber(n), CloneGeneration::BASE), offset),
            ClusterHash::of(&offset.to_le_bytes()),
        )
    }

    #[test]
    fn written_log_reads_back_sealed() {
        let dir = scratch();
        let id = TLogId::new();
        let mut writer = TLogWriter::create(&dir, id).unwrap();
        writer.append_location(ClusterAddress(0), clh(1, 0)).unwrap();
        writer.append_location(ClusterAddress(1), clh(1, 1)).unwrap();
        writer.append_sco_crc().unwrap();
        assert_eq!(writer.entries(), 2);
        let path = writer.path().to_path_buf();
        writer.seal().unwrap();

        let bytes = std::fs::read(path).unwrap();
        let mut reader = TLogReader::new(bytes);
        let mut locations = 0;
        while let Some(record) = reader.next_record().unwrap() {
            if matches!(record, crate::tlog::TLogRecord::Location { .. }) {
                locations += 1;
            }
        }
        assert_eq!(locations, 2);
        assert!(reader.saw_final_crc());

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn truncated_seal_fails_crc() {
        let dir = scratch();
        let id = TLogId::new();
        let mut writer = TLogWriter::create(&dir, id).unwrap();
        writer.append_location(ClusterAddress(0), clh(1, 0)).unwrap();
        writer.append_sco_crc().unwrap();
        let path = writer.path().to_path_buf();
        writer.seal().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a location payload byte, leaving the final record intact.
        bytes[10] ^= 0x01;
        let mut reader = TLogReader::new(bytes);
        let mut saw_error = false;
        loop {
            match reader.next_record() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    saw_error = true;
                    break;
                }
            }
        }
        assert!(saw_error);

        std::fs::remove_dir_all(dir).ok();
    }
}

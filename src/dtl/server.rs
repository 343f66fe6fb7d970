//! DTL server
//!
//! Accepts append streams per volume, persists them to an optional spill
//! directory and streams them back for recovery. Appends carrying an owner
//! tag below the highest seen for the volume are fenced.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use super::protocol::{read_frame, write_frame, DtlEntry, DtlRequest, DtlResponse};
use super::DtlResult;
use crate::types::{OwnerTag, SCONumber, VolumeId};

/// Entries per recovery chunk
const RECOVER_CHUNK: usize = 128;

#[derive(Default)]
struct VolumeLog {
    highest_tag: OwnerTag,
    entries: Vec<(SCONumber, DtlEntry)>,
}

/// The peer-side DTL service
pub struct DtlServer {
    volumes: DashMap<VolumeId, VolumeLog>,
    spill_dir: Option<PathBuf>,
}

impl DtlServer {
    /// Create a server, reloading spilled volumes if a directory is given
    pub fn new(spill_dir: Option<PathBuf>) -> DtlResult<Arc<Self>> {
        let server = Arc::new(Self {
            volumes: DashMap::new(),
            spill_dir,
        });
        server.reload_spill()?;
        Ok(server)
    }

    /// Bind a listener and start serving
    ///
    /// Returns the bound address so tests can bind to port 0.
    pub async fn bind(
        self: &Arc<Self>,
        addr: &str,
    ) -> DtlResult<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let server = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        log::debug!("dtl connection from {peer}");
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            if let Err(e) = server.serve_connection(stream).await {
                                log::warn!("dtl connection error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("dtl accept failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok((local, handle))
    }

    async fn serve_connection(&self, mut stream: TcpStream) -> DtlResult<()> {
        while let Some(request) = read_frame::<_, DtlRequest>(&mut stream).await? {
            match request {
                DtlRequest::Recover { volume, from_sco } => {
                    self.stream_recovery(&mut stream, &volume, from_sco).await?;
                }
                other => {
                    let response = self.handle(other);
                    write_frame(&mut stream, &response).await?;
                }
            }
        }
        Ok(())
    }

    fn handle(&self, request: DtlRequest) -> DtlResponse {
        match request {
            DtlRequest::Register { volume, owner_tag } => {
                let mut entry = self.volumes.entry(volume).or_default();
                if owner_tag < entry.highest_tag {
                    return DtlResponse::Fenced {
                        highest: entry.highest_tag,
                    };
                }
                entry.highest_tag = owner_tag;
                DtlResponse::Ok
            }
            DtlRequest::Append {
                volume,
                owner_tag,
                sco,
                entries,
            } => {
                let mut log = self.volumes.entry(volume.clone()).or_default();
                if owner_tag < log.highest_tag {
                    return DtlResponse::Fenced {
                        highest: log.highest_tag,
                    };
                }
                log.highest_tag = owner_tag;
                for entry in entries {
                    log.entries.push((sco, entry));
                }
                drop(log);
                if let Err(e) = self.spill(&volume) {
                    return DtlResponse::Failed(format!("spill failed: {e}"));
                }
                DtlResponse::Ok
            }
            DtlRequest::Flush { volume } => match self.spill(&volume) {
                Ok(()) => DtlResponse::Ok,
                Err(e) => DtlResponse::Failed(format!("flush failed: {e}")),
            },
            DtlRequest::ClearUpTo { volume, sco } => {
                if let Some(mut log) = self.volumes.get_mut(&volume) {
                    log.entries.retain(|(s, _)| *s > sco);
                }
                match self.spill(&volume) {
                    Ok(()) => DtlResponse::Ok,
                    Err(e) => DtlResponse::Failed(format!("spill failed: {e}")),
                }
            }
            DtlRequest::Drop { volume } => {
                self.volumes.remove(&volume);
                if let Some(dir) = &self.spill_dir {
                    std::fs::remove_file(dir.join(Self::spill_name(&volume))).ok();
                }
                DtlResponse::Ok
            }
            DtlRequest::Recover { .. } => DtlResponse::Failed("recover is streamed".to_string()),
        }
    }

    async fn stream_recovery(
        &self,
        stream: &mut TcpStream,
        volume: &VolumeId,
        from_sco: SCONumber,
    ) -> DtlResult<()> {
        let entries: Vec<(SCONumber, DtlEntry)> = self
            .volumes
            .get(volume)
            .map(|log| {
                log.entries
                    .iter()
                    .filter(|(sco, _)| *sco >= from_sco)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut chunks = entries.chunks(RECOVER_CHUNK).peekable();
        if chunks.peek().is_none() {
            write_frame(
                stream,
                &DtlResponse::Chunk {
                    entries: Vec::new(),
                    done: true,
                },
            )
            .await?;
            return Ok(());
        }
        while let Some(chunk) = chunks.next() {
            write_frame(
                stream,
                &DtlResponse::Chunk {
                    entries: chunk.to_vec(),
                    done: chunks.peek().is_none(),
                },
            )
            .await?;
        }
        Ok(())
    }

    fn spill_name(volume: &VolumeId) -> String {
        format!("{}.dtl", volume.0)
    }

    fn spill(&self, volume: &VolumeId) -> std::io::Result<()> {
        let Some(dir) = &self.spill_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        let Some(log) = self.volumes.get(volume) else {
            return Ok(());
        };
        let body = bincode::serialize(&(log.highest_tag, &log.entries))
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let path = dir.join(Self::spill_name(volume));
        let tmp = path.with_extension("dtl.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }

    fn reload_spill(&self) -> DtlResult<()> {
        let Some(dir) = &self.spill_dir else {
            return Ok(());
        };
        if !dir.is_dir() {
            return Ok(());
        }
        for dirent in std::fs::read_dir(dir)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            let Some(volume) = name.strip_suffix(".dtl") else {
                continue;
            };
            let bytes = std::fs::read(dirent.path())?;
            let (highest_tag, entries): (OwnerTag, Vec<(SCONumber, DtlEntry)>) =
                bincode::deserialize(&bytes)
                    .map_err(|e| super::DtlError::Protocol(e.to_string()))?;
            self.volumes.insert(
                VolumeId::new(volume),
                VolumeLog {
                    highest_tag,
                    entries,
                },
            );
            log::info!("dtl reloaded spilled volume {volume}");
        }
        Ok(())
    }

    /// Number of entries held for a volume, for tests and introspection
    pub fn entry_count(&self, volume: &VolumeId) -> usize {
        self.volumes.get(volume).map(|l| l.entries.len()).unwrap_or(0)
    }

    /// Highest owner tag seen for a volume
    pub fn highest_tag(&self, volume: &VolumeId) -> Option<OwnerTag> {
        self.volumes.get(volume).map(|l| l.highest_tag)
    }
}

//! DTL client
//!
//! Owned by a volume. A background task holds the TCP connection and
//! drains a bounded command queue; when the queue is full, appends wait,
//! which is the backpressure the write path feels. In Synchronous mode an
//! append resolves only once the peer acknowledged durable receipt; in
//! Asynchronous mode it resolves when the record is accepted by the queue.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use super::protocol::{read_frame, write_frame, DtlEntry, DtlRequest, DtlResponse};
use super::{DtlError, DtlResult};
use crate::types::{OwnerTag, SCONumber, VolumeId};

/// Bound of the client-side in-flight queue
const QUEUE_DEPTH: usize = 256;

/// Append acknowledgement discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtlMode {
    /// Writer returns once the record is queued client-side
    Asynchronous,
    /// Writer waits for the peer's durable acknowledgement
    Synchronous,
}

/// DTL condition of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtlState {
    /// No peer configured; durability comes from the local TLog fsync only
    Standalone,
    /// Mirroring normally in the given mode
    Ok(DtlMode),
    /// Peer configured but unreachable; I/O continues without the mirror
    Degraded,
    /// Peer reattached, backlog still draining
    Ketchup,
}

/// Peer address and mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlClientConfig {
    /// Peer host
    pub host: String,
    /// Peer port
    pub port: u16,
    /// Acknowledgement discipline
    pub mode: DtlMode,
}

enum Command {
    Append {
        sco: SCONumber,
        entries: Vec<DtlEntry>,
        ack: Option<oneshot::Sender<DtlResult<()>>>,
    },
    Flush {
        ack: oneshot::Sender<DtlResult<()>>,
    },
    ClearUpTo {
        sco: SCONumber,
    },
}

struct Shared {
    volume: VolumeId,
    state: Mutex<DtlState>,
    fenced: AtomicBool,
}

/// Client half of the DTL
pub struct DtlClient {
    shared: Arc<Shared>,
    config: Mutex<Option<DtlClientConfig>>,
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    owner_tag: Mutex<OwnerTag>,
}

impl DtlClient {
    /// Create a detached client; the volume starts Standalone
    pub fn new(volume: VolumeId, owner_tag: OwnerTag) -> Self {
        Self {
            shared: Arc::new(Shared {
                volume,
                state: Mutex::new(DtlState::Standalone),
                fenced: AtomicBool::new(false),
            }),
            config: Mutex::new(None),
            sender: Mutex::new(None),
            owner_tag: Mutex::new(owner_tag),
        }
    }

    /// Current DTL state
    pub fn state(&self) -> DtlState {
        *self.shared.state.lock()
    }

    /// Current configuration
    pub fn config(&self) -> Option<DtlClientConfig> {
        self.config.lock().clone()
    }

    /// Whether the peer fenced this owner
    pub fn is_fenced(&self) -> bool {
        self.shared.fenced.load(Ordering::SeqCst)
    }

    /// Adopt a new owner tag after a restart under new ownership
    pub fn set_owner_tag(&self, tag: OwnerTag) {
        *self.owner_tag.lock() = tag;
    }

    /// Attach, detach or reconfigure the peer; idempotent
    ///
    /// `None` detaches and the volume runs Standalone. On a connection
    /// failure the configuration is kept and the state is Degraded, so the
    /// checker can retry later.
    pub async fn configure(&self, config: Option<DtlClientConfig>) -> DtlResult<()> {
        // Stop the current writer task, if any.
        self.sender.lock().take();

        let Some(config) = config else {
            *self.config.lock() = None;
            *self.shared.state.lock() = DtlState::Standalone;
            return Ok(());
        };
        *self.config.lock() = Some(config.clone());

        match self.connect(&config).await {
            Ok(sender) => {
                *self.sender.lock() = Some(sender);
                *self.shared.state.lock() = DtlState::Ok(config.mode);
                Ok(())
            }
            Err(e) => {
                *self.shared.state.lock() = DtlState::Degraded;
                Err(e)
            }
        }
    }

    async fn connect(&self, config: &DtlClientConfig) -> DtlResult<mpsc::Sender<Command>> {
        let addr = format!("{}:{}", config.host, config.port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| DtlError::PeerUnavailable(format!("{addr}: {e}")))?;

        let owner_tag = *self.owner_tag.lock();
        write_frame(
            &mut stream,
            &DtlRequest::Register {
                volume: self.shared.volume.clone(),
                owner_tag,
            },
        )
        .await?;
        match read_frame::<_, DtlResponse>(&mut stream).await? {
            Some(DtlResponse::Ok) => {}
            Some(DtlResponse::Fenced { highest }) => {
                self.shared.fenced.store(true, Ordering::SeqCst);
                return Err(DtlError::Fenced { highest });
            }
            other => {
                return Err(DtlError::Protocol(format!(
                    "unexpected register response: {other:?}"
                )))
            }
        }

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(writer_task(stream, rx, shared, owner_tag));
        Ok(tx)
    }

    fn sender(&self) -> Option<mpsc::Sender<Command>> {
        self.sender.lock().clone()
    }

    /// Mirror a batch of write records
    ///
    /// Standalone and Degraded volumes accept the call as a no-op: the
    /// write path keeps going without the mirror, as configured.
    pub async fn append(&self, sco: SCONumber, entries: Vec<DtlEntry>) -> DtlResult<()> {
        let mode = match self.state() {
            DtlState::Ok(mode) => mode,
            DtlState::Ketchup => DtlMode::Synchronous,
            DtlState::Standalone | DtlState::Degraded => return Ok(()),
        };
        let Some(sender) = self.sender() else {
            return Ok(());
        };
        match mode {
            DtlMode::Synchronous => {
                let (ack_tx, ack_rx) = oneshot::channel();
                sender
                    .send(Command::Append {
                        sco,
                        entries,
                        ack: Some(ack_tx),
                    })
                    .await
                    .map_err(|_| self.degrade("queue closed"))?;
                ack_rx.await.map_err(|_| self.degrade("writer stopped"))?
            }
            DtlMode::Asynchronous => sender
                .send(Command::Append {
                    sco,
                    entries,
                    ack: None,
                })
                .await
                .map_err(|_| self.degrade("queue closed")),
        }
    }

    /// Barrier: resolve once everything appended so far is durable
    pub async fn flush(&self) -> DtlResult<()> {
        let Some(sender) = self.sender() else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        sender
            .send(Command::Flush { ack: ack_tx })
            .await
            .map_err(|_| self.degrade("queue closed"))?;
        ack_rx.await.map_err(|_| self.degrade("writer stopped"))?
    }

    /// Let the peer drop entries the backend now covers
    pub async fn clear_up_to(&self, sco: SCONumber) -> DtlResult<()> {
        let Some(sender) = self.sender() else {
            return Ok(());
        };
        sender
            .send(Command::ClearUpTo { sco })
            .await
            .map_err(|_| self.degrade("queue closed"))
    }

    /// Stream entries back from the peer for recovery
    pub async fn recover(&self, from_sco: SCONumber) -> DtlResult<Vec<(SCONumber, DtlEntry)>> {
        let config = self.config().ok_or(DtlError::NotConfigured)?;
        let addr = format!("{}:{}", config.host, config.port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| DtlError::PeerUnavailable(format!("{addr}: {e}")))?;
        write_frame(
            &mut stream,
            &DtlRequest::Recover {
                volume: self.shared.volume.clone(),
                from_sco,
            },
        )
        .await?;

        let mut all = Vec::new();
        loop {
            match read_frame::<_, DtlResponse>(&mut stream).await? {
                Some(DtlResponse::Chunk { mut entries, done }) => {
                    all.append(&mut entries);
                    if done {
                        return Ok(all);
                    }
                }
                Some(DtlResponse::Failed(msg)) => return Err(DtlError::Protocol(msg)),
                other => {
                    return Err(DtlError::Protocol(format!(
                        "unexpected recovery response: {other:?}"
                    )))
                }
            }
        }
    }

    /// Transition Degraded -> Ketchup, used while the backlog resyncs
    pub fn begin_catchup(&self) {
        *self.shared.state.lock() = DtlState::Ketchup;
    }

    /// Transition Ketchup -> Ok once the backlog has drained
    pub fn finish_catchup(&self) {
        let mode = self
            .config
            .lock()
            .as_ref()
            .map(|c| c.mode)
            .unwrap_or(DtlMode::Asynchronous);
        *self.shared.state.lock() = DtlState::Ok(mode);
    }

    fn degrade(&self, reason: &str) -> DtlError {
        log::warn!("dtl for {} degraded: {reason}", self.shared.volume);
        *self.shared.state.lock() = DtlState::Degraded;
        DtlError::PeerUnavailable(reason.to_string())
    }
}

async fn writer_task(
    mut stream: TcpStream,
    mut rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    owner_tag: OwnerTag,
) {
    while let Some(command) = rx.recv().await {
        let result = match command {
            Command::Append { sco, entries, ack } => {
                let outcome = roundtrip(
                    &mut stream,
                    &DtlRequest::Append {
                        volume: shared.volume.clone(),
                        owner_tag,
                        sco,
                        entries,
                    },
                    &shared,
                )
                .await;
                if let Some(ack) = ack {
                    let failed = outcome.is_err();
                    ack.send(outcome).ok();
                    if failed {
                        break;
                    }
                    continue;
                }
                outcome
            }
            Command::Flush { ack } => {
                let outcome = roundtrip(
                    &mut stream,
                    &DtlRequest::Flush {
                        volume: shared.volume.clone(),
                    },
                    &shared,
                )
                .await;
                let failed = outcome.is_err();
                ack.send(outcome).ok();
                if failed {
                    break;
                }
                continue;
            }
            Command::ClearUpTo { sco } => {
                roundtrip(
                    &mut stream,
                    &DtlRequest::ClearUpTo {
                        volume: shared.volume.clone(),
                        sco,
                    },
                    &shared,
                )
                .await
            }
        };
        if result.is_err() {
            break;
        }
    }
}

async fn roundtrip(
    stream: &mut TcpStream,
    request: &DtlRequest,
    shared: &Shared,
) -> DtlResult<()> {
    let fail = |shared: &Shared, err: DtlError| {
        log::warn!("dtl writer for {} failed: {err}", shared.volume);
        *shared.state.lock() = DtlState::Degraded;
        err
    };
    write_frame(stream, request)
        .await
        .map_err(|e| fail(shared, e))?;
    match read_frame::<_, DtlResponse>(stream)
        .await
        .map_err(|e| fail(shared, e))?
    {
        Some(DtlResponse::Ok) => Ok(()),
        Some(DtlResponse::Fenced { highest }) => {
            shared.fenced.store(true, Ordering::SeqCst);
            *shared.state.lock() = DtlState::Degraded;
            Err(DtlError::Fenced { highest })
        }
        Some(DtlResponse::Failed(msg)) => Err(fail(shared, DtlError::Protocol(msg))),
        other => Err(fail(
            shared,
            DtlError::Protocol(format!("unexpected response {other:?}")),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtl::server::DtlServer;
    use crate::types::{
        CloneGeneration, ClusterAddress, ClusterHash, ClusterLocation,
        ClusterLocationAndHash, SCOName,
    };

    fn entry(ca: u64, byte: u8) -> DtlEntry {
        let data = vec![byte; 64];
        DtlEntry {
            ca: ClusterAddress(ca),
            clh: ClusterLocationAndHash::new(
                ClusterLocation::new(SCOName::new(SCONumber(1), CloneGeneration::BASE), ca as u32),
                ClusterHash::of(&data),
            ),
            data,
        }
    }

    #[tokio::test]
    async fn sync_append_and_recover() {
        let server = DtlServer::new(None).unwrap();
        let (addr, _handle) = server.bind("127.0.0.1:0").await.unwrap();

        let client = DtlClient::new(VolumeId::new("vol"), OwnerTag(1));
        client
            .configure(Some(DtlClientConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
                mode: DtlMode::Synchronous,
            }))
            .await
            .unwrap();
        assert_eq!(client.state(), DtlState::Ok(DtlMode::Synchronous));

        client
            .append(SCONumber(1), vec![entry(0, 0xaa), entry(1, 0xbb)])
            .await
            .unwrap();
        client.flush().await.unwrap();
        assert_eq!(server.entry_count(&VolumeId::new("vol")), 2);

        let recovered = client.recover(SCONumber(0)).await.unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].1.data, vec![0xaa; 64]);
    }

    #[tokio::test]
    async fn stale_owner_is_fenced() {
        let server = DtlServer::new(None).unwrap();
        let (addr, _handle) = server.bind("127.0.0.1:0").await.unwrap();
        let config = |mode| DtlClientConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            mode,
        };

        let new_owner = DtlClient::new(VolumeId::new("vol"), OwnerTag(5));
        new_owner
            .configure(Some(config(DtlMode::Synchronous)))
            .await
            .unwrap();

        let stale = DtlClient::new(VolumeId::new("vol"), OwnerTag(4));
        let err = stale
            .configure(Some(config(DtlMode::Synchronous)))
            .await
            .unwrap_err();
        assert!(matches!(err, DtlError::Fenced { highest: OwnerTag(5) }));
        assert!(stale.is_fenced());
    }

    #[tokio::test]
    async fn clear_up_to_trims_entries() {
        let server = DtlServer::new(None).unwrap();
        let (addr, _handle) = server.bind("127.0.0.1:0").await.unwrap();

        let client = DtlClient::new(VolumeId::new("vol"), OwnerTag(1));
        client
            .configure(Some(DtlClientConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
                mode: DtlMode::Synchronous,
            }))
            .await
            .unwrap();

        client.append(SCONumber(1), vec![entry(0, 1)]).await.unwrap();
        client.append(SCONumber(2), vec![entry(1, 2)]).await.unwrap();
        client.clear_up_to(SCONumber(1)).await.unwrap();
        client.flush().await.unwrap();
        assert_eq!(server.entry_count(&VolumeId::new("vol")), 1);
    }

    #[tokio::test]
    async fn unreachable_peer_degrades() {
        let client = DtlClient::new(VolumeId::new("vol"), OwnerTag(1));
        let err = client
            .configure(Some(DtlClientConfig {
                host: "127.0.0.1".to_string(),
                // Reserved port nothing listens on in the test environment.
                port: 1,
                mode: DtlMode::Asynchronous,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, DtlError::PeerUnavailable(_)));
        assert_eq!(client.state(), DtlState::Degraded);

        // Appends keep succeeding as no-ops while degraded.
        client.append(SCONumber(1), vec![entry(0, 1)]).await.unwrap();

        client.configure(None).await.unwrap();
        assert_eq!(client.state(), DtlState::Standalone);
    }
}

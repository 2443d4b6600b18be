//! One-sided remote-write channel between replicas.
//!
//! Models the write-capable memory channel on top of the TCP transport: the
//! region is "registered" by advertising its base address and an access key
//! in a one-time descriptor exchange, after which the primary pushes raw
//! byte ranges that a backup-side apply task copies straight into its
//! mirrored region, with no request handler involved.
//!
//! The exchange is asymmetric by role. The primary accepts the peer
//! connection, reads the peer's descriptor, readies the local channel and
//! only then sends its own descriptor; the backup connects, sends first,
//! then reads. Both ends therefore know the peer descriptor before either
//! side can issue a write.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::net;
use crate::region::Region;
use crate::table::Patch;

/// Channel registration record, exchanged exactly once per peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub node_id: u32,
    pub channel: u32,
    pub initial_sequence: u32,
    pub region_base: u64,
    pub access_key: u32,
}

impl ChannelDescriptor {
    fn new(node_id: u32, channel: u32, region: &Region) -> Self {
        Self {
            node_id,
            channel,
            // Low 24 bits, as sequence numbers are seeded on real fabrics.
            initial_sequence: rand::random::<u32>() & 0x00ff_ffff,
            region_base: region.base_addr(),
            access_key: rand::random::<u32>(),
        }
    }
}

const WRITE_HEADER_BYTES: usize = 20;

struct WriteHeader {
    sequence: u32,
    access_key: u32,
    remote_addr: u64,
    len: u32,
}

impl WriteHeader {
    fn to_bytes(&self) -> [u8; WRITE_HEADER_BYTES] {
        let mut buf = [0u8; WRITE_HEADER_BYTES];
        buf[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        buf[4..8].copy_from_slice(&self.access_key.to_le_bytes());
        buf[8..16].copy_from_slice(&self.remote_addr.to_le_bytes());
        buf[16..20].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; WRITE_HEADER_BYTES]) -> Self {
        Self {
            sequence: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            access_key: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            remote_addr: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            len: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        }
    }
}

struct WriteOp {
    offset: u64,
    bytes: Vec<u8>,
    done: oneshot::Sender<Result<()>>,
}

struct PeerChannel {
    remote: ChannelDescriptor,
    tx: async_channel::Sender<WriteOp>,
}

/// Pending completions for one `replicate_all` call. Keeping these on a
/// handle rather than in shared channel state means concurrent handlers can
/// never consume each other's completions.
pub struct Flight {
    completions: Vec<oneshot::Receiver<Result<()>>>,
}

/// Primary-side replication state: one write channel per backup,
/// established once per server lifetime and read-mostly thereafter.
pub struct Replicator {
    region: Arc<Region>,
    peers: Vec<PeerChannel>,
}

impl Replicator {
    /// Primary role: accept one channel connection per expected peer on the
    /// main listener, before any client is served.
    pub async fn accept_peers(
        listener: &TcpListener,
        expected: usize,
        region: Arc<Region>,
        node_id: u32,
    ) -> Result<Self> {
        let mut peers = Vec::with_capacity(expected);
        for channel in 0..expected as u32 {
            let (mut sock, addr) = listener.accept().await?;
            let (remote, local, tx, rx) = async {
                let payload = net::read_frame(&mut sock)
                    .await?
                    .ok_or_else(|| anyhow!("peer closed during descriptor exchange"))?;
                let remote: ChannelDescriptor = bincode::deserialize(&payload)?;
                // Receive-ready before the peer learns our descriptor: the
                // local channel state exists from here on.
                let local = ChannelDescriptor::new(node_id, channel, &region);
                let (tx, rx) = async_channel::unbounded();
                net::write_frame(&mut sock, &bincode::serialize(&local)?).await?;
                Ok::<_, anyhow::Error>((remote, local, tx, rx))
            }
            .await
            .with_context(|| format!("channel setup with peer {addr} failed"))?;
            tracing::info!(
                peer = %addr,
                remote_node = remote.node_id,
                "replication channel ready"
            );
            tokio::spawn(writer_loop(sock, addr, rx, local, remote.clone()));
            peers.push(PeerChannel { remote, tx });
        }
        Ok(Self { region, peers })
    }

    /// Backup role: connect to the primary, register the local region, then
    /// run the apply task that lands the primary's writes in the region.
    pub async fn join(
        primary: SocketAddr,
        region: Arc<Region>,
        node_id: u32,
    ) -> Result<JoinHandle<()>> {
        let mut sock = net::connect(primary)
            .await
            .with_context(|| format!("connecting replication channel to {primary}"))?;

        let local = ChannelDescriptor::new(node_id, 0, &region);
        net::write_frame(&mut sock, &bincode::serialize(&local)?).await?;
        let payload = net::read_frame(&mut sock)
            .await?
            .ok_or_else(|| anyhow!("primary closed during descriptor exchange"))?;
        let remote: ChannelDescriptor = bincode::deserialize(&payload)?;
        tracing::info!(
            primary = %primary,
            remote_node = remote.node_id,
            "registered region with primary"
        );

        Ok(tokio::spawn(apply_loop(sock, region, local, remote)))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Post one remote write per peer covering `patch`. Local region bytes
    /// are snapshotted at post time; the identical layout on every replica
    /// makes the local offset valid remotely. A post failure is reported;
    /// the already-applied local mutation is never rolled back.
    pub fn replicate_all(&self, patch: Patch) -> Result<Flight> {
        let bytes = self.region.copy_out(patch.offset, patch.len);
        let mut completions = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let (done, rx) = oneshot::channel();
            let op = WriteOp {
                offset: patch.offset as u64,
                bytes: bytes.clone(),
                done,
            };
            peer.tx
                .try_send(op)
                .map_err(|_| anyhow!("write channel to node {} is down", peer.remote.node_id))?;
            completions.push(rx);
        }
        Ok(Flight { completions })
    }

    /// Block until every write posted in `flight` has completed; any
    /// non-success completion surfaces as an error.
    pub async fn wait_all(&self, flight: Flight) -> Result<()> {
        for rx in flight.completions {
            match rx.await {
                Ok(res) => res?,
                Err(_) => anyhow::bail!("write channel closed before completion"),
            }
        }
        Ok(())
    }
}

async fn writer_loop(
    mut sock: TcpStream,
    addr: SocketAddr,
    rx: async_channel::Receiver<WriteOp>,
    local: ChannelDescriptor,
    remote: ChannelDescriptor,
) {
    let mut sequence = local.initial_sequence;
    while let Ok(op) = rx.recv().await {
        let header = WriteHeader {
            sequence,
            access_key: remote.access_key,
            remote_addr: remote.region_base + op.offset,
            len: op.bytes.len() as u32,
        };
        sequence = sequence.wrapping_add(1);

        let res = post(&mut sock, &header, &op.bytes).await;
        let failed = res.is_err();
        if failed {
            tracing::error!(peer = %addr, "remote write failed: {:?}", res);
        } else {
            tracing::trace!(
                peer = %addr,
                offset = op.offset,
                len = op.bytes.len(),
                "remote write completed"
            );
        }
        let _ = op.done.send(res);
        if failed {
            // The channel is not renegotiated; pending and future posts to
            // this peer fail through the closed queue.
            break;
        }
    }
}

async fn post(sock: &mut TcpStream, header: &WriteHeader, bytes: &[u8]) -> Result<()> {
    sock.write_all(&header.to_bytes()).await?;
    sock.write_all(bytes).await?;
    Ok(())
}

/// Backup-side apply task: land every incoming write directly in the
/// region. The request-handling path is never involved.
async fn apply_loop(
    mut sock: TcpStream,
    region: Arc<Region>,
    local: ChannelDescriptor,
    remote: ChannelDescriptor,
) {
    let mut expected = remote.initial_sequence;
    loop {
        let mut head_buf = [0u8; WRITE_HEADER_BYTES];
        match net::read_exact_checked(&mut sock, &mut head_buf).await {
            Ok(true) => {}
            Ok(false) => {
                // Last chance to compare replica contents by hand.
                let hash = region.content_hash();
                tracing::info!(
                    hash = ?&hash[..4],
                    "replication channel closed by primary"
                );
                return;
            }
            Err(e) => {
                tracing::error!("replication channel read failed: {e}");
                return;
            }
        }
        let header = WriteHeader::from_bytes(&head_buf);

        if header.access_key != local.access_key {
            tracing::error!(
                got = header.access_key,
                "remote write carries a foreign access key; dropping channel"
            );
            return;
        }
        if header.sequence != expected {
            tracing::warn!(
                got = header.sequence,
                expected,
                "remote write out of sequence"
            );
            expected = header.sequence;
        }
        expected = expected.wrapping_add(1);

        let mut payload = vec![0u8; header.len as usize];
        match net::read_exact_checked(&mut sock, &mut payload).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("primary hung up mid-write");
                return;
            }
            Err(e) => {
                tracing::error!("replication channel read failed: {e}");
                return;
            }
        }

        let offset = match header.remote_addr.checked_sub(local.region_base) {
            Some(off) if off as usize + payload.len() <= region.len() => off as usize,
            _ => {
                tracing::error!(
                    addr = header.remote_addr,
                    len = header.len,
                    "remote write outside the registered region; dropping channel"
                );
                return;
            }
        };
        region.copy_in(offset, &payload);
    }
}

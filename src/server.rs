//! Multi-client server loop and per-connection request handling.
//!
//! A connection carries exactly one request/reply cycle: read one fixed
//! record, dispatch under the per-key lock, write one reply, and for a
//! successful primary PUT push the reported patches to every backup in
//! order, holding the key lock until the last completion lands.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

use crate::config::{ReplicationMode, Role, ServerConfig, TableVariant};
use crate::locks::KeyLocks;
use crate::net::{self, Code, Message};
use crate::rdma::Replicator;
use crate::region::Region;
use crate::table::{ArrayTable, Key, LinkedTable, Mutation, PutOutcome, Table};

struct Shared {
    role: Role,
    mode: ReplicationMode,
    table: Arc<dyn Table>,
    locks: KeyLocks,
    repl: Option<Replicator>,
}

pub struct Server {
    cfg: ServerConfig,
    listener: tokio::net::TcpListener,
    table: Arc<dyn Table>,
    region: Arc<Region>,
}

impl Server {
    /// Allocate the table and bind the listener. Failures here are fatal
    /// startup errors.
    pub async fn bind(cfg: ServerConfig) -> Result<Server> {
        cfg.validate()?;

        let (table, region): (Arc<dyn Table>, Arc<Region>) = match cfg.variant {
            TableVariant::Chained => {
                let t =
                    LinkedTable::create_with_width(cfg.bucket_count, cfg.capacity, cfg.slot_width)
                        .context("creating chained table")?;
                if cfg.preload {
                    t.preload()?;
                }
                let region = t.shared_region();
                (Arc::new(t), region)
            }
            TableVariant::Array => {
                let t = ArrayTable::create_with_width(cfg.bucket_count, cfg.capacity, cfg.slot_width)
                    .context("creating array table")?;
                if cfg.preload {
                    t.preload()?;
                }
                let region = t.shared_region();
                (Arc::new(t), region)
            }
        };

        let listener = net::listen(cfg.listen)
            .await
            .with_context(|| format!("binding {}", cfg.listen))?;

        tracing::info!(
            role = ?cfg.role,
            listen = %listener.local_addr()?,
            region_bytes = region.len(),
            "table region allocated"
        );

        Ok(Server {
            cfg,
            listener,
            table,
            region,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Establish replication channels, then accept clients forever.
    pub async fn serve(self) -> Result<()> {
        let repl = match self.cfg.role {
            Role::Primary if !self.cfg.peers.is_empty() => {
                tracing::info!(
                    backups = self.cfg.peers.len(),
                    "waiting for backup channel registrations"
                );
                Some(
                    Replicator::accept_peers(
                        &self.listener,
                        self.cfg.peers.len(),
                        Arc::clone(&self.region),
                        self.cfg.node_id,
                    )
                    .await?,
                )
            }
            Role::Primary => None,
            Role::Backup => {
                // The apply task runs for the server's lifetime; its handle
                // is intentionally not awaited.
                let _apply =
                    Replicator::join(self.cfg.peers[0], Arc::clone(&self.region), self.cfg.node_id)
                        .await?;
                None
            }
        };

        let shared = Arc::new(Shared {
            role: self.cfg.role,
            mode: self.cfg.mode,
            table: self.table,
            locks: KeyLocks::new(),
            repl,
        });
        let pool = Arc::new(Semaphore::new(self.cfg.workers));

        tracing::info!("serving requests");
        loop {
            let (sock, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    continue;
                }
            };
            let Ok(permit) = Arc::clone(&pool).acquire_owned().await else {
                return Ok(());
            };
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                if let Err(e) = handle_client(sock, &shared).await {
                    tracing::warn!(peer = %peer, "connection error: {e}");
                }
                drop(permit);
            });
        }
    }
}

async fn handle_client(mut sock: TcpStream, shared: &Shared) -> Result<()> {
    // A short or failed read terminates the connection with no reply.
    let Some(req) = net::read_message(&mut sock).await? else {
        return Ok(());
    };
    tracing::debug!(?req, "from client");

    let reply = if !req.key_in_domain() {
        Message {
            key: req.key,
            value: req.value,
            code: Code::Error,
        }
    } else {
        match req.code {
            Code::Put if shared.role == Role::Primary => {
                return handle_put(sock, shared, req).await;
            }
            // A backup never mutates its table on behalf of a client.
            Code::Put => Message {
                key: req.key,
                value: req.value,
                code: Code::Error,
            },
            Code::Get => handle_get(shared, req).await,
            _ => Message {
                key: req.key,
                value: req.value,
                code: Code::Error,
            },
        }
    };

    tracing::debug!(?reply, "to client");
    net::write_message(&mut sock, &reply).await
}

async fn handle_get(shared: &Shared, req: Message) -> Message {
    let key = req.key as Key;
    let _guard = shared.locks.read(key).await;
    match shared.table.get(key) {
        Some(value) => Message {
            key: req.key,
            value,
            code: Code::Success,
        },
        None => Message {
            key: req.key,
            value: req.value,
            code: Code::NotFound,
        },
    }
}

async fn handle_put(mut sock: TcpStream, shared: &Shared, req: Message) -> Result<()> {
    let key = req.key as Key;

    // Held across the table mutation AND replication: a same-key GET cannot
    // observe a locally-mutated-but-unpushed slot, and two same-key PUTs
    // cannot race on link fields.
    let _guard = shared.locks.write(key).await;

    let (code, mutation) = match shared.table.put(key, req.value) {
        Ok(PutOutcome::Stored(m)) => (Code::Success, Some(m)),
        Ok(PutOutcome::Full) => (Code::Full, None),
        Err(e) => {
            tracing::warn!(key = req.key, "put failed: {e}");
            (Code::Error, None)
        }
    };
    let mut reply = Message {
        key: req.key,
        value: req.value,
        code,
    };

    match shared.mode {
        ReplicationMode::RespondThenReplicate => {
            // Client-visible success means "accepted by the primary".
            tracing::debug!(?reply, "to client");
            net::write_message(&mut sock, &reply).await?;
            if let (Some(m), Some(repl)) = (mutation, &shared.repl) {
                if let Err(e) = replicate(repl, m).await {
                    // Already answered; nothing corrective to do for this
                    // client. The local mutation stands.
                    tracing::error!(key = req.key, "replication failed: {e}");
                }
            }
        }
        ReplicationMode::ReplicateThenRespond => {
            if let (Some(m), Some(repl)) = (mutation, &shared.repl) {
                if let Err(e) = replicate(repl, m).await {
                    tracing::error!(key = req.key, "replication failed: {e}");
                    reply.code = Code::Error;
                }
            }
            tracing::debug!(?reply, "to client");
            net::write_message(&mut sock, &reply).await?;
        }
    }
    Ok(())
}

/// Push a mutation's patches in order: element content must be resident on
/// every backup before the link that makes it reachable.
async fn replicate(repl: &Replicator, m: Mutation) -> Result<()> {
    let flight = repl.replicate_all(m.slot)?;
    repl.wait_all(flight).await?;
    if let Some(link) = m.link {
        let flight = repl.replicate_all(link)?;
        repl.wait_all(flight).await?;
    }
    Ok(())
}

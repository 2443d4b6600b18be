//! Server and client configuration.

use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::table::DEFAULT_SLOT_WIDTH;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Backup,
}

/// When a successful primary PUT is acknowledged relative to replication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Reply first, then push patches: lowest client latency, backups are
    /// eventually consistent. The default.
    RespondThenReplicate,
    /// Push and await all patches before replying.
    ReplicateThenRespond,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableVariant {
    /// Linked elements with a shared free list; insertions patch content
    /// then link.
    Chained,
    /// Fixed rows with occupancy flags; every put is a single patch.
    Array,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub role: Role,
    pub listen: SocketAddr,
    /// For a primary: one entry per backup. For a backup: the primary.
    pub peers: Vec<SocketAddr>,
    pub node_id: u32,
    pub bucket_count: usize,
    /// Chained: total element capacity. Array: capacity per bucket row.
    pub capacity: usize,
    pub slot_width: usize,
    pub variant: TableVariant,
    pub workers: usize,
    pub mode: ReplicationMode,
    pub preload: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            role: Role::Primary,
            listen: "127.0.0.1:4700".parse().unwrap(),
            peers: Vec::new(),
            node_id: 0,
            bucket_count: 32,
            capacity: 1000,
            slot_width: DEFAULT_SLOT_WIDTH,
            variant: TableVariant::Chained,
            workers: 5,
            mode: ReplicationMode::RespondThenReplicate,
            preload: false,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("worker pool must have at least one slot"));
        }
        if self.role == Role::Backup && self.peers.len() != 1 {
            return Err(anyhow!("a backup needs exactly one peer: the primary"));
        }
        Ok(())
    }

    /// Parse server argv (without the program name).
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut cfg = Self::default();
        let mut listen_set = false;
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--primary" => {
                    cfg.role = Role::Primary;
                    i += 1;
                }
                "--backup" => {
                    cfg.role = Role::Backup;
                    i += 1;
                }
                "--listen" => {
                    cfg.listen = flag_value(args, i, "--listen")?.parse()?;
                    listen_set = true;
                    i += 2;
                }
                "--peer" => {
                    cfg.peers.push(flag_value(args, i, "--peer")?.parse()?);
                    i += 2;
                }
                "--node-id" => {
                    cfg.node_id = flag_value(args, i, "--node-id")?.parse()?;
                    i += 2;
                }
                "--buckets" => {
                    cfg.bucket_count = flag_value(args, i, "--buckets")?.parse()?;
                    i += 2;
                }
                "--capacity" => {
                    cfg.capacity = flag_value(args, i, "--capacity")?.parse()?;
                    i += 2;
                }
                "--slot-width" => {
                    cfg.slot_width = flag_value(args, i, "--slot-width")?.parse()?;
                    i += 2;
                }
                "--array" => {
                    cfg.variant = TableVariant::Array;
                    i += 1;
                }
                "--workers" => {
                    cfg.workers = flag_value(args, i, "--workers")?.parse()?;
                    i += 2;
                }
                "--replicate-first" => {
                    cfg.mode = ReplicationMode::ReplicateThenRespond;
                    i += 1;
                }
                "--preload" => {
                    cfg.preload = true;
                    i += 1;
                }
                other => return Err(anyhow!("unknown server flag {other}")),
            }
        }
        if !listen_set {
            return Err(anyhow!("--listen is required"));
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// First entry is the primary; the rest are backups.
    pub servers: Vec<SocketAddr>,
    pub ops: usize,
    pub put_percent: u8,
    /// Emit a throughput/latency sample every this many operations.
    pub sample_every: usize,
    pub csv: Option<PathBuf>,
    /// Check PUT replies against a local shadow table. Only meaningful when
    /// this client is the sole writer.
    pub verify: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            ops: 1000,
            put_percent: 5,
            sample_every: 100,
            csv: None,
            verify: false,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(anyhow!("at least one --server is required"));
        }
        if self.put_percent > 100 {
            return Err(anyhow!("--put-percent must be 0..=100"));
        }
        if self.sample_every == 0 {
            return Err(anyhow!("--sample must be positive"));
        }
        Ok(())
    }

    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut cfg = Self::default();
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--server" => {
                    cfg.servers.push(flag_value(args, i, "--server")?.parse()?);
                    i += 2;
                }
                "--ops" => {
                    cfg.ops = flag_value(args, i, "--ops")?.parse()?;
                    i += 2;
                }
                "--put-percent" => {
                    cfg.put_percent = flag_value(args, i, "--put-percent")?.parse()?;
                    i += 2;
                }
                "--sample" => {
                    cfg.sample_every = flag_value(args, i, "--sample")?.parse()?;
                    i += 2;
                }
                "--csv" => {
                    cfg.csv = Some(flag_value(args, i, "--csv")?.into());
                    i += 2;
                }
                "--verify" => {
                    cfg.verify = true;
                    i += 1;
                }
                other => return Err(anyhow!("unknown client flag {other}")),
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{flag} needs a value"))
}

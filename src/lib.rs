//! mirrorkv: a primary-backup replicated in-memory key-value store.
//!
//! The primary serves GET/PUT over plain TCP connections, mutating a
//! fixed-layout hash table that lives in one contiguous memory region.
//! Every mutation is tracked as byte-range patches, which the primary
//! pushes through one-sided write channels straight into each backup's
//! mirrored region; backups never see the writes on their request path.
//! Per-key reader/writer locks serialize same-key operations across the
//! whole mutate-reply-replicate cycle while unrelated keys proceed in
//! parallel.

pub mod client;
pub mod config;
pub mod locks;
pub mod net;
pub mod rdma;
pub mod region;
pub mod server;
pub mod table;

pub use config::{ClientConfig, ReplicationMode, Role, ServerConfig, TableVariant};
pub use net::{Code, Message};
pub use region::Region;
pub use server::Server;
pub use table::{ArrayTable, Key, LinkedTable, Mutation, Patch, PutOutcome, Table, Value};

//! Client workload driver.
//!
//! Runs a fixed number of operations against a replica set: PUTs go to the
//! primary, GETs to a uniformly chosen server, one connection per
//! operation. Periodically samples throughput/latency and can write the
//! samples out as CSV. A failed operation is recorded and skipped, never
//! retried.

use anyhow::{Context, Result};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::ClientConfig;
use crate::net::{self, Code, Message};
use crate::table::{Key, LinkedTable, PutOutcome, Table};

#[derive(Clone, Copy, Debug)]
pub struct Sample {
    pub requests: usize,
    pub latency_ms: f64,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub completed: usize,
    pub failed: usize,
    pub puts: usize,
    pub gets: usize,
    /// Reply disagreements found by `--verify`.
    pub mismatches: usize,
    pub samples: Vec<Sample>,
    pub elapsed_ms: f64,
}

impl Stats {
    pub fn throughput_ops_per_ms(&self) -> f64 {
        if self.elapsed_ms > 0.0 {
            self.completed as f64 / self.elapsed_ms
        } else {
            0.0
        }
    }
}

pub async fn run(cfg: &ClientConfig) -> Result<Stats> {
    cfg.validate()?;

    // Shadow table for reply verification. Its geometry must match the
    // server's for Full parity, and it is only meaningful when this client
    // is the sole writer; GETs are not checked for exactly that reason.
    let shadow = if cfg.verify {
        Some(LinkedTable::create(32, 1000)?)
    } else {
        None
    };

    let mut stats = Stats::default();
    let mut rng = rand::thread_rng();
    let started = Instant::now();
    let mut window = Instant::now();

    for i in 0..cfg.ops {
        if i % cfg.sample_every == 0 && i != 0 {
            stats.samples.push(Sample {
                requests: i,
                latency_ms: window.elapsed().as_secs_f64() * 1000.0,
            });
            window = Instant::now();
        }

        let key: Key = rng.gen();
        let is_put = rng.gen_range(0u32..100) < cfg.put_percent as u32;
        let (request, server) = if is_put {
            stats.puts += 1;
            let value = rng.gen_range(0..i32::MAX);
            (
                Message {
                    key: key as u32,
                    value,
                    code: Code::Put,
                },
                cfg.servers[0],
            )
        } else {
            stats.gets += 1;
            (
                Message {
                    key: key as u32,
                    value: -1,
                    code: Code::Get,
                },
                cfg.servers[rng.gen_range(0..cfg.servers.len())],
            )
        };

        let reply = match one_op(server, request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(server = %server, "operation failed: {e}");
                stats.failed += 1;
                continue;
            }
        };
        stats.completed += 1;

        if reply.key != request.key {
            tracing::warn!(sent = request.key, got = reply.key, "reply key mismatch");
            stats.mismatches += 1;
            continue;
        }
        if let (Some(shadow), true) = (&shadow, is_put) {
            let expected = match shadow.put(key, request.value)? {
                PutOutcome::Stored(_) => Code::Success,
                PutOutcome::Full => Code::Full,
            };
            if reply.code != expected || (expected == Code::Success && reply.value != request.value)
            {
                tracing::warn!(?reply, ?expected, "put reply disagrees with shadow table");
                stats.mismatches += 1;
            }
        }
    }

    stats.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        "throughput {:.3} ops/ms",
        stats.throughput_ops_per_ms()
    );

    if let Some(path) = &cfg.csv {
        write_csv(path, &stats.samples)
            .with_context(|| format!("writing samples to {}", path.display()))?;
    }

    Ok(stats)
}

async fn one_op(server: SocketAddr, request: Message) -> Result<Message> {
    let mut sock = net::connect(server).await?;
    net::write_message(&mut sock, &request).await?;
    net::read_message(&mut sock)
        .await?
        .ok_or_else(|| anyhow::anyhow!("server closed without replying"))
}

fn write_csv(path: &std::path::Path, samples: &[Sample]) -> Result<()> {
    let mut out = String::from("requests, latency (ms)\n");
    for s in samples {
        out.push_str(&format!("{}, {:.3}\n", s.requests, s.latency_ms));
    }
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::Server;

    async fn spawn_standalone() -> SocketAddr {
        let mut cfg = ServerConfig::default();
        cfg.listen = "127.0.0.1:0".parse().unwrap();
        let server = Server::bind(cfg).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        addr
    }

    #[tokio::test]
    async fn workload_completes_and_verifies() {
        let addr = spawn_standalone().await;
        let cfg = ClientConfig {
            servers: vec![addr],
            ops: 120,
            put_percent: 50,
            sample_every: 40,
            csv: None,
            verify: true,
        };
        let stats = run(&cfg).await.unwrap();
        assert_eq!(stats.completed, 120);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.mismatches, 0);
        assert_eq!(stats.puts + stats.gets, 120);
        assert_eq!(stats.samples.len(), 2);
    }

    #[tokio::test]
    async fn csv_samples_are_written() {
        let addr = spawn_standalone().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client_samples.csv");
        let cfg = ClientConfig {
            servers: vec![addr],
            ops: 60,
            put_percent: 10,
            sample_every: 20,
            csv: Some(path.clone()),
            verify: false,
        };
        run(&cfg).await.unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        let mut lines = body.lines();
        assert_eq!(lines.next(), Some("requests, latency (ms)"));
        assert_eq!(lines.count(), 2);
    }
}

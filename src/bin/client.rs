use mirrorkv::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = match ClientConfig::from_args(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!(
                "Usage: mirrorkv-client --server ADDR:PORT [--server ADDR:PORT]... \
                 [--ops N] [--put-percent P] [--sample N] [--csv PATH] [--verify]"
            );
            std::process::exit(1);
        }
    };

    let stats = mirrorkv::client::run(&cfg).await?;
    println!(
        "{} ops in {:.1} ms ({:.3} ops/ms), {} failed",
        stats.completed,
        stats.elapsed_ms,
        stats.throughput_ops_per_ms(),
        stats.failed
    );
    Ok(())
}

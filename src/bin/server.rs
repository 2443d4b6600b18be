use mirrorkv::{Server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = match ServerConfig::from_args(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!(
                "Usage: mirrorkv-server --primary|--backup --listen ADDR:PORT \
                 [--peer ADDR:PORT]... [--node-id N] [--buckets N] [--capacity N] \
                 [--slot-width N] [--array] [--workers N] [--replicate-first] [--preload]"
            );
            std::process::exit(1);
        }
    };

    let server = Server::bind(cfg).await?;
    server.serve().await
}

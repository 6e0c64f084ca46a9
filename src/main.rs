use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

use nbd_engine::proto::TCP_PORT;
use nbd_engine::{Blocks, ExportConfig, ExportRegistry, MemBlocks, Server, ServerConfig};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Fail instead of creating a missing backing file
    #[clap(long)]
    no_create: bool,

    /// Serve a sparse in-memory disk instead of a file
    #[clap(long, conflicts_with = "no-create")]
    memory: bool,

    #[clap(long, default_value = "default")]
    export: String,

    #[clap(long)]
    description: Option<String>,

    /// Export size in MiB
    #[clap(short, long, default_value_t = 10)]
    size: usize,

    #[clap(long)]
    read_only: bool,

    /// Treat every write as FUA
    #[clap(long)]
    writethrough: bool,

    #[clap(long)]
    multi_conn: bool,

    /// Offer the qemu:allocation-depth meta context
    #[clap(long)]
    allocation_depth: bool,

    #[clap(long, default_value = "0.0.0.0")]
    bind: String,

    #[clap(short, long, default_value_t = TCP_PORT)]
    port: u16,

    /// Seconds a client may spend negotiating (0 to wait forever)
    #[clap(long, default_value_t = 10)]
    handshake_timeout: u64,

    /// Requests executed concurrently per connection
    #[clap(long, default_value_t = 16)]
    max_in_flight: usize,

    #[clap(default_value = "disk.img")]
    filename: String,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    let size_bytes = args.size as u64 * 1024 * 1024;

    let blocks: Arc<dyn Blocks> = if args.memory {
        Arc::new(MemBlocks::sparse(size_bytes))
    } else {
        let file = OpenOptions::new()
            .read(true)
            .write(!args.read_only)
            .create(!args.no_create && !args.read_only)
            .open(&args.filename)
            .wrap_err_with(|| format!("opening {}", args.filename))?;
        if !args.read_only {
            file.set_len(size_bytes)?;
        }
        Arc::new(file)
    };

    let registry = Arc::new(ExportRegistry::new());
    registry.create(
        ExportConfig {
            name: args.export,
            description: args.description,
            read_only: args.read_only,
            writethrough: args.writethrough,
            multi_conn: args.multi_conn,
            allocation_depth: args.allocation_depth,
            bitmaps: vec![],
        },
        blocks,
    )?;

    let timeout = match args.handshake_timeout {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let config = ServerConfig::default()
        .with_handshake_timeout(timeout)
        .with_max_in_flight(args.max_in_flight);
    Server::new(registry, config).start((args.bind.as_str(), args.port))?;
    Ok(())
}

use std::net::TcpStream;

use clap::{ArgEnum, Parser};
use color_eyre::eyre::{ensure, WrapErr};
use color_eyre::Result;

use nbd_engine::proto::{CmdFlags, Extent, Mode, STATE_HOLE, STATE_ZERO, TCP_PORT};
use nbd_engine::{list_exports, Channel, Client, ClientOptions};

/// Largest range asked for in one block status request.
const MAP_CHUNK: u64 = 1 << 30;

#[derive(ArgEnum, Clone, Copy, Debug)]
enum MaxMode {
    Simple,
    Structured,
    Extended,
}

impl From<MaxMode> for Mode {
    fn from(m: MaxMode) -> Self {
        match m {
            MaxMode::Simple => Mode::Simple,
            MaxMode::Structured => Mode::Structured,
            MaxMode::Extended => Mode::Extended,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    #[clap(long, default_value = "localhost")]
    host: String,

    #[clap(short, long, default_value_t = TCP_PORT)]
    port: u16,

    #[clap(long, default_value = "default")]
    export: String,

    /// List the server's exports and exit
    #[clap(long)]
    list: bool,

    /// Print the allocation map of the export
    #[clap(long, conflicts_with = "list")]
    map: bool,

    /// Highest negotiation mode to request
    #[clap(long, arg_enum, default_value = "extended")]
    max_mode: MaxMode,
}

fn describe(e: &Extent) -> &'static str {
    match (e.flags & STATE_HOLE != 0, e.flags & STATE_ZERO != 0) {
        (true, true) => "hole,zero",
        (true, false) => "hole",
        (false, true) => "zero",
        (false, false) => "data",
    }
}

fn list(args: &Args, opts: &ClientOptions) -> Result<()> {
    let stream = TcpStream::connect((args.host.as_str(), args.port))
        .wrap_err_with(|| format!("connecting to {}:{}", args.host, args.port))?;
    for export in list_exports(Channel::tcp(stream)?, opts)? {
        println!("export: {}", export.name);
        if let Some(desc) = &export.description {
            println!("  description: {desc}");
        }
        match &export.info {
            Some(info) => {
                println!("  size: {}", info.size);
                println!("  flags: {:?}", info.flags);
                println!(
                    "  block sizes: min {} preferred {} max {}",
                    info.min_block, info.preferred_block, info.max_block
                );
            }
            None => println!("  (no details available)"),
        }
        for ctx in &export.contexts {
            println!("  meta context: {ctx}");
        }
    }
    Ok(())
}

fn map(client: &mut Client) -> Result<()> {
    let size = client.size();
    let mut off = 0;
    while off < size {
        let len = (size - off).min(MAP_CHUNK);
        let extents = client.block_status(off, len, CmdFlags::empty())?;
        ensure!(!extents.is_empty(), "no extents returned at offset {off}");
        for e in extents {
            let len = e.length.min(size - off);
            println!("{off:>16} {len:>16} {:>4} {}", e.flags, describe(&e));
            off += len;
            if off >= size {
                break;
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    let mut opts = ClientOptions::new(args.export.clone()).with_max_mode(args.max_mode.into());

    if args.list {
        return list(&args, &opts);
    }
    if args.map {
        opts = opts.with_block_status();
    }

    let mut client = Client::connect(&args.host, args.port, &opts)
        .wrap_err("connecting to nbd server")?;
    if args.map {
        map(&mut client)?;
    } else {
        let info = client.info();
        println!("export: {}", info.name);
        println!("size: {}", info.size);
        println!("flags: {:?}", info.flags);
        println!("mode: {:?}", client.mode());
    }
    client.disconnect()?;
    Ok(())
}
